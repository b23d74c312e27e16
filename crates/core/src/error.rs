use crate::types::ExperimentStatus;
use thiserror::Error;
use uuid::Uuid;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine error taxonomy. The first eight variants are recoverable branch
/// conditions callers are expected to match on; `NotTargeted` and
/// `TrafficExcluded` mean "serve the default experience".
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(Uuid),

    #[error("Experiment {0} is not accepting traffic")]
    ExperimentUnavailable(Uuid),

    #[error("Visitor does not match targeting rules")]
    NotTargeted,

    #[error("Visitor excluded by traffic allocation")]
    TrafficExcluded,

    #[error("No assignment for visitor {visitor_id} in experiment {experiment_id}")]
    AssignmentNotFound {
        experiment_id: Uuid,
        visitor_id: String,
    },

    #[error("Experiment {0} has no control variant")]
    NoControlVariant(Uuid),

    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("Feature flag not found: {0}")]
    FlagNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

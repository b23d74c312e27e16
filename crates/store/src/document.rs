//! Document-store seam for experiment and flag persistence.
//!
//! The managed document store is an external collaborator; these traits
//! model its round-trips as independent async calls with no transaction
//! spanning them. Implementations must honor two contracts the engine's
//! consistency story rests on: `insert_assignment` is a conditional insert
//! unique on (experiment_id, visitor_id), and `increment_variant_metrics`
//! applies atomic counter increments rather than rewriting the experiment
//! document.

use async_trait::async_trait;
use stagepass_core::types::{Assignment, Experiment, FeatureFlag};
use stagepass_core::EngineResult;
use uuid::Uuid;

/// Outcome of a conditional assignment insert.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already holds the (experiment, visitor) slot; carries
    /// the record that won.
    Conflict(Assignment),
}

/// Counter deltas applied to one variant's metric fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsDelta {
    pub visitors: u64,
    pub conversions: u64,
    pub revenue: f64,
}

impl MetricsDelta {
    pub fn visitor() -> Self {
        Self {
            visitors: 1,
            ..Default::default()
        }
    }

    pub fn conversion(revenue: Option<f64>) -> Self {
        Self {
            conversions: 1,
            revenue: revenue.unwrap_or(0.0),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn get_experiment(&self, id: Uuid) -> EngineResult<Option<Experiment>>;

    /// Upsert the experiment document. Configuration writes only; metric
    /// counters go through `increment_variant_metrics`.
    async fn put_experiment(&self, experiment: &Experiment) -> EngineResult<()>;

    /// All experiments for an owner, newest first.
    async fn list_experiments(&self, owner_id: Uuid) -> EngineResult<Vec<Experiment>>;

    async fn find_assignment(
        &self,
        experiment_id: Uuid,
        visitor_id: &str,
    ) -> EngineResult<Option<Assignment>>;

    /// Conditional insert keyed on (experiment_id, visitor_id). Two
    /// concurrent first-visit writers resolve to one `Inserted` and one
    /// `Conflict` carrying the surviving record.
    async fn insert_assignment(&self, assignment: Assignment) -> EngineResult<InsertOutcome>;

    /// Persist conversion-field updates on an existing assignment.
    async fn update_assignment(&self, assignment: &Assignment) -> EngineResult<()>;

    /// Apply counter deltas to one variant's metrics as atomic field
    /// increments.
    async fn increment_variant_metrics(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        delta: MetricsDelta,
    ) -> EngineResult<()>;
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn get_flag(&self, id: Uuid) -> EngineResult<Option<FeatureFlag>>;

    /// Lookup by the (owner, key) unique pair.
    async fn find_flag(&self, owner_id: Uuid, key: &str) -> EngineResult<Option<FeatureFlag>>;

    async fn put_flag(&self, flag: &FeatureFlag) -> EngineResult<()>;

    /// All flags for an owner, sorted by key.
    async fn list_flags(&self, owner_id: Uuid) -> EngineResult<Vec<FeatureFlag>>;

    async fn delete_flag(&self, id: Uuid) -> EngineResult<bool>;
}

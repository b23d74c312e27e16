//! Experimentation engine — deterministic visitor bucketing, audience
//! targeting, experiment lifecycle, and approximate significance analysis
//! for the StagePass promoter back office.

pub mod bucketing;
pub mod progress;
pub mod rules;
pub mod selector;
pub mod service;
pub mod stats;

pub use progress::{ExperimentProgress, VariantStats};
pub use service::{
    AssignmentOutcome, CreateExperimentRequest, ExperimentPatch, ExperimentService,
    ExperimentStats, VariantSpec,
};

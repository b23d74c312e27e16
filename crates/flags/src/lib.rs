//! Feature flags — percentage rollout, rule targeting, and scheduled
//! enablement windows for the StagePass promoter back office.

pub mod evaluator;
pub mod service;

pub use evaluator::FlagEvaluation;
pub use service::{CreateFlagRequest, FlagService};

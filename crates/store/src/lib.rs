pub mod document;
pub mod memory;

pub use document::{ExperimentStore, FlagStore, InsertOutcome, MetricsDelta};
pub use memory::MemoryStore;

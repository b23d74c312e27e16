//! In-memory document store backed by DashMap.
//!
//! Production: replace with the managed document store client. This keeps
//! the same API surface for development and testing, including the
//! conditional-insert and atomic-increment contracts.

use crate::document::{ExperimentStore, FlagStore, InsertOutcome, MetricsDelta};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stagepass_core::types::{Assignment, Experiment, FeatureFlag};
use stagepass_core::{EngineError, EngineResult};
use tracing::info;
use uuid::Uuid;

/// Thread-safe in-memory store for experiments, assignments, and flags.
pub struct MemoryStore {
    experiments: DashMap<Uuid, Experiment>,
    assignments: DashMap<Uuid, Assignment>,
    /// Uniqueness index: (experiment_id, visitor_id) -> assignment id.
    assignment_index: DashMap<(Uuid, String), Uuid>,
    flags: DashMap<Uuid, FeatureFlag>,
    /// Uniqueness index: (owner_id, key) -> flag id.
    flag_index: DashMap<(Uuid, String), Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Document store initialized (in-memory, development mode)");
        Self {
            experiments: DashMap::new(),
            assignments: DashMap::new(),
            assignment_index: DashMap::new(),
            flags: DashMap::new(),
            flag_index: DashMap::new(),
        }
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExperimentStore for MemoryStore {
    async fn get_experiment(&self, id: Uuid) -> EngineResult<Option<Experiment>> {
        Ok(self.experiments.get(&id).map(|r| r.value().clone()))
    }

    async fn put_experiment(&self, experiment: &Experiment) -> EngineResult<()> {
        self.experiments.insert(experiment.id, experiment.clone());
        Ok(())
    }

    async fn list_experiments(&self, owner_id: Uuid) -> EngineResult<Vec<Experiment>> {
        let mut experiments: Vec<Experiment> = self
            .experiments
            .iter()
            .filter(|r| r.value().owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        experiments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(experiments)
    }

    async fn find_assignment(
        &self,
        experiment_id: Uuid,
        visitor_id: &str,
    ) -> EngineResult<Option<Assignment>> {
        let Some(id) = self
            .assignment_index
            .get(&(experiment_id, visitor_id.to_string()))
            .map(|r| *r.value())
        else {
            return Ok(None);
        };
        Ok(self.assignments.get(&id).map(|r| r.value().clone()))
    }

    async fn insert_assignment(&self, assignment: Assignment) -> EngineResult<InsertOutcome> {
        let key = (assignment.experiment_id, assignment.visitor_id.clone());
        // The entry guard holds the index shard lock, so a concurrent
        // duplicate insert serializes here and loses.
        match self.assignment_index.entry(key) {
            Entry::Occupied(slot) => {
                let existing_id = *slot.get();
                let existing = self
                    .assignments
                    .get(&existing_id)
                    .map(|r| r.value().clone())
                    .ok_or_else(|| {
                        EngineError::Store(format!(
                            "assignment index points at missing record {existing_id}"
                        ))
                    })?;
                Ok(InsertOutcome::Conflict(existing))
            }
            Entry::Vacant(slot) => {
                let assignment_id = assignment.id;
                self.assignments.insert(assignment_id, assignment);
                slot.insert(assignment_id);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn update_assignment(&self, assignment: &Assignment) -> EngineResult<()> {
        let mut entry = self.assignments.get_mut(&assignment.id).ok_or_else(|| {
            EngineError::Store(format!("assignment {} does not exist", assignment.id))
        })?;
        *entry.value_mut() = assignment.clone();
        Ok(())
    }

    async fn increment_variant_metrics(
        &self,
        experiment_id: Uuid,
        variant_id: Uuid,
        delta: MetricsDelta,
    ) -> EngineResult<()> {
        let mut entry = self
            .experiments
            .get_mut(&experiment_id)
            .ok_or(EngineError::ExperimentNotFound(experiment_id))?;
        let variant = entry
            .value_mut()
            .variants
            .iter_mut()
            .find(|v| v.id == variant_id)
            .ok_or_else(|| {
                EngineError::Store(format!(
                    "variant {variant_id} not found on experiment {experiment_id}"
                ))
            })?;
        // Mutation under the shard lock stands in for the store's atomic
        // field increment.
        variant.metrics.visitors += delta.visitors;
        variant.metrics.conversions += delta.conversions;
        variant.metrics.revenue += delta.revenue;
        Ok(())
    }
}

#[async_trait]
impl FlagStore for MemoryStore {
    async fn get_flag(&self, id: Uuid) -> EngineResult<Option<FeatureFlag>> {
        Ok(self.flags.get(&id).map(|r| r.value().clone()))
    }

    async fn find_flag(&self, owner_id: Uuid, key: &str) -> EngineResult<Option<FeatureFlag>> {
        let Some(id) = self
            .flag_index
            .get(&(owner_id, key.to_string()))
            .map(|r| *r.value())
        else {
            return Ok(None);
        };
        Ok(self.flags.get(&id).map(|r| r.value().clone()))
    }

    async fn put_flag(&self, flag: &FeatureFlag) -> EngineResult<()> {
        self.flag_index
            .insert((flag.owner_id, flag.key.clone()), flag.id);
        self.flags.insert(flag.id, flag.clone());
        Ok(())
    }

    async fn list_flags(&self, owner_id: Uuid) -> EngineResult<Vec<FeatureFlag>> {
        let mut flags: Vec<FeatureFlag> = self
            .flags
            .iter()
            .filter(|r| r.value().owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        flags.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(flags)
    }

    async fn delete_flag(&self, id: Uuid) -> EngineResult<bool> {
        let Some((_, flag)) = self.flags.remove(&id) else {
            return Ok(false);
        };
        self.flag_index.remove(&(flag.owner_id, flag.key));
        Ok(true)
    }
}

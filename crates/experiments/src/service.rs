//! Experiment lifecycle management: creation, status transitions, stable
//! visitor assignment, conversion recording, and results snapshots.
//!
//! The service is stateless between calls; durable state lives behind the
//! `ExperimentStore` seam and the only in-process state is a short-TTL
//! read cache. No locks are held across store round-trips.

use crate::progress::{self, ExperimentProgress, VariantStats};
use crate::{bucketing, rules, selector, stats};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stagepass_cache::TtlCache;
use stagepass_core::config::CacheConfig;
use stagepass_core::events::{EngineEvent, EngineEventType, EventSink};
use stagepass_core::types::*;
use stagepass_core::{EngineError, EngineResult};
use stagepass_store::{ExperimentStore, InsertOutcome, MetricsDelta};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// ─── Request Shapes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperimentRequest {
    pub owner_id: Uuid,
    pub name: String,
    pub hypothesis: Option<String>,
    pub experiment_type: ExperimentType,
    pub variants: Vec<VariantSpec>,
    #[serde(default)]
    pub targeting: TargetingConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub schedule: Option<Schedule>,
    pub settings: Option<ExperimentSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
}

/// Partial update. Structural variant changes are draft-only; weight
/// tweaks on existing variants are allowed while running so traffic can be
/// rebalanced without touching prior assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentPatch {
    pub name: Option<String>,
    pub hypothesis: Option<String>,
    pub variants: Option<Vec<VariantSpec>>,
    pub variant_weights: Option<HashMap<Uuid, f64>>,
    pub targeting: Option<TargetingConfig>,
    pub traffic: Option<TrafficConfig>,
    pub goals: Option<Vec<Goal>>,
    pub schedule: Option<Schedule>,
    pub settings: Option<ExperimentSettings>,
}

/// Result of a variant request: the variant to render plus the durable
/// assignment backing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentOutcome {
    pub variant: Variant,
    pub assignment: Assignment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentStats {
    pub experiment: Experiment,
    pub variant_stats: Vec<VariantStats>,
    pub progress: ExperimentProgress,
}

// ─── Service ────────────────────────────────────────────────────────────

pub struct ExperimentService {
    store: Arc<dyn ExperimentStore>,
    events: Arc<dyn EventSink>,
    cache: TtlCache<Uuid, Experiment>,
}

impl ExperimentService {
    pub fn new(store: Arc<dyn ExperimentStore>, events: Arc<dyn EventSink>) -> Self {
        Self::with_config(store, events, &CacheConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ExperimentStore>,
        events: Arc<dyn EventSink>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            store,
            events,
            cache: TtlCache::new(cache.experiment_ttl_secs, cache.max_entries),
        }
    }

    // ─── CRUD ───────────────────────────────────────────────────────────

    pub async fn create_experiment(
        &self,
        req: CreateExperimentRequest,
    ) -> EngineResult<Experiment> {
        validate_variant_specs(&req.variants)?;
        validate_traffic(&req.traffic)?;

        let now = Utc::now();
        let experiment = Experiment {
            id: Uuid::new_v4(),
            owner_id: req.owner_id,
            name: req.name,
            hypothesis: req.hypothesis,
            experiment_type: req.experiment_type,
            status: ExperimentStatus::Draft,
            variants: build_variants(req.variants),
            targeting: req.targeting,
            traffic: req.traffic,
            goals: req.goals,
            schedule: req.schedule,
            results: None,
            settings: req.settings.unwrap_or_default(),
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };
        self.store.put_experiment(&experiment).await?;

        info!(experiment_id = %experiment.id, name = %experiment.name, "Experiment created");
        metrics::counter!("experiments.created").increment(1);
        self.events.emit(
            EngineEvent::new(EngineEventType::ExperimentCreated)
                .owner(experiment.owner_id)
                .experiment(experiment.id),
        );
        Ok(experiment)
    }

    /// Cached read; mutating paths read the store directly instead.
    pub async fn get_experiment(&self, id: Uuid) -> EngineResult<Experiment> {
        if let Some(experiment) = self.cache.get(&id) {
            metrics::counter!("experiments.cache.hit").increment(1);
            return Ok(experiment);
        }
        metrics::counter!("experiments.cache.miss").increment(1);
        let experiment = self.load(id).await?;
        self.cache.put(id, experiment.clone());
        Ok(experiment)
    }

    pub async fn list_experiments(&self, owner_id: Uuid) -> EngineResult<Vec<Experiment>> {
        self.store.list_experiments(owner_id).await
    }

    pub async fn update_experiment(
        &self,
        id: Uuid,
        patch: ExperimentPatch,
    ) -> EngineResult<Experiment> {
        let mut experiment = self.load(id).await?;

        match experiment.status {
            ExperimentStatus::Completed | ExperimentStatus::Archived => {
                return Err(EngineError::Validation(format!(
                    "experiment {id} is {:?} and can no longer be edited",
                    experiment.status
                )));
            }
            _ => {}
        }

        if let Some(specs) = patch.variants {
            // Swapping the variant list re-rolls variant ids and resets
            // counters; only drafts may do that.
            if experiment.status != ExperimentStatus::Draft {
                return Err(EngineError::Validation(
                    "variant structure can only change while the experiment is a draft".into(),
                ));
            }
            validate_variant_specs(&specs)?;
            experiment.variants = build_variants(specs);
        }

        if let Some(weights) = patch.variant_weights {
            for (variant_id, weight) in &weights {
                if *weight < 0.0 {
                    return Err(EngineError::Validation(format!(
                        "variant weight must be non-negative, got {weight}"
                    )));
                }
                let variant = experiment
                    .variants
                    .iter_mut()
                    .find(|v| v.id == *variant_id)
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "variant {variant_id} not found on experiment {id}"
                        ))
                    })?;
                variant.weight = *weight;
            }
        }

        if let Some(name) = patch.name {
            experiment.name = name;
        }
        if let Some(hypothesis) = patch.hypothesis {
            experiment.hypothesis = Some(hypothesis);
        }
        if let Some(targeting) = patch.targeting {
            experiment.targeting = targeting;
        }
        if let Some(traffic) = patch.traffic {
            validate_traffic(&traffic)?;
            experiment.traffic = traffic;
        }
        if let Some(goals) = patch.goals {
            experiment.goals = goals;
        }
        if let Some(schedule) = patch.schedule {
            experiment.schedule = Some(schedule);
        }
        if let Some(settings) = patch.settings {
            experiment.settings = settings;
        }

        experiment.updated_at = Utc::now();
        self.store.put_experiment(&experiment).await?;
        self.cache.invalidate(&id);
        info!(experiment_id = %id, "Experiment updated");
        Ok(experiment)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    pub async fn start_experiment(&self, id: Uuid) -> EngineResult<Experiment> {
        self.transition(id, ExperimentStatus::Running, EngineEventType::ExperimentStarted)
            .await
    }

    pub async fn pause_experiment(&self, id: Uuid) -> EngineResult<Experiment> {
        self.transition(id, ExperimentStatus::Paused, EngineEventType::ExperimentPaused)
            .await
    }

    pub async fn resume_experiment(&self, id: Uuid) -> EngineResult<Experiment> {
        self.transition(id, ExperimentStatus::Running, EngineEventType::ExperimentResumed)
            .await
    }

    pub async fn archive_experiment(&self, id: Uuid) -> EngineResult<Experiment> {
        self.transition(id, ExperimentStatus::Archived, EngineEventType::ExperimentArchived)
            .await
    }

    /// Complete the experiment, freezing a results snapshot. An explicit
    /// `winner` overrides the computed one — the single sanctioned
    /// hand-edit of results.
    pub async fn complete_experiment(
        &self,
        id: Uuid,
        winner: Option<Uuid>,
    ) -> EngineResult<Experiment> {
        let mut experiment = self.load(id).await?;
        if !can_transition(experiment.status, ExperimentStatus::Completed) {
            return Err(EngineError::InvalidTransition {
                from: experiment.status,
                to: ExperimentStatus::Completed,
            });
        }

        let mut results = stats::analyze(&experiment)?;
        if let Some(winner_id) = winner {
            let variant = experiment.variant(winner_id).ok_or_else(|| {
                EngineError::Validation(format!(
                    "winner {winner_id} is not a variant of experiment {id}"
                ))
            })?;
            if results.winner != Some(winner_id) {
                results.summary =
                    format!("Winner forced to {} at completion.", variant.name);
                results.recommended_action = format!("Roll out {}.", variant.name);
                results.winner = Some(winner_id);
            }
        }

        let now = Utc::now();
        experiment.results = Some(results);
        experiment.status = ExperimentStatus::Completed;
        experiment.completed_at = Some(now);
        experiment.updated_at = now;
        self.store.put_experiment(&experiment).await?;
        self.cache.invalidate(&id);

        info!(experiment_id = %id, winner = ?experiment.results.as_ref().and_then(|r| r.winner), "Experiment completed");
        self.events.emit(
            EngineEvent::new(EngineEventType::ExperimentCompleted)
                .owner(experiment.owner_id)
                .experiment(id),
        );
        Ok(experiment)
    }

    // ─── Assignment ─────────────────────────────────────────────────────

    /// Resolve the variant for a visitor, creating the assignment on first
    /// sight. Returning visitors get their original variant back
    /// unconditionally; targeting and traffic are never re-evaluated.
    pub async fn get_or_create_assignment(
        &self,
        experiment_id: Uuid,
        visitor_id: &str,
        customer_id: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> EngineResult<AssignmentOutcome> {
        let experiment = self.get_experiment(experiment_id).await?;

        if experiment.status != ExperimentStatus::Running {
            return Err(EngineError::ExperimentUnavailable(experiment_id));
        }
        if let Some(schedule) = &experiment.schedule {
            let now = Utc::now();
            let before_start = schedule.start_at.is_some_and(|start| now < start);
            let after_end = schedule.end_at.is_some_and(|end| now > end);
            if before_start || after_end {
                return Err(EngineError::ExperimentUnavailable(experiment_id));
            }
        }

        if let Some(existing) = self.store.find_assignment(experiment_id, visitor_id).await? {
            let variant = self.resolve_variant(&experiment, existing.variant_id)?;
            return Ok(AssignmentOutcome {
                variant,
                assignment: existing,
            });
        }

        let metadata = metadata.unwrap_or_default();
        let ctx = EvalContext {
            visitor_id: visitor_id.to_string(),
            attributes: metadata.clone(),
        };

        if !rules::evaluate(&experiment.targeting, &ctx) {
            metrics::counter!("experiments.not_targeted").increment(1);
            return Err(EngineError::NotTargeted);
        }

        let traffic_position =
            bucketing::bucket_percent(&bucketing::traffic_seed(experiment_id, visitor_id));
        if traffic_position >= experiment.traffic.percentage {
            metrics::counter!("experiments.traffic_excluded").increment(1);
            return Err(EngineError::TrafficExcluded);
        }

        let variant_bucket =
            bucketing::bucket(&bucketing::variant_seed(experiment_id, visitor_id));
        let variant = selector::select(&experiment.variants, variant_bucket)
            .cloned()
            .ok_or_else(|| {
                EngineError::Validation(format!("experiment {experiment_id} has no variants"))
            })?;

        let assignment = Assignment {
            id: Uuid::new_v4(),
            experiment_id,
            visitor_id: visitor_id.to_string(),
            customer_id,
            variant_id: variant.id,
            assigned_at: Utc::now(),
            converted: false,
            conversion_at: None,
            revenue: None,
            metadata,
        };

        match self.store.insert_assignment(assignment.clone()).await? {
            InsertOutcome::Inserted => {
                // Counter increments ride the cache TTL; only configuration
                // writes invalidate the cached document synchronously.
                self.store
                    .increment_variant_metrics(experiment_id, variant.id, MetricsDelta::visitor())
                    .await?;
                debug!(
                    experiment_id = %experiment_id,
                    visitor_id = visitor_id,
                    variant = %variant.name,
                    bucket = variant_bucket,
                    "Assignment created"
                );
                metrics::counter!("experiments.assignments").increment(1);
                self.events.emit(
                    EngineEvent::new(EngineEventType::AssignmentCreated)
                        .owner(experiment.owner_id)
                        .experiment(experiment_id)
                        .variant(variant.id)
                        .visitor(visitor_id),
                );
                Ok(AssignmentOutcome {
                    variant,
                    assignment,
                })
            }
            // Lost a concurrent first-visit race; the record that landed
            // first wins and no extra visitor is counted.
            InsertOutcome::Conflict(existing) => {
                let variant = self.resolve_variant(&experiment, existing.variant_id)?;
                Ok(AssignmentOutcome {
                    variant,
                    assignment: existing,
                })
            }
        }
    }

    /// Record a goal conversion for a visitor, at most once per
    /// (experiment, visitor). Duplicate goal fires are dropped so a
    /// double-fired pixel can't inflate conversions.
    pub async fn record_conversion(
        &self,
        experiment_id: Uuid,
        visitor_id: &str,
        goal_id: &str,
        revenue: Option<f64>,
        metadata: Option<HashMap<String, String>>,
    ) -> EngineResult<Assignment> {
        let mut assignment = self
            .store
            .find_assignment(experiment_id, visitor_id)
            .await?
            .ok_or_else(|| EngineError::AssignmentNotFound {
                experiment_id,
                visitor_id: visitor_id.to_string(),
            })?;

        if assignment.converted {
            debug!(
                experiment_id = %experiment_id,
                visitor_id = visitor_id,
                goal_id = goal_id,
                "Duplicate conversion ignored"
            );
            return Ok(assignment);
        }

        assignment.converted = true;
        assignment.conversion_at = Some(Utc::now());
        assignment.revenue = revenue;
        self.store.update_assignment(&assignment).await?;
        self.store
            .increment_variant_metrics(
                experiment_id,
                assignment.variant_id,
                MetricsDelta::conversion(revenue),
            )
            .await?;

        info!(
            experiment_id = %experiment_id,
            variant_id = %assignment.variant_id,
            goal_id = goal_id,
            "Conversion recorded"
        );
        metrics::counter!("experiments.conversions").increment(1);
        self.events.emit(
            EngineEvent::new(EngineEventType::ConversionRecorded)
                .experiment(experiment_id)
                .variant(assignment.variant_id)
                .visitor(visitor_id)
                .detail(serde_json::json!({
                    "goal_id": goal_id,
                    "revenue": revenue,
                    "metadata": metadata,
                })),
        );
        Ok(assignment)
    }

    // ─── Results ────────────────────────────────────────────────────────

    /// Recompute the results snapshot from current counters. Completed
    /// experiments return their frozen snapshot unchanged.
    pub async fn calculate_results(&self, id: Uuid) -> EngineResult<ExperimentResults> {
        let experiment = self.load(id).await?;

        if experiment.status == ExperimentStatus::Completed {
            if let Some(results) = experiment.results {
                return Ok(results);
            }
        }

        let results = stats::analyze(&experiment)?;
        let mut updated = experiment;
        updated.results = Some(results.clone());
        updated.updated_at = Utc::now();
        self.store.put_experiment(&updated).await?;
        self.cache.invalidate(&id);
        Ok(results)
    }

    pub async fn get_experiment_stats(&self, id: Uuid) -> EngineResult<ExperimentStats> {
        let experiment = self.load(id).await?;
        let variant_stats = progress::variant_stats(&experiment);
        let progress = progress::compute_progress(&experiment, Utc::now());
        Ok(ExperimentStats {
            experiment,
            variant_stats,
            progress,
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────

    async fn load(&self, id: Uuid) -> EngineResult<Experiment> {
        self.store
            .get_experiment(id)
            .await?
            .ok_or(EngineError::ExperimentNotFound(id))
    }

    async fn transition(
        &self,
        id: Uuid,
        to: ExperimentStatus,
        event: EngineEventType,
    ) -> EngineResult<Experiment> {
        let mut experiment = self.load(id).await?;
        if !can_transition(experiment.status, to) {
            return Err(EngineError::InvalidTransition {
                from: experiment.status,
                to,
            });
        }

        let now = Utc::now();
        if experiment.status == ExperimentStatus::Draft && to == ExperimentStatus::Running {
            experiment.started_at = Some(now);
        }
        experiment.status = to;
        experiment.updated_at = now;
        self.store.put_experiment(&experiment).await?;
        self.cache.invalidate(&id);

        info!(experiment_id = %id, status = ?to, "Experiment status changed");
        self.events.emit(
            EngineEvent::new(event)
                .owner(experiment.owner_id)
                .experiment(id),
        );
        Ok(experiment)
    }

    fn resolve_variant(
        &self,
        experiment: &Experiment,
        variant_id: Uuid,
    ) -> EngineResult<Variant> {
        experiment.variant(variant_id).cloned().ok_or_else(|| {
            EngineError::Store(format!(
                "assignment references variant {variant_id} missing from experiment {}",
                experiment.id
            ))
        })
    }
}

/// The complete transition graph. Everything else is rejected.
fn can_transition(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    use ExperimentStatus::*;
    matches!(
        (from, to),
        (Draft, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Completed)
            | (Paused, Completed)
    ) || (to == Archived && from != Archived)
}

fn build_variants(specs: Vec<VariantSpec>) -> Vec<Variant> {
    specs
        .into_iter()
        .map(|spec| Variant {
            id: Uuid::new_v4(),
            name: spec.name,
            weight: spec.weight,
            is_control: spec.is_control,
            changes: spec.changes,
            metrics: VariantMetrics::default(),
        })
        .collect()
}

fn validate_variant_specs(specs: &[VariantSpec]) -> EngineResult<()> {
    if specs.is_empty() {
        return Err(EngineError::Validation(
            "an experiment needs at least one variant".into(),
        ));
    }
    let controls = specs.iter().filter(|s| s.is_control).count();
    if controls != 1 {
        return Err(EngineError::Validation(format!(
            "exactly one control variant required, got {controls}"
        )));
    }
    if let Some(spec) = specs.iter().find(|s| s.weight < 0.0) {
        return Err(EngineError::Validation(format!(
            "variant {} has negative weight {}",
            spec.name, spec.weight
        )));
    }
    Ok(())
}

fn validate_traffic(traffic: &TrafficConfig) -> EngineResult<()> {
    if !(0.0..=100.0).contains(&traffic.percentage) {
        return Err(EngineError::Validation(format!(
            "traffic percentage must be within [0, 100], got {}",
            traffic.percentage
        )));
    }
    Ok(())
}

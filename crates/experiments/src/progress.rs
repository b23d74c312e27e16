//! Sample-size progress and completion estimates derived from stored
//! variant metrics.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use stagepass_core::types::Experiment;
use uuid::Uuid;

/// Read projection of one variant's counters for the stats screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub weight: f64,
    pub visitors: u64,
    pub conversions: u64,
    /// Conversion rate in percent.
    pub conversion_rate: f64,
    pub revenue: f64,
}

/// How far along an experiment is toward its minimum sample size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentProgress {
    pub total_visitors: u64,
    pub required_sample_size: u64,
    /// Clamped to [0, 100].
    pub percent_complete: f64,
    pub elapsed_hours: f64,
    pub visitors_per_hour: f64,
    /// Projected instant the sample-size floor is reached; `None` when the
    /// experiment is already there, hasn't started, or has no traffic yet.
    pub estimated_completion: Option<DateTime<Utc>>,
}

pub fn variant_stats(experiment: &Experiment) -> Vec<VariantStats> {
    experiment
        .variants
        .iter()
        .map(|variant| VariantStats {
            variant_id: variant.id,
            name: variant.name.clone(),
            is_control: variant.is_control,
            weight: variant.weight,
            visitors: variant.metrics.visitors,
            conversions: variant.metrics.conversions,
            conversion_rate: if variant.metrics.visitors == 0 {
                0.0
            } else {
                variant.metrics.conversions as f64 / variant.metrics.visitors as f64 * 100.0
            },
            revenue: variant.metrics.revenue,
        })
        .collect()
}

pub fn compute_progress(experiment: &Experiment, now: DateTime<Utc>) -> ExperimentProgress {
    let total_visitors = experiment.total_visitors();
    let required_sample_size = experiment.settings.min_sample_size;

    let percent_complete = if required_sample_size == 0 {
        100.0
    } else {
        (total_visitors as f64 / required_sample_size as f64 * 100.0).min(100.0)
    };

    let elapsed_hours = experiment
        .started_at
        .map(|started| ((now - started).num_seconds().max(0) as f64) / 3600.0)
        .unwrap_or(0.0);

    let visitors_per_hour = if elapsed_hours > 0.0 {
        total_visitors as f64 / elapsed_hours
    } else {
        0.0
    };

    let remaining = required_sample_size.saturating_sub(total_visitors);
    let estimated_completion = if remaining == 0 || visitors_per_hour <= 0.0 {
        None
    } else {
        let hours_left = remaining as f64 / visitors_per_hour;
        Some(now + Duration::seconds((hours_left * 3600.0) as i64))
    };

    ExperimentProgress {
        total_visitors,
        required_sample_size,
        percent_complete,
        elapsed_hours,
        visitors_per_hour,
        estimated_completion,
    }
}

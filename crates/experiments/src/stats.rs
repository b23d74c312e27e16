//! Statistical analysis of experiment results.
//!
//! The p-value comes from a closed-form logistic approximation to the
//! normal CDF (`1 - 0.5 * (1 + tanh(0.7978845608 * z))`), not an exact
//! z-test, and the confidence intervals are the ad-hoc normal
//! approximation on percentage rates. Live experiments depend on these
//! exact outputs, so the approximations are load-bearing; do not swap in
//! exact statistical methods.

use chrono::Utc;
use stagepass_core::types::{Experiment, ExperimentResults, Variant, VariantAnalysis};
use stagepass_core::{EngineError, EngineResult};

/// sqrt(2/pi), the slope of the tanh approximation to the normal CDF.
const NORMAL_CDF_SLOPE: f64 = 0.797_884_560_8;
/// z multiplier for the 95% interval around a variant's rate.
const CI_Z: f64 = 1.96;

/// Compute a full results snapshot for an experiment.
pub fn analyze(experiment: &Experiment) -> EngineResult<ExperimentResults> {
    let control = experiment
        .control()
        .ok_or(EngineError::NoControlVariant(experiment.id))?;

    let control_rate = rate_percent(control);
    let confidence_level = experiment.settings.confidence_level;

    let mut analyses: Vec<VariantAnalysis> = experiment
        .variants
        .iter()
        .map(|variant| {
            let rate = rate_percent(variant);
            let confidence = if variant.is_control {
                0.0
            } else {
                confidence_vs_control(control, variant)
            };
            VariantAnalysis {
                variant_id: variant.id,
                name: variant.name.clone(),
                is_control: variant.is_control,
                visitors: variant.metrics.visitors,
                conversions: variant.metrics.conversions,
                conversion_rate: rate,
                confidence_interval: confidence_interval(rate, variant.metrics.visitors),
                improvement: if variant.is_control {
                    0.0
                } else {
                    improvement(control_rate, rate)
                },
                confidence,
                significant: !variant.is_control && confidence >= confidence_level,
                probability_to_be_best: 0.0,
                expected_loss: 0.0,
            }
        })
        .collect();

    // Simplified best-variant heuristics, not Bayesian quantities.
    let best_treatment_prob = analyses
        .iter()
        .filter(|a| !a.is_control)
        .map(|a| a.confidence / 100.0)
        .fold(0.0, f64::max);
    let best_treatment_rate = analyses
        .iter()
        .filter(|a| !a.is_control)
        .map(|a| a.conversion_rate)
        .fold(0.0, f64::max);
    for analysis in &mut analyses {
        if analysis.is_control {
            analysis.probability_to_be_best = (1.0 - best_treatment_prob).max(0.0);
            analysis.expected_loss = (1.0 - analysis.probability_to_be_best)
                * (best_treatment_rate - analysis.conversion_rate).max(0.0);
        } else {
            analysis.probability_to_be_best = analysis.confidence / 100.0;
            analysis.expected_loss = (1.0 - analysis.probability_to_be_best)
                * (control_rate - analysis.conversion_rate).max(0.0);
        }
    }

    let sample_size = experiment.total_visitors();
    let min_sample_size = experiment.settings.min_sample_size;
    let needs_more_data = sample_size < min_sample_size;

    let best_confidence = analyses
        .iter()
        .filter(|a| !a.is_control)
        .map(|a| a.confidence)
        .fold(0.0, f64::max);

    // An apparent early lead is not a winner: the sample-size floor guards
    // against peeking-driven false positives.
    let winner = if needs_more_data {
        None
    } else {
        analyses
            .iter()
            .filter(|a| !a.is_control && a.significant)
            .max_by(|x, y| x.confidence.total_cmp(&y.confidence))
            .map(|a| (a.variant_id, a.name.clone(), a.improvement, a.confidence))
    };

    let (summary, recommended_action) = match (&winner, needs_more_data) {
        (_, true) => (
            format!(
                "Needs more data: {sample_size} of {min_sample_size} required visitors collected."
            ),
            "Keep the experiment running until the minimum sample size is reached.".to_string(),
        ),
        (Some((_, name, improvement, confidence)), false) => (
            format!(
                "Variant {name} lifts conversion by {improvement:.1}% over control at {confidence:.1}% confidence."
            ),
            format!("Roll out {name}."),
        ),
        (None, false) => (
            "No variant has reached statistical significance.".to_string(),
            "Continue the experiment or revisit the variants.".to_string(),
        ),
    };

    let runtime_hours = experiment
        .started_at
        .map(|started| ((Utc::now() - started).num_seconds().max(0) as f64) / 3600.0)
        .unwrap_or(0.0);

    Ok(ExperimentResults {
        winner: winner.as_ref().map(|(id, _, _, _)| *id),
        confidence: best_confidence,
        statistical_significance: winner.is_some(),
        sample_size,
        runtime_hours,
        variants: analyses,
        summary,
        recommended_action,
        calculated_at: Utc::now(),
    })
}

/// Conversion rate in percent; 0 when the variant has no visitors.
fn rate_percent(variant: &Variant) -> f64 {
    if variant.metrics.visitors == 0 {
        0.0
    } else {
        variant.metrics.conversions as f64 / variant.metrics.visitors as f64 * 100.0
    }
}

/// Relative lift in percent; 0 when the control rate is 0.
fn improvement(control_rate: f64, treatment_rate: f64) -> f64 {
    if control_rate == 0.0 {
        0.0
    } else {
        (treatment_rate - control_rate) / control_rate * 100.0
    }
}

/// One-sided confidence (percent) that a treatment beats control, from the
/// pooled two-proportion z statistic pushed through the tanh CDF
/// approximation.
fn confidence_vs_control(control: &Variant, treatment: &Variant) -> f64 {
    let n_control = control.metrics.visitors;
    let n_treatment = treatment.metrics.visitors;
    if n_control == 0 || n_treatment == 0 {
        return 0.0;
    }

    let p_control = control.metrics.conversions as f64 / n_control as f64;
    let p_treatment = treatment.metrics.conversions as f64 / n_treatment as f64;
    let pooled = (control.metrics.conversions + treatment.metrics.conversions) as f64
        / (n_control + n_treatment) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / n_control as f64 + 1.0 / n_treatment as f64)).sqrt();
    if se == 0.0 {
        return 0.0;
    }

    let z = (p_treatment - p_control) / se;
    let p_value = 1.0 - 0.5 * (1.0 + (NORMAL_CDF_SLOPE * z).tanh());
    (1.0 - p_value) * 100.0
}

/// 95% interval around a percentage rate, clamped to [0, 100].
fn confidence_interval(rate: f64, visitors: u64) -> (f64, f64) {
    let half = CI_Z * (rate * (100.0 - rate) / visitors.max(1) as f64).sqrt();
    ((rate - half).max(0.0), (rate + half).min(100.0))
}

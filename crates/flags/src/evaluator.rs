//! Feature flag evaluation.
//!
//! Decision ladder per evaluation: schedule window, then targeting rules
//! in order (each optionally gated by its own canary percentage), then the
//! global rollout gate, then the declared default variant, then the flag
//! default. The two percentage levels are independent: the global gate
//! caps overall exposure while a per-rule canary dials in one audience.

use chrono::{DateTime, Utc};
use serde_json::Value;
use stagepass_core::types::{EvalContext, FeatureFlag, FlagType};
use stagepass_experiments::{bucketing, rules};
use tracing::debug;

/// Result of evaluating a flag for one visitor.
#[derive(Debug, Clone)]
pub struct FlagEvaluation {
    pub flag_key: String,
    pub value: Value,
    pub reason: String,
}

pub fn evaluate(flag: &FeatureFlag, ctx: &EvalContext, now: DateTime<Utc>) -> FlagEvaluation {
    if let Some(schedule) = &flag.schedule {
        let before_window = schedule.start_at.is_some_and(|start| now < start);
        let after_window = schedule.end_at.is_some_and(|end| now > end);
        if before_window || after_window {
            return resolved(flag, flag.default_value.clone(), "outside schedule window");
        }
    }

    // One bucket position per (flag, visitor) drives both the per-rule
    // canaries and the global rollout gate.
    let position = bucketing::bucket_percent(&bucketing::rollout_seed(&flag.key, &ctx.visitor_id));

    for (index, flag_rule) in flag.targeting.rules.iter().enumerate() {
        if !rules::rule_matches(&flag_rule.rule, ctx) {
            continue;
        }
        if let Some(pct) = flag_rule.percentage {
            if position >= pct {
                continue;
            }
        }
        match flag_rule.variant.and_then(|id| flag.variant(id)) {
            Some(variant) => {
                return resolved(flag, variant.value.clone(), &format!("rule {index} matched"));
            }
            None => {
                debug!(
                    flag_key = %flag.key,
                    rule_index = index,
                    "Matched rule has no resolvable variant; skipping"
                );
            }
        }
    }

    if let Some(pct) = flag.targeting.percentage {
        if position >= pct {
            return resolved(flag, flag.default_value.clone(), "outside rollout percentage");
        }
    }

    if let Some(variant) = flag
        .targeting
        .default_variant
        .and_then(|id| flag.variant(id))
    {
        return resolved(flag, variant.value.clone(), "default variant");
    }
    if !flag.default_value.is_null() {
        return resolved(flag, flag.default_value.clone(), "default value");
    }
    if flag.flag_type == FlagType::Boolean {
        // A boolean flag that is active with no other signal is on.
        return resolved(flag, Value::Bool(true), "boolean fallback");
    }
    resolved(flag, Value::Null, "no value configured")
}

fn resolved(flag: &FeatureFlag, value: Value, reason: &str) -> FlagEvaluation {
    FlagEvaluation {
        flag_key: flag.key.clone(),
        value,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use stagepass_core::types::*;
    use uuid::Uuid;

    fn flag(key: &str) -> FeatureFlag {
        FeatureFlag {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            key: key.to_string(),
            name: key.to_string(),
            flag_type: FlagType::Boolean,
            default_value: json!(false),
            status: FlagStatus::Active,
            targeting: FlagTargeting::default(),
            variants: Vec::new(),
            schedule: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn device_rule(value: &str, variant: Option<Uuid>, percentage: Option<f64>) -> FlagRule {
        FlagRule {
            rule: TargetingRule {
                rule_type: "device".into(),
                operator: RuleOperator::Equals,
                value: json!(value),
                logic: RuleLogic::And,
            },
            variant,
            percentage,
        }
    }

    #[test]
    fn closed_schedule_window_serves_default() {
        let mut flag = flag("early_entry");
        flag.schedule = Some(Schedule {
            start_at: Some(Utc::now() + Duration::hours(1)),
            end_at: None,
        });
        let eval = evaluate(&flag, &EvalContext::new("visitor-1"), Utc::now());
        assert_eq!(eval.value, json!(false));
        assert_eq!(eval.reason, "outside schedule window");

        flag.schedule = Some(Schedule {
            start_at: None,
            end_at: Some(Utc::now() - Duration::hours(1)),
        });
        let eval = evaluate(&flag, &EvalContext::new("visitor-1"), Utc::now());
        assert_eq!(eval.reason, "outside schedule window");
    }

    #[test]
    fn zero_rollout_serves_default_to_everyone() {
        let mut flag = flag("seatmap_v2");
        flag.default_value = json!("legacy");
        flag.flag_type = FlagType::String;
        flag.targeting.percentage = Some(0.0);

        for i in 0..500 {
            let eval = evaluate(&flag, &EvalContext::new(format!("visitor-{i}")), Utc::now());
            assert_eq!(eval.value, json!("legacy"));
            assert_eq!(eval.reason, "outside rollout percentage");
        }
    }

    #[test]
    fn full_rollout_never_hits_the_gate() {
        let mut flag = flag("seatmap_v2");
        flag.targeting.percentage = Some(100.0);

        for i in 0..500 {
            let eval = evaluate(&flag, &EvalContext::new(format!("visitor-{i}")), Utc::now());
            assert_ne!(eval.reason, "outside rollout percentage");
        }
    }

    #[test]
    fn matching_rule_serves_its_variant() {
        let mut flag = flag("checkout_banner");
        let variant_id = Uuid::new_v4();
        flag.variants = vec![FlagVariant {
            id: variant_id,
            name: "mobile banner".into(),
            value: json!("compact"),
            weight: 100.0,
        }];
        flag.targeting.rules = vec![device_rule("mobile", Some(variant_id), None)];

        let ctx = EvalContext::new("visitor-1").with_attribute("device", "mobile");
        assert_eq!(evaluate(&flag, &ctx, Utc::now()).value, json!("compact"));

        // Rule misses; the non-null default value is served.
        let desktop = EvalContext::new("visitor-1").with_attribute("device", "desktop");
        assert_eq!(evaluate(&flag, &desktop, Utc::now()).value, json!(false));
    }

    #[test]
    fn rule_canary_percentage_gates_the_rule_only() {
        let mut flag = flag("fee_copy");
        let canary = Uuid::new_v4();
        let fallback = Uuid::new_v4();
        flag.variants = vec![
            FlagVariant {
                id: canary,
                name: "canary".into(),
                value: json!("new-fees"),
                weight: 50.0,
            },
            FlagVariant {
                id: fallback,
                name: "fallback".into(),
                value: json!("old-fees"),
                weight: 50.0,
            },
        ];
        // A zero-percent canary never fires; the later unconditional rule
        // catches the same audience.
        flag.targeting.rules = vec![
            device_rule("mobile", Some(canary), Some(0.0)),
            device_rule("mobile", Some(fallback), None),
        ];

        for i in 0..200 {
            let ctx = EvalContext::new(format!("visitor-{i}")).with_attribute("device", "mobile");
            assert_eq!(evaluate(&flag, &ctx, Utc::now()).value, json!("old-fees"));
        }
    }

    #[test]
    fn default_variant_wins_over_default_value() {
        let mut flag = flag("listing_layout");
        flag.flag_type = FlagType::String;
        flag.default_value = json!("grid");
        let variant_id = Uuid::new_v4();
        flag.variants = vec![FlagVariant {
            id: variant_id,
            name: "list".into(),
            value: json!("list"),
            weight: 100.0,
        }];
        flag.targeting.default_variant = Some(variant_id);

        let eval = evaluate(&flag, &EvalContext::new("visitor-1"), Utc::now());
        assert_eq!(eval.value, json!("list"));
        assert_eq!(eval.reason, "default variant");
    }

    #[test]
    fn boolean_flag_with_no_signal_reads_true() {
        let mut flag = flag("vip_upsell");
        flag.default_value = Value::Null;
        let eval = evaluate(&flag, &EvalContext::new("visitor-1"), Utc::now());
        assert_eq!(eval.value, json!(true));
        assert_eq!(eval.reason, "boolean fallback");
    }

    #[test]
    fn unresolvable_rule_variant_falls_through() {
        let mut flag = flag("promo_ribbon");
        flag.targeting.rules = vec![device_rule("mobile", Some(Uuid::new_v4()), None)];
        let ctx = EvalContext::new("visitor-1").with_attribute("device", "mobile");
        let eval = evaluate(&flag, &ctx, Utc::now());
        assert_eq!(eval.value, json!(false));
        assert_eq!(eval.reason, "default value");
    }

    #[test]
    fn rule_match_is_stable_per_visitor_under_canary() {
        let mut flag = flag("door_scan");
        let variant_id = Uuid::new_v4();
        flag.variants = vec![FlagVariant {
            id: variant_id,
            name: "fast lane".into(),
            value: json!(true),
            weight: 100.0,
        }];
        flag.targeting.rules = vec![device_rule("mobile", Some(variant_id), Some(50.0))];

        let ctx = EvalContext::new("visitor-17").with_attribute("device", "mobile");
        let first = evaluate(&flag, &ctx, Utc::now()).reason;
        for _ in 0..10 {
            assert_eq!(evaluate(&flag, &ctx, Utc::now()).reason, first);
        }
    }
}

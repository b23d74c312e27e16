//! Targeting rule evaluation.
//!
//! Rules are walked in stored order with short-circuit semantics: the
//! first matching OR rule proves the whole chain, any failing AND rule
//! disproves it, and a fully traversed list matches. A broken rule must
//! never break traffic, so malformed regexes evaluate to non-match.

use regex::Regex;
use stagepass_core::types::{EvalContext, RuleLogic, RuleOperator, TargetingConfig, TargetingRule};
use std::borrow::Cow;
use tracing::debug;

/// Evaluate a targeting config against a visitor context. Disabled configs
/// and empty rule lists match everyone.
pub fn evaluate(config: &TargetingConfig, ctx: &EvalContext) -> bool {
    if !config.enabled || config.rules.is_empty() {
        return true;
    }
    evaluate_rules(&config.rules, ctx)
}

/// Ordered short-circuit walk over a rule list.
pub fn evaluate_rules(rules: &[TargetingRule], ctx: &EvalContext) -> bool {
    for rule in rules {
        let matched = rule_matches(rule, ctx);
        match rule.logic {
            RuleLogic::Or if matched => return true,
            RuleLogic::And if !matched => return false,
            _ => {}
        }
    }
    true
}

/// Apply a single rule to the context attribute it names. Missing
/// attributes read as the empty string.
pub fn rule_matches(rule: &TargetingRule, ctx: &EvalContext) -> bool {
    let actual = ctx.attribute(&rule.rule_type);

    match rule.operator {
        RuleOperator::Equals => actual == operand(&rule.value),
        RuleOperator::Contains => actual.contains(operand(&rule.value).as_ref()),
        RuleOperator::StartsWith => actual.starts_with(operand(&rule.value).as_ref()),
        RuleOperator::EndsWith => actual.ends_with(operand(&rule.value).as_ref()),
        RuleOperator::In => rule
            .value
            .as_array()
            .map(|list| list.iter().any(|v| operand(v) == actual))
            .unwrap_or(false),
        RuleOperator::NotIn => rule
            .value
            .as_array()
            .map(|list| !list.iter().any(|v| operand(v) == actual))
            .unwrap_or(true),
        RuleOperator::Matches => match Regex::new(operand(&rule.value).as_ref()) {
            Ok(re) => re.is_match(actual),
            Err(err) => {
                debug!(
                    rule_type = %rule.rule_type,
                    error = %err,
                    "Malformed targeting regex treated as non-match"
                );
                false
            }
        },
    }
}

/// String view of a rule operand; non-string JSON compares by its
/// serialized form.
fn operand(value: &serde_json::Value) -> Cow<'_, str> {
    match value.as_str() {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(value.to_string()),
    }
}

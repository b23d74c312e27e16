use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Experiments ────────────────────────────────────────────────────────

/// An A/B/n experiment owned by a promoter account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub hypothesis: Option<String>,
    pub experiment_type: ExperimentType,
    pub status: ExperimentStatus,
    /// Ordered variant list; exactly one variant carries `is_control`.
    pub variants: Vec<Variant>,
    pub targeting: TargetingConfig,
    pub traffic: TrafficConfig,
    pub goals: Vec<Goal>,
    pub schedule: Option<Schedule>,
    /// Derived results snapshot, recomputed on demand and frozen at completion.
    pub results: Option<ExperimentResults>,
    pub settings: ExperimentSettings,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    pub fn variant(&self, id: Uuid) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Total visitors admitted across all variants.
    pub fn total_visitors(&self) -> u64 {
        self.variants.iter().map(|v| v.metrics.visitors).sum()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    AbTest,
    Multivariate,
    SplitUrl,
    Personalization,
    FeatureFlag,
    Holdout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

/// One arm of an experiment: a declared set of page/flow changes plus
/// accumulated metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub name: String,
    /// Traffic share in [0, 100]. Weights need not sum to exactly 100; the
    /// last variant absorbs any remainder.
    pub weight: f64,
    pub is_control: bool,
    /// Declarative changes applied by the rendering layer; opaque to the
    /// engine.
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub metrics: VariantMetrics,
}

/// Per-variant counters. Monotonically non-decreasing for a given run;
/// written via atomic store increments, read back as a projection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VariantMetrics {
    pub visitors: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub engagement_time_secs: f64,
    pub bounce_rate: f64,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

// ─── Targeting & Traffic ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TargetingConfig {
    pub enabled: bool,
    /// Evaluated in order with short-circuit semantics; an empty list
    /// matches everyone.
    #[serde(default)]
    pub rules: Vec<TargetingRule>,
}

/// A declarative predicate over visitor context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetingRule {
    /// Context attribute key this rule reads (`device`, `geo_region`, ...).
    pub rule_type: String,
    pub operator: RuleOperator,
    /// Comparison operand; a JSON array for `in`/`not_in`, a string
    /// otherwise.
    pub value: serde_json::Value,
    #[serde(default)]
    pub logic: RuleLogic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Matches,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Percentage of eligible traffic admitted into the experiment, [0, 100].
    pub percentage: f64,
    pub allocation: AllocationStrategy,
    #[serde(default)]
    pub exclude_bots: bool,
    #[serde(default)]
    pub exclude_staff: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            percentage: 100.0,
            allocation: AllocationStrategy::Deterministic,
            exclude_bots: false,
            exclude_staff: false,
        }
    }
}

/// Recorded for reporting; assignment is always stable hash bucketing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    Deterministic,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub goal_type: GoalType,
    /// Event the tracking snippet fires for this goal, if any.
    pub event_name: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    Conversion,
    Revenue,
    Engagement,
    Custom,
}

/// Wall-clock activation window, shared by experiments and flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schedule {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSettings {
    /// Minimum total visitors before results may be declared significant.
    pub min_sample_size: u64,
    pub max_duration_hours: u32,
    /// Confidence required to declare a winner, in percent.
    pub confidence_level: f64,
    pub minimum_detectable_effect: f64,
    pub two_tailed: bool,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            min_sample_size: 1000,
            max_duration_hours: 720,
            confidence_level: 95.0,
            minimum_detectable_effect: 5.0,
            two_tailed: false,
        }
    }
}

// ─── Assignments ────────────────────────────────────────────────────────

/// A visitor's durable membership in one variant of one experiment.
/// At most one exists per (experiment_id, visitor_id); immutable except
/// for the conversion fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub visitor_id: String,
    pub customer_id: Option<String>,
    pub variant_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub converted: bool,
    pub conversion_at: Option<DateTime<Utc>>,
    pub revenue: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

// ─── Results ────────────────────────────────────────────────────────────

/// Derived results snapshot for an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub winner: Option<Uuid>,
    /// Confidence of the leading variant vs. control, in percent.
    pub confidence: f64,
    pub statistical_significance: bool,
    pub sample_size: u64,
    pub runtime_hours: f64,
    pub variants: Vec<VariantAnalysis>,
    pub summary: String,
    pub recommended_action: String,
    pub calculated_at: DateTime<Utc>,
}

/// Per-variant analysis vs. the control arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantAnalysis {
    pub variant_id: Uuid,
    pub name: String,
    pub is_control: bool,
    pub visitors: u64,
    pub conversions: u64,
    /// Conversion rate in percent.
    pub conversion_rate: f64,
    /// 95% interval around `conversion_rate`, clamped to [0, 100].
    pub confidence_interval: (f64, f64),
    /// Relative lift vs. control, in percent. 0 when the control rate is 0.
    pub improvement: f64,
    /// One-sided confidence that this variant beats control, in percent.
    pub confidence: f64,
    pub significant: bool,
    pub probability_to_be_best: f64,
    /// Expected conversion-rate points given up by shipping this variant.
    pub expected_loss: f64,
}

// ─── Feature Flags ──────────────────────────────────────────────────────

/// A feature flag owned by a promoter account. Keys are unique per owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub key: String,
    pub name: String,
    pub flag_type: FlagType,
    pub default_value: serde_json::Value,
    pub status: FlagStatus,
    #[serde(default)]
    pub targeting: FlagTargeting,
    #[serde(default)]
    pub variants: Vec<FlagVariant>,
    pub schedule: Option<Schedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    pub fn variant(&self, id: Uuid) -> Option<&FlagVariant> {
        self.variants.iter().find(|v| v.id == id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Boolean,
    String,
    Number,
    Json,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlagTargeting {
    /// Walked in order; first matching rule that clears its canary
    /// percentage wins.
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    /// Variant served when no rule fires and the rollout gate admits the
    /// visitor.
    pub default_variant: Option<Uuid>,
    /// Global rollout percentage in [0, 100]; `None` means no rollout gate.
    pub percentage: Option<f64>,
}

/// A targeting rule mapped to a flag variant, with an optional
/// rule-specific canary percentage layered on top of the global rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRule {
    #[serde(flatten)]
    pub rule: TargetingRule,
    pub variant: Option<Uuid>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagVariant {
    pub id: Uuid,
    pub name: String,
    pub value: serde_json::Value,
    pub weight: f64,
}

// ─── Evaluation Context ─────────────────────────────────────────────────

/// Request-scoped context for targeting and rollout decisions.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub visitor_id: String,
    pub attributes: HashMap<String, String>,
}

impl EvalContext {
    pub fn new(visitor_id: impl Into<String>) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attribute lookup; missing keys read as the empty string.
    pub fn attribute(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }
}

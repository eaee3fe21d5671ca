//! Frozen policy configuration
//!
//! Policy is a value, not code. The external loader deserializes into
//! `PolicyConfig`, `validate()` runs once, and from then on the engine only
//! branches on field values. Unknown fields are a deserialization error so a
//! misspelled key cannot silently disable a sanitizer.

use crate::{
    BudgetPolicy, ComplexityLevel, ConfigError, DetectionLevel, ForgeResult, InjectionAction,
    SegmentType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which compressor the engine reaches for first under saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    #[default]
    Truncation,
    Dedup,
    Summary,
}

/// Where the L2 cache lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    External,
}

/// Sanitize section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SanitizePolicy {
    pub unicode_normalize: bool,
    pub strip_html: bool,
    pub pii_redaction: bool,
    pub injection_detection: bool,
    pub injection_level: DetectionLevel,
    pub on_injection: InjectionAction,
    /// Named PII pattern subset. Empty means all built-in patterns.
    pub pii_patterns: Vec<String>,
    pub max_segment_chars: usize,
    pub max_lines: usize,
    pub max_line_chars: usize,
    /// Repetition ratio ceiling over a sliding 50-char window, in [0,1].
    pub max_repeat_ratio: f64,
    /// Truncate oversized segments line-by-line instead of rejecting them.
    pub truncate_on_overflow: bool,
}

impl Default for SanitizePolicy {
    fn default() -> Self {
        Self {
            unicode_normalize: true,
            strip_html: true,
            pii_redaction: true,
            injection_detection: true,
            injection_level: DetectionLevel::Standard,
            on_injection: InjectionAction::WarnAndRemove,
            pii_patterns: Vec::new(),
            max_segment_chars: 100_000,
            max_lines: 4_000,
            max_line_chars: 10_000,
            max_repeat_ratio: 0.9,
            truncate_on_overflow: true,
        }
    }
}

/// Rerank section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RerankPolicy {
    pub enable_mmr: bool,
    /// Relevance/diversity trade-off for MMR, in [0,1].
    pub mmr_lambda: f64,
    /// Jaccard similarity at or above which two segments are duplicates.
    pub similarity_threshold: f64,
    /// Optional cap on segments admitted per type.
    pub max_per_type: BTreeMap<SegmentType, usize>,
    pub enable_temporal_decay: bool,
    /// Score multiplier decay per day of age.
    pub temporal_decay_rate: f64,
    /// Floor for the temporal weight.
    pub temporal_min_weight: f64,
}

impl Default for RerankPolicy {
    fn default() -> Self {
        Self {
            enable_mmr: false,
            mmr_lambda: 0.7,
            similarity_threshold: 0.85,
            max_per_type: BTreeMap::new(),
            enable_temporal_decay: false,
            temporal_decay_rate: 0.1,
            temporal_min_weight: 0.3,
        }
    }
}

/// Compress section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompressPolicy {
    pub enabled: bool,
    pub default_compressor: CompressorKind,
    /// Saturation at or above which the engine starts compressing.
    pub saturation_trigger: f64,
    pub preserve_must_keep: bool,
    /// Segments below this many tokens are never compressed.
    pub min_segment_tokens: u32,
    /// When the summary compressor fails, fall back to truncation.
    pub fallback_to_truncation: bool,
}

impl Default for CompressPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            default_compressor: CompressorKind::Truncation,
            saturation_trigger: 0.85,
            preserve_must_keep: true,
            min_segment_tokens: 50,
            fallback_to_truncation: true,
        }
    }
}

/// Cache section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub backend: CacheBackendKind,
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub prefix_cache: bool,
    pub package_cache: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackendKind::Memory,
            ttl_seconds: 3_600,
            max_entries: 10_000,
            prefix_cache: true,
            package_cache: true,
        }
    }
}

/// Declarative routing rule. The router compiles these into matchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRuleConfig {
    pub name: String,
    /// Rules are evaluated in descending priority order.
    pub priority: i32,
    pub condition: RuleConditionConfig,
    pub target_model: String,
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub budget_adjustment: Option<crate::BudgetAdjustment>,
}

/// Declarative condition for a routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum RuleConditionConfig {
    Complexity(ComplexityLevel),
    /// Regex over the concatenated user query.
    Keyword(String),
    /// Range expression: ">N", "<N", "N-M" or "N".
    TokenCount(String),
    SegmentTypePresent(SegmentType),
}

/// Routing section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingPolicy {
    pub enabled: bool,
    pub default_model: String,
    pub rules: Vec<RoutingRuleConfig>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            default_model: "gpt-4o".to_string(),
            rules: Vec::new(),
        }
    }
}

/// Antipattern section of the policy. Severity is fixed per rule; these are
/// enablement toggles and numeric thresholds only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AntipatternPolicy {
    pub enabled: bool,
    pub fail_on_critical: bool,
    /// Disabled rule names.
    pub disabled_rules: Vec<String>,
    /// Warn when critical tokens exceed this share of kept tokens.
    pub critical_share_threshold: f64,
    /// Warn when rigid spend exceeds this share of the content budget.
    pub rigid_share_threshold: f64,
    /// Warn when a compression pass shrinks a segment below this ratio.
    pub compression_floor: f64,
}

impl Default for AntipatternPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            fail_on_critical: false,
            disabled_rules: Vec::new(),
            critical_share_threshold: 0.5,
            rigid_share_threshold: 0.7,
            compression_floor: 0.05,
        }
    }
}

/// Observability section of the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObservabilityPolicy {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
}

impl Default for ObservabilityPolicy {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            tracing_enabled: false,
        }
    }
}

/// The complete frozen policy. ALL cross-field invariants are checked in
/// `validate()`; the engine assumes a validated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    pub version: String,
    pub name: String,
    pub budget: BudgetPolicy,
    pub sanitize: SanitizePolicy,
    pub rerank: RerankPolicy,
    pub compress: CompressPolicy,
    pub cache: CachePolicy,
    pub routing: RoutingPolicy,
    pub antipattern: AntipatternPolicy,
    pub observability: ObservabilityPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            name: "default".to_string(),
            budget: BudgetPolicy::default(),
            sanitize: SanitizePolicy::default(),
            rerank: RerankPolicy::default(),
            compress: CompressPolicy::default(),
            cache: CachePolicy::default(),
            routing: RoutingPolicy::default(),
            antipattern: AntipatternPolicy::default(),
            observability: ObservabilityPolicy::default(),
        }
    }
}

impl PolicyConfig {
    /// Validate cross-field invariants.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.budget.max_context_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "budget.max_context_tokens".to_string(),
                value: "0".to_string(),
                reason: "max_context_tokens must be greater than 0".to_string(),
            }
            .into());
        }

        let reserved = self.budget.output_reserved + self.budget.thinking_reserved;
        if reserved >= self.budget.max_context_tokens {
            return Err(ConfigError::InvalidValue {
                field: "budget.output_reserved".to_string(),
                value: reserved.to_string(),
                reason: format!(
                    "output_reserved + thinking_reserved ({reserved}) must be smaller than \
                     max_context_tokens ({})",
                    self.budget.max_context_tokens
                ),
            }
            .into());
        }

        let ratio_sum: f64 = self.budget.elastic_ratios.values().sum();
        if ratio_sum > 1.0 + 1e-9 {
            return Err(ConfigError::InvalidValue {
                field: "budget.elastic_ratios".to_string(),
                value: format!("{ratio_sum:.3}"),
                reason: "elastic_ratios must sum to at most 1.0".to_string(),
            }
            .into());
        }
        for (segment_type, ratio) in &self.budget.elastic_ratios {
            if !(0.0..=1.0).contains(ratio) {
                return Err(ConfigError::InvalidValue {
                    field: format!("budget.elastic_ratios.{segment_type}"),
                    value: ratio.to_string(),
                    reason: "each elastic ratio must be in [0, 1]".to_string(),
                }
                .into());
            }
        }

        for (field, value) in [
            ("budget.saturation_threshold", self.budget.saturation_threshold),
            ("compress.saturation_trigger", self.compress.saturation_trigger),
            ("rerank.mmr_lambda", self.rerank.mmr_lambda),
            ("rerank.similarity_threshold", self.rerank.similarity_threshold),
            ("sanitize.max_repeat_ratio", self.sanitize.max_repeat_ratio),
            (
                "antipattern.critical_share_threshold",
                self.antipattern.critical_share_threshold,
            ),
            (
                "antipattern.rigid_share_threshold",
                self.antipattern.rigid_share_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "threshold must be in [0, 1]".to_string(),
                }
                .into());
            }
        }

        if self.sanitize.max_segment_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sanitize.max_segment_chars".to_string(),
                value: "0".to_string(),
                reason: "max_segment_chars must be greater than 0".to_string(),
            }
            .into());
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_entries".to_string(),
                value: "0".to_string(),
                reason: "an enabled cache needs room for at least one entry".to_string(),
            }
            .into());
        }

        if self.routing.enabled && self.routing.default_model.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "routing.default_model".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

//! Error types for FORGE operations
//!
//! Errors are structured values, not opaque strings: callers branch on the
//! kind, and `ForgeError::explain()` renders the what / why / how triple for
//! user-facing surfaces.

use crate::SegmentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Tokenizer resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenizerError {
    #[error("No tokenizer mapping for model '{model}' and fallback is disabled")]
    UnknownModel { model: String },
}

/// Budget allocation errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BudgetError {
    #[error(
        "Context requires {required_tokens} tokens but the content budget allows {budget_tokens}"
    )]
    Exceeded {
        required_tokens: u64,
        budget_tokens: u64,
        segment_ids: Vec<SegmentId>,
    },

    #[error("Segment {segment_id} is missing its token count")]
    MissingTokenCount { segment_id: SegmentId },
}

/// Sanitizer chain errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Injection detected by {sanitizer}: {patterns:?}")]
    InjectionRejected {
        sanitizer: String,
        patterns: Vec<String>,
    },

    #[error("Sanitizer '{sanitizer}' failed: {reason}")]
    SanitizerFailed { sanitizer: String, reason: String },
}

/// Compression engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompressError {
    #[error("All compression tiers exhausted; still {gap_tokens} tokens over budget")]
    BudgetStillExceeded { gap_tokens: u64 },

    #[error("Cyclic provenance detected at segment {segment_id}")]
    CyclicProvenance { segment_id: SegmentId },

    #[error("Summarizer failed and fallback is disabled: {reason}")]
    SummarizerFailed { reason: String },
}

/// Cache errors. Always demoted to warnings by the facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend '{backend}' failed during {operation}: {reason}")]
    BackendFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Cache entry could not be decoded: {reason}")]
    DecodeFailed { reason: String },
}

/// Router errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Invalid token range expression '{expression}': {reason}")]
    InvalidRange { expression: String, reason: String },

    #[error("Invalid keyword pattern in rule '{rule}': {reason}")]
    InvalidPattern { rule: String, reason: String },
}

/// Context bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Agent not registered: {agent}")]
    NotRegistered { agent: String },

    #[error("Handoff failed from '{from}' to '{to}': {reason}")]
    HandoffFailed {
        from: String,
        to: String,
        reason: String,
    },
}

/// Pipeline stage errors: any stage-internal failure wrapped with its stage
/// name. Fatal for the request unless the stage was skipped.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Pipeline stage '{stage}' failed: {source}")]
pub struct StageError {
    pub stage: String,
    #[source]
    pub source: Box<ForgeError>,
}

/// Master error type for all FORGE errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForgeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    #[error("Sanitize error: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("Compress error: {0}")]
    Compress(#[from] CompressError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Build was cancelled")]
    Cancelled,

    #[error("Anti-pattern check failed: {findings:?}")]
    AntipatternCritical { findings: Vec<String> },
}

/// Result type alias for FORGE operations.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// The what / why / how triple every user-facing error renders to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub what: String,
    pub why: String,
    pub how: String,
}

impl ForgeError {
    /// Render the error as a what / why / how report.
    pub fn explain(&self) -> ErrorReport {
        match self {
            ForgeError::Config(e) => ErrorReport {
                what: "The policy failed validation.".to_string(),
                why: e.to_string(),
                how: "Fix the named field in the policy file and reload.".to_string(),
            },
            ForgeError::Tokenizer(TokenizerError::UnknownModel { model }) => ErrorReport {
                what: format!("No tokenizer is registered for model '{model}'."),
                why: "The model id matched no built-in prefix and strict mode disables the \
                      character estimator."
                    .to_string(),
                how: "Register a counter for this model, or allow the fallback estimator."
                    .to_string(),
            },
            ForgeError::Budget(BudgetError::Exceeded {
                required_tokens,
                budget_tokens,
                segment_ids,
            }) => ErrorReport {
                what: format!(
                    "Rigid context needs {required_tokens} tokens but only {budget_tokens} are \
                     available."
                ),
                why: format!(
                    "{} rigid segments (system prompt, schemas, tool definitions, critical \
                     priority) exceed the content budget on their own.",
                    segment_ids.len()
                ),
                how: "Shorten the system prompt, demote segments from critical priority, or \
                      switch to a model with a larger window."
                    .to_string(),
            },
            ForgeError::Budget(BudgetError::MissingTokenCount { segment_id }) => ErrorReport {
                what: format!("Segment {segment_id} reached the allocator without a token count."),
                why: "The Normalize stage populates token counts; it was skipped or replaced."
                    .to_string(),
                how: "Run the Normalize stage before Allocate, or set token_count explicitly."
                    .to_string(),
            },
            ForgeError::Sanitize(SanitizeError::InjectionRejected { sanitizer, patterns }) => {
                ErrorReport {
                    what: "A segment was rejected as a prompt-injection attempt.".to_string(),
                    why: format!("{sanitizer} matched: {}", patterns.join(", ")),
                    how: "Remove the flagged content, or set on_injection to warn_and_remove to \
                          drop the segment instead of failing the request."
                        .to_string(),
                }
            }
            ForgeError::Sanitize(SanitizeError::SanitizerFailed { sanitizer, reason }) => {
                ErrorReport {
                    what: format!("Sanitizer '{sanitizer}' failed."),
                    why: reason.clone(),
                    how: "Check the sanitizer's configuration; the chain can be skipped per \
                          stage if necessary."
                        .to_string(),
                }
            }
            ForgeError::Compress(CompressError::BudgetStillExceeded { gap_tokens }) => {
                ErrorReport {
                    what: format!(
                        "Compression could not close the budget gap ({gap_tokens} tokens over)."
                    ),
                    why: "Dedup and all priority tiers were compressed and the kept set is still \
                          too large; the remainder is critical or must-keep."
                        .to_string(),
                    how: "Reduce critical/must-keep content or raise the budget.".to_string(),
                }
            }
            ForgeError::Compress(e) => ErrorReport {
                what: "Compression failed.".to_string(),
                why: e.to_string(),
                how: "Inspect the provenance chain of the named segment.".to_string(),
            },
            ForgeError::Cache(e) => ErrorReport {
                what: "A cache operation failed.".to_string(),
                why: e.to_string(),
                how: "Cache failures are non-fatal; check the backend's availability."
                    .to_string(),
            },
            ForgeError::Router(e) => ErrorReport {
                what: "A routing rule is malformed.".to_string(),
                why: e.to_string(),
                how: "Fix the rule in the routing policy section.".to_string(),
            },
            ForgeError::Bus(e) => ErrorReport {
                what: "A context bus operation failed.".to_string(),
                why: e.to_string(),
                how: "Register the agent before publishing or handing off.".to_string(),
            },
            ForgeError::Stage(e) => ErrorReport {
                what: format!("Pipeline stage '{}' failed.", e.stage),
                why: e.source.to_string(),
                how: format!(
                    "Check the '{}' stage's inputs, or skip it via the pipeline's skip set.",
                    e.stage
                ),
            },
            ForgeError::Cancelled => ErrorReport {
                what: "The build was cancelled before completion.".to_string(),
                why: "The caller's cancellation signal fired between stages.".to_string(),
                how: "Retry without the cancellation, or extend the deadline.".to_string(),
            },
            ForgeError::AntipatternCritical { findings } => ErrorReport {
                what: "Critical anti-pattern findings failed the build.".to_string(),
                why: findings.join("; "),
                how: "Fix the findings, or unset antipattern.fail_on_critical.".to_string(),
            },
        }
    }
}

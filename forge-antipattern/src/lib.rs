//! FORGE Antipattern - Post-Assembly Inspection
//!
//! A rule engine over finished packages. Rules are stateless: each looks at
//! the kept segments, the allocation, and the audit log, and emits findings.
//! A failing rule is logged and skipped; one broken rule never aborts the
//! batch. Severity is a fixed property of each rule - policy only toggles
//! enablement and numeric thresholds.

mod rules;
mod detector;

pub use detector::{Detector, InspectContext};

pub use rules::builtin_rules;

use forge_core::{AntipatternPolicy, ContextPackage, SegmentId};
use serde::{Deserialize, Serialize};

/// How bad a finding is. Critical findings can fail the build when the
/// policy says so.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One detector finding: what is wrong, why it matters, how to fix it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_name: String,
    pub severity: Severity,
    pub title: String,
    pub what: String,
    pub why: String,
    pub how: String,
    pub segment_ids: Vec<SegmentId>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Finding {
    pub fn new(
        rule_name: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            severity,
            title: title.into(),
            what: String::new(),
            why: String::new(),
            how: String::new(),
            segment_ids: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn explain(
        mut self,
        what: impl Into<String>,
        why: impl Into<String>,
        how: impl Into<String>,
    ) -> Self {
        self.what = what.into();
        self.why = why.into();
        self.how = how.into();
        self
    }

    pub fn with_segments(mut self, ids: Vec<SegmentId>) -> Self {
        self.segment_ids = ids;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A stateless inspection rule.
pub trait AntipatternRule: Send + Sync {
    fn name(&self) -> &str;

    /// The rule's fixed severity.
    fn severity(&self) -> Severity;

    fn check(
        &self,
        package: &ContextPackage,
        policy: &AntipatternPolicy,
        ctx: &InspectContext,
    ) -> Vec<Finding>;
}

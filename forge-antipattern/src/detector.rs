//! Detector: runs the rule batch with per-rule isolation

use crate::{builtin_rules, AntipatternRule, Finding};
use forge_core::{AntipatternPolicy, ContextPackage};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

/// Request-scoped facts the rules need beyond the package itself.
#[derive(Debug, Clone, Default)]
pub struct InspectContext {
    /// Namespace the package was assembled for.
    pub target_namespace: Option<String>,
    /// The globally configured default model.
    pub default_model: Option<String>,
    /// Whether a routing pass actually ran for this request.
    pub routing_ran: bool,
    /// Names of sanitizers that were active in the chain.
    pub active_sanitizers: Vec<String>,
}

/// Applies the rule set to a finished package. Disabled rules are skipped;
/// a panicking rule is logged and the batch continues.
pub struct Detector {
    rules: Vec<Box<dyn AntipatternRule>>,
}

impl Detector {
    pub fn new() -> Self {
        Self {
            rules: builtin_rules(),
        }
    }

    pub fn with_rules(rules: Vec<Box<dyn AntipatternRule>>) -> Self {
        Self { rules }
    }

    pub fn inspect(
        &self,
        package: &ContextPackage,
        policy: &AntipatternPolicy,
        ctx: &InspectContext,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            if policy.disabled_rules.iter().any(|name| name == rule.name()) {
                debug!(rule = rule.name(), "rule disabled by policy");
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| rule.check(package, policy, ctx))) {
                Ok(mut rule_findings) => findings.append(&mut rule_findings),
                Err(_) => {
                    error!(rule = rule.name(), "rule panicked; continuing the batch");
                }
            }
        }
        findings
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

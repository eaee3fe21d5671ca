//! Request-scoped pipeline state

use forge_core::{AuditEntry, BudgetAllocation, CancelFlag, PolicyConfig};
use forge_tokenizer::TokenizerRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared state threaded through the stages of one build. Each request gets
/// its own context; nothing here is shared across concurrent builds.
pub struct PipelineContext {
    /// Target model id, possibly chosen by the router.
    pub model: String,
    /// Frozen, validated policy for this request.
    pub policy: Arc<PolicyConfig>,
    pub registry: Arc<TokenizerRegistry>,
    /// Append-only decision log; stages only ever push.
    pub audit_log: Vec<AuditEntry>,
    pub warnings: Vec<String>,
    /// Filled by the Allocate stage, adjusted by Compress.
    pub budget_allocation: Option<BudgetAllocation>,
    /// Free-form stage outputs surfaced on the package.
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub debug: bool,
    pub cancel: CancelFlag,
    /// Wall-clock per executed stage, in order.
    pub stage_timings: Vec<(String, f64)>,
}

impl PipelineContext {
    pub fn new(
        model: impl Into<String>,
        policy: Arc<PolicyConfig>,
        registry: Arc<TokenizerRegistry>,
    ) -> Self {
        Self {
            model: model.into(),
            policy,
            registry,
            audit_log: Vec::new(),
            warnings: Vec::new(),
            budget_allocation: None,
            metadata: BTreeMap::new(),
            debug: false,
            cancel: CancelFlag::new(),
            stage_timings: Vec::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

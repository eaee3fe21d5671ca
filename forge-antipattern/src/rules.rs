//! Built-in inspection rules

use crate::{AntipatternRule, Finding, InspectContext, Severity};
use chrono::{Duration, Utc};
use forge_core::{AntipatternPolicy, ContextPackage, Priority, ReasonCode, SegmentId};
use std::collections::{HashMap, HashSet};

/// All built-in rules in evaluation order.
pub fn builtin_rules() -> Vec<Box<dyn AntipatternRule>> {
    vec![
        Box::new(MissingTokenCounts),
        Box::new(CircularProvenance),
        Box::new(NamespaceViolation),
        Box::new(CriticalShare),
        Box::new(RigidShare),
        Box::new(ExpiredTtl),
        Box::new(OverCompression),
        Box::new(RoutingNoop),
        Box::new(IdleSanitizers),
    ]
}

// ============================================================================
// CRITICAL RULES
// ============================================================================

/// A kept segment without a token count means budgeting ran blind.
pub struct MissingTokenCounts;

impl AntipatternRule for MissingTokenCounts {
    fn name(&self) -> &str {
        "missing-token-counts"
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let missing: Vec<SegmentId> = package
            .segments
            .iter()
            .filter(|seg| seg.token_count.is_none())
            .map(|seg| seg.id)
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Kept segments lack token counts")
            .explain(
                format!("{} kept segments have no token count.", missing.len()),
                "Budget math over these segments was undefined; the package may overflow \
                 the model window.",
                "Ensure the Normalize stage runs before Allocate and is not skipped.",
            )
            .with_segments(missing)]
    }
}

/// Provenance must be a DAG; a cycle means corrupt ancestry.
pub struct CircularProvenance;

impl AntipatternRule for CircularProvenance {
    fn name(&self) -> &str {
        "circular-provenance"
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let by_id: HashMap<SegmentId, &forge_core::Segment> =
            package.segments.iter().map(|seg| (seg.id, seg)).collect();

        let mut offenders = Vec::new();
        for seg in &package.segments {
            // Walk ancestors; revisiting the start id is a cycle.
            let mut stack: Vec<SegmentId> = seg.provenance.parent_segment_ids.clone();
            let mut seen: HashSet<SegmentId> = HashSet::new();
            while let Some(id) = stack.pop() {
                if id == seg.id {
                    offenders.push(seg.id);
                    break;
                }
                if !seen.insert(id) {
                    continue;
                }
                if let Some(parent) = by_id.get(&id) {
                    stack.extend(parent.provenance.parent_segment_ids.iter().copied());
                }
            }
        }
        if offenders.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Provenance contains a cycle")
            .explain(
                format!("{} segments are their own ancestors.", offenders.len()),
                "Compression or handoff wrote a parent link pointing back at a descendant.",
                "Inspect the compressors that produced these segments; ancestry must form a DAG.",
            )
            .with_segments(offenders)]
    }
}

/// Segments from a foreign namespace must carry an explicit grant.
pub struct NamespaceViolation;

impl AntipatternRule for NamespaceViolation {
    fn name(&self) -> &str {
        "namespace-visibility-violation"
    }
    fn severity(&self) -> Severity {
        Severity::Critical
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        ctx: &InspectContext,
    ) -> Vec<Finding> {
        let Some(target) = ctx.target_namespace.as_deref() else {
            return Vec::new();
        };
        let offenders: Vec<SegmentId> = package
            .segments
            .iter()
            .filter(|seg| {
                let ns = seg.metadata.namespace.as_str();
                !ns.is_empty()
                    && ns != target
                    && ns != "default"
                    && !seg.visibility.iter().any(|v| v == target)
            })
            .map(|seg| seg.id)
            .collect();
        if offenders.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Namespace visibility violated")
            .explain(
                format!(
                    "{} segments from foreign namespaces reached namespace '{target}' \
                     without a visibility grant.",
                    offenders.len()
                ),
                "Isolation between agents depends on namespace checks at assembly time.",
                "Hand segments off through the context bus, or add the target namespace \
                 to their visibility set.",
            )
            .with_segments(offenders)]
    }
}

// ============================================================================
// WARNING RULES
// ============================================================================

/// Everything-is-critical defeats prioritised budgeting.
pub struct CriticalShare;

impl AntipatternRule for CriticalShare {
    fn name(&self) -> &str {
        "critical-share"
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(
        &self,
        package: &ContextPackage,
        policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let total: u64 = package.token_usage.total_tokens;
        if total == 0 {
            return Vec::new();
        }
        let critical: u64 = package
            .segments
            .iter()
            .filter(|seg| seg.effective_priority() == Priority::Critical)
            .map(|seg| u64::from(seg.token_count.unwrap_or(0)))
            .sum();
        let share = critical as f64 / total as f64;
        if share <= policy.critical_share_threshold {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Most kept tokens are critical")
            .explain(
                format!(
                    "{:.0}% of kept tokens are critical priority (threshold {:.0}%).",
                    share * 100.0,
                    policy.critical_share_threshold * 100.0
                ),
                "When everything is critical, the bidding tier has nothing to arbitrate \
                 and budget pressure falls entirely on compression.",
                "Demote content that does not genuinely need a guarantee.",
            )
            .with_metadata("share", serde_json::json!(share))]
    }
}

/// Rigid spend crowding out the elastic tier.
pub struct RigidShare;

impl AntipatternRule for RigidShare {
    fn name(&self) -> &str {
        "rigid-share"
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(
        &self,
        package: &ContextPackage,
        policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let budget = package.budget_allocation.content_budget;
        if budget == 0 {
            return Vec::new();
        }
        let share = f64::from(package.budget_allocation.rigid_used) / f64::from(budget);
        if share <= policy.rigid_share_threshold {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Rigid tier dominates the budget")
            .explain(
                format!(
                    "Rigid spend is {:.0}% of the content budget (threshold {:.0}%).",
                    share * 100.0,
                    policy.rigid_share_threshold * 100.0
                ),
                "Dynamic content competes for the slice the rigid tier leaves behind.",
                "Trim the system prompt and schemas, or raise max_context_tokens.",
            )
            .with_metadata("share", serde_json::json!(share))]
    }
}

/// Kept segments whose TTL has already passed.
pub struct ExpiredTtl;

impl AntipatternRule for ExpiredTtl {
    fn name(&self) -> &str {
        "expired-ttl"
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let now = Utc::now();
        let expired: Vec<SegmentId> = package
            .segments
            .iter()
            .filter(|seg| {
                match (seg.metadata.timestamp, seg.metadata.ttl_seconds) {
                    (Some(ts), Some(ttl)) => {
                        ts + Duration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX)) < now
                    }
                    _ => false,
                }
            })
            .map(|seg| seg.id)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Expired segments were kept")
            .explain(
                format!("{} kept segments are past their TTL.", expired.len()),
                "Stale state anchors and retrieval chunks mislead the model.",
                "Filter expired segments upstream or refresh their sources.",
            )
            .with_segments(expired)]
    }
}

/// Compression that shrank a segment below the configured floor.
pub struct OverCompression;

impl AntipatternRule for OverCompression {
    fn name(&self) -> &str {
        "over-compression"
    }
    fn severity(&self) -> Severity {
        Severity::Warning
    }

    fn check(
        &self,
        package: &ContextPackage,
        policy: &AntipatternPolicy,
        _ctx: &InspectContext,
    ) -> Vec<Finding> {
        let mut offenders = Vec::new();
        for entry in &package.audit_log {
            if entry.reason_code != ReasonCode::CompressWindowSaturation
                || entry.token_impact >= 0
            {
                continue;
            }
            // token_impact for rewrites is after-before; reconstruct ratio
            // from the replacement segment when it is still in the package.
            let Some(replacement) = entry
                .metadata
                .get("replacement")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<SegmentId>().ok())
            else {
                continue;
            };
            let Some(kept) = package.segments.iter().find(|seg| seg.id == replacement) else {
                continue;
            };
            let after = f64::from(kept.token_count.unwrap_or(0));
            let before = after - entry.token_impact as f64;
            if before > 0.0 && after / before < policy.compression_floor {
                offenders.push(replacement);
            }
        }
        if offenders.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Compression ratio below floor")
            .explain(
                format!(
                    "{} segments were compressed below {:.0}% of their original size.",
                    offenders.len(),
                    policy.compression_floor * 100.0
                ),
                "Past a point, truncation keeps bytes but destroys meaning.",
                "Raise the budget or drop these segments outright instead of compressing.",
            )
            .with_segments(offenders)]
    }
}

// ============================================================================
// INFO RULES
// ============================================================================

/// Routing ran but landed on the default model anyway.
pub struct RoutingNoop;

impl AntipatternRule for RoutingNoop {
    fn name(&self) -> &str {
        "routing-noop"
    }
    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        ctx: &InspectContext,
    ) -> Vec<Finding> {
        let Some(default_model) = ctx.default_model.as_deref() else {
            return Vec::new();
        };
        if !ctx.routing_ran || package.model != default_model {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Routing had no effect")
            .explain(
                format!("The router selected the default model '{default_model}'."),
                "Every rule either missed or pointed at the default; the routing pass \
                 only added latency.",
                "Review rule conditions, or disable routing for this traffic.",
            )]
    }
}

/// Sanitizers that did nothing for this request.
pub struct IdleSanitizers;

impl AntipatternRule for IdleSanitizers {
    fn name(&self) -> &str {
        "idle-sanitizers"
    }
    fn severity(&self) -> Severity {
        Severity::Info
    }

    fn check(
        &self,
        package: &ContextPackage,
        _policy: &AntipatternPolicy,
        ctx: &InspectContext,
    ) -> Vec<Finding> {
        if ctx.active_sanitizers.is_empty() {
            return Vec::new();
        }
        let touched: HashSet<&str> = package
            .audit_log
            .iter()
            .filter(|entry| entry.pipeline_stage == "sanitize")
            .filter_map(|entry| entry.metadata.get("sanitizer"))
            .filter_map(|v| v.as_str())
            .collect();
        let idle: Vec<String> = ctx
            .active_sanitizers
            .iter()
            .filter(|name| !touched.contains(name.as_str()))
            .cloned()
            .collect();
        if idle.is_empty() {
            return Vec::new();
        }
        vec![Finding::new(self.name(), self.severity(), "Some sanitizers did nothing")
            .explain(
                format!("Sanitizers with no effect on this request: {}.", idle.join(", ")),
                "Harmless, but worth knowing when tuning the chain for latency.",
                "No action needed; disable individual sanitizers only with cause.",
            )
            .with_metadata("idle", serde_json::json!(idle))]
    }
}

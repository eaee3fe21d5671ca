//! FORGE Budget - Three-Tier Token Allocation
//!
//! The decision core of the engine: split the model window into reserve,
//! rigid, and elastic tiers, then admit elastic segments by weighted bidding.
//!
//! 1. **Reserve**: output and thinking reserves come off the top and are
//!    never spent on context.
//! 2. **Rigid**: critical-priority segments, rigid-typed segments, and
//!    must-keep segments are all kept and booked first.
//! 3. **Elastic**: everything else bids for the remainder with
//!    `bid = alpha * priority_rank + beta * normalised_score + gamma * quota_headroom`,
//!    in two phases: per-type quotas, then pooled recycling of unused quota.

use forge_core::{
    AuditEntry, BudgetAllocation, BudgetError, BudgetPolicy, CancelFlag, ControlFlags, Decision,
    ForgeResult, OverflowStrategy, ReasonCode, Segment, SegmentType,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Stage name recorded on every audit entry this crate emits.
const STAGE: &str = "budget_allocate";

/// Bidding weights. Alpha scales priority, beta the normalised retrieval
/// score, gamma the remaining type-quota headroom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BidWeights {
    pub priority: f64,
    pub relevance: f64,
    pub quota: f64,
}

impl Default for BidWeights {
    fn default() -> Self {
        Self {
            priority: 1.0,
            relevance: 0.5,
            quota: 0.3,
        }
    }
}

/// Everything the allocator decided, in one value.
#[derive(Debug, Clone)]
pub struct BudgetOutcome {
    /// Kept segments in insertion order.
    pub kept: Vec<Segment>,
    /// Rejected segments, also in insertion order.
    pub dropped: Vec<Segment>,
    pub allocation: BudgetAllocation,
    /// Exactly one entry per input segment.
    pub audit: Vec<AuditEntry>,
    pub warnings: Vec<String>,
}

struct Candidate {
    segment: Segment,
    tokens: u32,
    static_bid: f64,
    normalised_score: f64,
}

/// Orchestrates the three allocation tiers for one request.
pub struct BudgetManager {
    policy: BudgetPolicy,
    weights: BidWeights,
}

impl BudgetManager {
    pub fn new(policy: BudgetPolicy) -> Self {
        Self {
            policy,
            weights: BidWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: BidWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Precondition check: every segment must carry a non-null token count
    /// before any budget decision reads it.
    pub fn validate_segments(&self, segments: &[Segment]) -> ForgeResult<()> {
        for seg in segments {
            if seg.token_count.is_none() {
                return Err(BudgetError::MissingTokenCount { segment_id: seg.id }.into());
            }
        }
        Ok(())
    }

    fn is_rigid(&self, segment: &Segment) -> bool {
        segment.effective_priority() == forge_core::Priority::Critical
            || self
                .policy
                .rigid_segment_types
                .contains(&segment.segment_type)
            || segment.control_flags.contains(ControlFlags::MUST_KEEP)
    }

    /// Run the full allocation. The cancellation flag is polled once per
    /// candidate in the bidding loops.
    pub fn allocate(&self, segments: &[Segment], cancel: &CancelFlag) -> ForgeResult<BudgetOutcome> {
        self.validate_segments(segments)?;

        let content_budget = self.policy.content_budget();
        let mut audit = Vec::with_capacity(segments.len());
        let mut warnings = Vec::new();

        // ------------------------------------------------------------------
        // Rigid tier: all kept, booked first.
        // ------------------------------------------------------------------
        let (rigid, elastic): (Vec<&Segment>, Vec<&Segment>) =
            segments.iter().partition(|seg| self.is_rigid(seg));

        let rigid_used: u64 = rigid
            .iter()
            .map(|seg| u64::from(seg.token_count.unwrap_or(0)))
            .sum();

        for seg in &rigid {
            let tokens = seg.token_count.unwrap_or(0);
            audit.push(AuditEntry::new(
                seg.id,
                Decision::Keep,
                ReasonCode::RigidGuaranteed,
                format!("rigid tier, {tokens} tokens guaranteed"),
                STAGE,
                i64::from(tokens),
            ));
        }

        if rigid_used > u64::from(content_budget) {
            let msg = format!(
                "rigid spend ({rigid_used} tokens) exceeds the content budget \
                 ({content_budget} tokens); elastic tier gets nothing"
            );
            warn!(rigid_used, content_budget, "rigid overflow");
            warnings.push(msg);

            if self.policy.overflow_strategy == OverflowStrategy::Error {
                return Err(BudgetError::Exceeded {
                    required_tokens: rigid_used,
                    budget_tokens: u64::from(content_budget),
                    segment_ids: rigid.iter().map(|seg| seg.id).collect(),
                }
                .into());
            }
        }

        // ------------------------------------------------------------------
        // Elastic tier: weighted bidding over the remainder.
        // ------------------------------------------------------------------
        let elastic_budget =
            u32::try_from(u64::from(content_budget).saturating_sub(rigid_used)).unwrap_or(0);
        if elastic_budget > 0
            && self.policy.min_elastic_tokens > 0
            && elastic_budget < self.policy.min_elastic_tokens
        {
            warnings.push(format!(
                "elastic budget ({elastic_budget} tokens) is below the configured floor \
                 ({} tokens)",
                self.policy.min_elastic_tokens
            ));
        }

        let (admitted, rejected, elastic_used, overflow_count) =
            self.run_bidding(&elastic, elastic_budget, &mut audit, cancel)?;

        // ------------------------------------------------------------------
        // Assemble the outcome.
        // ------------------------------------------------------------------
        let mut kept: Vec<Segment> = rigid.into_iter().cloned().collect();
        kept.extend(admitted);
        kept.sort_by_key(|seg| seg.seq);

        let mut dropped = rejected;
        dropped.sort_by_key(|seg| seg.seq);

        let total_used = rigid_used + u64::from(elastic_used.values().sum::<u32>());
        let allocation = BudgetAllocation {
            total_budget: self.policy.max_context_tokens,
            content_budget,
            output_reserved: self.policy.output_reserved,
            thinking_reserved: self.policy.thinking_reserved,
            rigid_used: u32::try_from(rigid_used).unwrap_or(u32::MAX),
            elastic_used,
            total_used: u32::try_from(total_used).unwrap_or(u32::MAX),
            overflow_count,
        };

        let saturation = allocation.saturation_rate();
        if saturation > self.policy.saturation_threshold {
            warnings.push(format!(
                "window saturation {:.1}% exceeds threshold {:.1}%",
                saturation * 100.0,
                self.policy.saturation_threshold * 100.0
            ));
        }

        debug!(
            rigid = allocation.rigid_used,
            elastic = allocation.elastic_total(),
            total = allocation.total_used,
            budget = content_budget,
            saturation = format!("{saturation:.3}"),
            overflow = overflow_count,
            "allocation complete"
        );

        Ok(BudgetOutcome {
            kept,
            dropped,
            allocation,
            audit,
            warnings,
        })
    }

    /// Two-phase greedy bidding. Returns admitted segments, rejected
    /// segments, per-type elastic spend, and the overflow count.
    #[allow(clippy::type_complexity)]
    fn run_bidding(
        &self,
        elastic: &[&Segment],
        elastic_budget: u32,
        audit: &mut Vec<AuditEntry>,
        cancel: &CancelFlag,
    ) -> ForgeResult<(Vec<Segment>, Vec<Segment>, BTreeMap<SegmentType, u32>, u32)> {
        let mut elastic_used: BTreeMap<SegmentType, u32> = BTreeMap::new();
        if elastic.is_empty() {
            return Ok((Vec::new(), Vec::new(), elastic_used, 0));
        }

        // Rescale retrieval scores into [0,1]; segments without a score bid 0.
        let scores: Vec<f64> = elastic.iter().filter_map(|seg| seg.score()).collect();
        let (score_min, score_max) = scores
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(*s), hi.max(*s))
            });

        let normalise = |score: Option<f64>| -> f64 {
            match score {
                None => 0.0,
                Some(s) if score_max > score_min => (s - score_min) / (score_max - score_min),
                Some(_) => 1.0,
            }
        };

        let quota_total: BTreeMap<SegmentType, u32> = self
            .policy
            .elastic_ratios
            .iter()
            .map(|(seg_type, ratio)| (*seg_type, (f64::from(elastic_budget) * ratio) as u32))
            .collect();
        let mut quota_remaining = quota_total.clone();

        // Fraction of a type's quota still unspent, at this moment. Types
        // without a quota have no headroom to offer.
        let headroom = |remaining: &BTreeMap<SegmentType, u32>, seg_type: SegmentType| -> f64 {
            let total = quota_total.get(&seg_type).copied().unwrap_or(0);
            if total == 0 {
                return 0.0;
            }
            let left = remaining.get(&seg_type).copied().unwrap_or(0);
            (f64::from(left) / f64::from(total)).max(0.0)
        };

        let mut candidates: Vec<Candidate> = elastic
            .iter()
            .map(|seg| {
                let normalised_score = normalise(seg.score());
                Candidate {
                    static_bid: self.weights.priority
                        * f64::from(seg.effective_priority().rank())
                        + self.weights.relevance * normalised_score,
                    normalised_score,
                    tokens: seg.token_count.unwrap_or(0),
                    segment: (*seg).clone(),
                }
            })
            .collect();

        // Evaluation order: descending static bid, ties broken by priority,
        // then score, then seq. Headroom is identical for every candidate of
        // a type at a given moment, so this order equals descending full-bid
        // order within each type.
        candidates.sort_by(|a, b| bid_order(a.static_bid, a, b.static_bid, b));

        // Phase 1: per-type quotas. The gamma term is evaluated against the
        // live quota as each candidate comes up.
        let mut admitted: Vec<Segment> = Vec::new();
        let mut pending: Vec<Candidate> = Vec::new();

        for candidate in candidates {
            cancel.check()?;
            let seg_type = candidate.segment.segment_type;
            let bid = candidate.static_bid
                + self.weights.quota * headroom(&quota_remaining, seg_type);
            match quota_remaining.get_mut(&seg_type) {
                Some(remaining) if candidate.tokens <= *remaining => {
                    *remaining -= candidate.tokens;
                    *elastic_used.entry(seg_type).or_insert(0) += candidate.tokens;
                    audit.push(keep_entry(&candidate, bid, "type quota"));
                    admitted.push(candidate.segment);
                }
                _ => pending.push(candidate),
            }
        }

        // Phase 2: pool unused quota plus budget not covered by any ratio.
        // The pending set is re-scored against the post-phase-1 headroom and
        // re-sorted before the pool is offered globally.
        let spent: u32 = elastic_used.values().sum();
        let mut pool = elastic_budget.saturating_sub(spent);

        let mut pending: Vec<(f64, Candidate)> = pending
            .into_iter()
            .map(|candidate| {
                let bid = candidate.static_bid
                    + self.weights.quota
                        * headroom(&quota_remaining, candidate.segment.segment_type);
                (bid, candidate)
            })
            .collect();
        pending.sort_by(|(bid_a, a), (bid_b, b)| bid_order(*bid_a, a, *bid_b, b));

        let mut rejected: Vec<Segment> = Vec::new();
        let mut overflow_count = 0u32;
        for (bid, candidate) in pending {
            cancel.check()?;
            if candidate.tokens <= pool {
                pool -= candidate.tokens;
                *elastic_used
                    .entry(candidate.segment.segment_type)
                    .or_insert(0) += candidate.tokens;
                audit.push(keep_entry(&candidate, bid, "recycled quota"));
                admitted.push(candidate.segment);
            } else {
                overflow_count += 1;
                audit.push(
                    AuditEntry::new(
                        candidate.segment.id,
                        Decision::Drop,
                        ReasonCode::BudgetExceeded,
                        format!(
                            "bid {bid:.2} lost: needs {} tokens, {} remaining",
                            candidate.tokens, pool
                        ),
                        STAGE,
                        -i64::from(candidate.tokens),
                    )
                    .with_metadata("bid", serde_json::json!(bid)),
                );
                rejected.push(candidate.segment);
            }
        }

        Ok((admitted, rejected, elastic_used, overflow_count))
    }
}

fn keep_entry(candidate: &Candidate, bid: f64, phase: &str) -> AuditEntry {
    AuditEntry::new(
        candidate.segment.id,
        Decision::Keep,
        ReasonCode::ElasticAllocated,
        format!(
            "bid {bid:.2} won ({phase}), {} tokens allocated",
            candidate.tokens
        ),
        STAGE,
        i64::from(candidate.tokens),
    )
    .with_metadata("bid", serde_json::json!(bid))
}

/// Descending bid with the deterministic tie-break: priority, then score,
/// then insertion index.
fn bid_order(
    bid_a: f64,
    a: &Candidate,
    bid_b: f64,
    b: &Candidate,
) -> std::cmp::Ordering {
    bid_b
        .partial_cmp(&bid_a)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| {
            b.segment
                .effective_priority()
                .cmp(&a.segment.effective_priority())
        })
        .then_with(|| {
            b.normalised_score
                .partial_cmp(&a.normalised_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .then_with(|| a.segment.seq.cmp(&b.segment.seq))
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use forge_core::Priority;
    use proptest::prelude::*;

    fn arb_segment() -> impl Strategy<Value = Segment> {
        (
            prop_oneof![
                Just(SegmentType::System),
                Just(SegmentType::User),
                Just(SegmentType::Rag),
                Just(SegmentType::Assistant),
                Just(SegmentType::FewShot),
                Just(SegmentType::Summary),
            ],
            0u32..500,
            prop_oneof![
                Just(None),
                Just(Some(Priority::Low)),
                Just(Some(Priority::Medium)),
                Just(Some(Priority::High)),
                Just(Some(Priority::Critical)),
            ],
            proptest::option::of(0.0f64..1.0),
        )
            .prop_map(|(seg_type, tokens, priority, score)| {
                let mut seg = Segment::new(seg_type, "content").with_token_count(tokens);
                if let Some(p) = priority {
                    seg = seg.with_priority(p);
                }
                if let Some(s) = score {
                    seg = seg.with_score(s);
                }
                seg
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Budget safety: kept tokens never exceed the content budget unless
        /// the rigid tier alone overflowed (warn path).
        #[test]
        fn prop_budget_safety(
            segments in prop::collection::vec(arb_segment(), 0..40),
            max in 100u32..5_000,
            output in 0u32..50,
        ) {
            let segments: Vec<Segment> = segments
                .into_iter()
                .enumerate()
                .map(|(i, seg)| seg.with_seq(i))
                .collect();
            let manager = BudgetManager::new(BudgetPolicy {
                max_context_tokens: max,
                output_reserved: output.min(max.saturating_sub(1)),
                thinking_reserved: 0,
                ..Default::default()
            });
            let outcome = match manager.allocate(&segments, &CancelFlag::new()) {
                Ok(outcome) => outcome,
                Err(err) => {
                    prop_assert!(false, "allocate failed: {err:?}");
                    return Ok(());
                }
            };

            let content_budget = manager.policy().content_budget();
            let rigid = u64::from(outcome.allocation.rigid_used);
            let total = u64::from(outcome.allocation.total_used);
            if rigid <= u64::from(content_budget) {
                prop_assert!(
                    total <= u64::from(content_budget),
                    "total {total} > budget {content_budget}"
                );
            }
            // Elastic spend never exceeds its own budget even on overflow.
            let elastic: u64 = u64::from(outcome.allocation.elastic_total());
            prop_assert!(elastic <= u64::from(content_budget.saturating_sub(
                u32::try_from(rigid.min(u64::from(content_budget))).unwrap()
            )));
        }

        /// Audit completeness: exactly one decision per input segment, and
        /// kept/dropped partition the input.
        #[test]
        fn prop_audit_completeness(
            segments in prop::collection::vec(arb_segment(), 0..30),
        ) {
            let segments: Vec<Segment> = segments
                .into_iter()
                .enumerate()
                .map(|(i, seg)| seg.with_seq(i))
                .collect();
            let manager = BudgetManager::new(BudgetPolicy {
                max_context_tokens: 2_000,
                output_reserved: 100,
                thinking_reserved: 0,
                ..Default::default()
            });
            let outcome = manager.allocate(&segments, &CancelFlag::new()).unwrap();

            prop_assert_eq!(outcome.audit.len(), segments.len());
            prop_assert_eq!(outcome.kept.len() + outcome.dropped.len(), segments.len());
            for seg in &segments {
                let entries: Vec<_> = outcome
                    .audit
                    .iter()
                    .filter(|e| e.segment_id == seg.id)
                    .collect();
                prop_assert_eq!(entries.len(), 1, "segment {} has {} entries", seg.id, entries.len());
                let kept = outcome.kept.iter().any(|k| k.id == seg.id);
                match entries[0].decision {
                    Decision::Keep => prop_assert!(kept),
                    Decision::Drop => prop_assert!(!kept),
                    _ => prop_assert!(false, "unexpected decision"),
                }
            }
        }

        /// Order stability: segments of equal priority and score keep their
        /// relative input order in the kept set.
        #[test]
        fn prop_order_stability(
            tokens in prop::collection::vec(1u32..100, 2..20),
        ) {
            let segments: Vec<Segment> = tokens
                .iter()
                .enumerate()
                .map(|(i, &t)| {
                    Segment::new(SegmentType::Rag, "same")
                        .with_token_count(t)
                        .with_seq(i)
                })
                .collect();
            let mut policy = BudgetPolicy {
                max_context_tokens: 1_000,
                output_reserved: 0,
                thinking_reserved: 0,
                ..Default::default()
            };
            policy.elastic_ratios.clear();
            policy.elastic_ratios.insert(SegmentType::Rag, 1.0);
            let manager = BudgetManager::new(policy);
            let outcome = manager.allocate(&segments, &CancelFlag::new()).unwrap();

            let seqs: Vec<usize> = outcome.kept.iter().map(|s| s.seq).collect();
            let mut sorted = seqs.clone();
            sorted.sort_unstable();
            prop_assert_eq!(seqs, sorted);
        }
    }
}

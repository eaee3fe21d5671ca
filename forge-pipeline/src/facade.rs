//! The build facade

use crate::stages::{
    AllocateStage, AssembleStage, CompressStage, NormalizeStage, RerankStage, SanitizeStage,
};
use crate::{BuildRequest, Metrics, Pipeline, PipelineContext};
use forge_antipattern::{Detector, Finding, InspectContext, Severity};
use forge_cache::{package_key, prefix_key, CacheBackend, TieredCache};
use forge_compress::{
    CompressEngine, Compressor, DedupCompressor, SummaryCompressor, TruncationCompressor,
    TruncationMode,
};
use forge_core::{
    CancelFlag, CompressorKind, ContextPackage, ForgeError, ForgeResult, PolicyConfig, Segment,
    TokenUsage,
};
use forge_llm::TextGenerator;
use forge_router::{RouteRequest, Router};
use forge_tokenizer::TokenizerRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The engine facade. One instance serves many concurrent `build` calls;
/// the caches are the only shared mutable state.
pub struct Forge {
    policy: Arc<PolicyConfig>,
    registry: Arc<TokenizerRegistry>,
    pipeline: Pipeline,
    package_cache: Option<Arc<TieredCache>>,
    prefix_cache: Option<Arc<TieredCache>>,
    router: Option<Arc<dyn Router>>,
    detector: Detector,
    metrics: Arc<Metrics>,
    sanitizer_names: Vec<String>,
}

/// Construction-time options the policy file cannot express: live trait
/// objects for the L2 backend, the router, and the summarizer.
#[derive(Default)]
pub struct ForgeBuilder {
    policy: PolicyConfig,
    l2_backend: Option<Arc<dyn CacheBackend>>,
    router: Option<Arc<dyn Router>>,
    summarizer: Option<Arc<dyn TextGenerator>>,
    skip_stages: HashSet<String>,
}

impl Forge {
    /// Build an engine from a policy with no external collaborators.
    pub fn new(policy: PolicyConfig) -> ForgeResult<Self> {
        ForgeBuilder::new(policy).build()
    }

    pub fn builder(policy: PolicyConfig) -> ForgeBuilder {
        ForgeBuilder::new(policy)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Assemble a context package for one request.
    pub async fn build(&self, request: BuildRequest) -> ForgeResult<ContextPackage> {
        self.build_with_cancel(request, CancelFlag::new()).await
    }

    /// Assemble a package for an agent on a context bus: everything the
    /// agent may see (its namespace, the shared namespace, explicit grants)
    /// joins the request's own inputs as provisional segments. Bus content
    /// is mutable between calls, so these builds bypass the package cache.
    pub async fn build_for_agent(
        &self,
        bus: &forge_bus::ContextBus,
        agent: forge_core::AgentId,
        request: BuildRequest,
    ) -> ForgeResult<ContextPackage> {
        let visible = bus.visible_segments(agent)?;
        let started = Instant::now();
        let result = self
            .build_inner(&request, visible, CancelFlag::new(), started)
            .await;
        match &result {
            Ok(_) => self.metrics.record_build(),
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    /// `build` with a caller-held cancellation flag. Cancellation yields a
    /// structured error, never a partial package.
    pub async fn build_with_cancel(
        &self,
        request: BuildRequest,
        cancel: CancelFlag,
    ) -> ForgeResult<ContextPackage> {
        let started = Instant::now();
        let result = self.build_inner(&request, Vec::new(), cancel, started).await;
        match &result {
            Ok(package) => {
                self.metrics.record_build();
                info!(
                    request_id = %package.request_id,
                    model = %package.model,
                    segments = package.segments.len(),
                    tokens = package.token_usage.total_tokens,
                    duration_ms = format!("{:.1}", package.assembly_duration_ms),
                    "build complete"
                );
            }
            Err(err) => {
                self.metrics.record_failure();
                warn!(error = %err, "build failed");
            }
        }
        result
    }

    async fn build_inner(
        &self,
        request: &BuildRequest,
        extra_segments: Vec<Segment>,
        cancel: CancelFlag,
        started: Instant,
    ) -> ForgeResult<ContextPackage> {
        let default_model = self.policy.routing.default_model.clone();

        // Package cache: an exact input recurrence skips the pipeline. Bus
        // segments are not part of the serialized request, so builds that
        // carry them cannot use the cache.
        let package_cache_key = package_key(
            &request.cache_input(),
            &default_model,
            &self.policy.version,
        );
        let cacheable = extra_segments.is_empty();
        if let Some(cache) = self.package_cache.as_ref().filter(|_| cacheable) {
            if let Some(entry) = cache.get(&package_cache_key).await {
                match serde_json::from_slice::<ContextPackage>(&entry.value) {
                    Ok(package) => {
                        self.metrics.record_cache_hit();
                        debug!(request_id = %package.request_id, "package cache hit");
                        return Ok(package);
                    }
                    Err(err) => {
                        warn!(error = %err, "package cache entry undecodable, rebuilding");
                    }
                }
            }
            self.metrics.record_cache_miss();
        }

        // Routing: pick the model, possibly adjust the budget.
        let mut model = default_model.clone();
        let mut policy = Arc::clone(&self.policy);
        let mut routing_decision = None;
        if self.policy.routing.enabled {
            if let Some(router) = &self.router {
                let decision = router
                    .route(&RouteRequest {
                        query: request.user_query(),
                        token_count: self.estimate_request_tokens(request, &model)?,
                        segment_types: request
                            .to_segments()
                            .iter()
                            .map(|seg| seg.segment_type)
                            .collect(),
                    })
                    .await?;
                model = decision.selected_model.id.clone();
                if let Some(adjustment) = &decision.budget_adjustment {
                    let mut adjusted = (*policy).clone();
                    if let Some(max) = adjustment.max_context_tokens {
                        adjusted.budget.max_context_tokens = max;
                    }
                    if let Some(reserved) = adjustment.output_reserved {
                        adjusted.budget.output_reserved = reserved;
                    }
                    adjusted.validate()?;
                    policy = Arc::new(adjusted);
                }
                routing_decision = Some(decision);
            }
        }

        // Expand inputs, reusing a token-counted head when the prefix cache
        // has seen it for this model and policy.
        let mut segments = self.expand_segments(request, &model).await?;
        let base = segments.len();
        segments.extend(
            extra_segments
                .into_iter()
                .enumerate()
                .map(|(i, seg)| seg.with_seq(base + i)),
        );

        // Run the pipeline.
        let mut ctx = PipelineContext::new(model.clone(), policy, Arc::clone(&self.registry))
            .with_cancel(cancel);
        if let Some(decision) = &routing_decision {
            ctx.metadata.insert(
                "routing".to_string(),
                serde_json::to_value(decision).unwrap_or_default(),
            );
        }
        let final_segments = self.pipeline.execute(segments, &mut ctx).await?;

        // Assemble the package.
        let mut package = ContextPackage::new(model, self.policy.version.clone());
        package.token_usage = TokenUsage::from_segments(&final_segments);
        package.budget_allocation = ctx.budget_allocation.take().unwrap_or_default();
        package.segments = final_segments;
        package.audit_log = ctx.audit_log;
        package.warnings = ctx.warnings;
        package.metadata = ctx.metadata;
        package.metadata.insert(
            "stage_timings_ms".to_string(),
            serde_json::to_value(
                ctx.stage_timings
                    .iter()
                    .map(|(name, ms)| (name.clone(), (*ms * 100.0).round() / 100.0))
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_default(),
        );
        for (name, elapsed) in &ctx.stage_timings {
            self.metrics.record_stage(name, *elapsed);
        }
        let dropped = package
            .audit_log
            .iter()
            .filter(|entry| entry.decision == forge_core::Decision::Drop)
            .count();
        self.metrics.record_dropped(dropped as u64);

        package.assembly_duration_ms = started.elapsed().as_secs_f64() * 1_000.0;

        // Write caches before inspection so a later identical request can
        // still hit even when findings are attached.
        self.write_prefix_cache(request, &package).await;
        if let Some(cache) = self.package_cache.as_ref().filter(|_| cacheable) {
            if let Ok(bytes) = serde_json::to_vec(&package) {
                cache.set(package_cache_key, bytes).await;
            }
        }

        // Anti-pattern inspection.
        if self.policy.antipattern.enabled {
            let findings = self.detector.inspect(
                &package,
                &self.policy.antipattern,
                &InspectContext {
                    target_namespace: Some(if request.target_namespace.is_empty() {
                        "default".to_string()
                    } else {
                        request.target_namespace.clone()
                    }),
                    default_model: Some(default_model),
                    routing_ran: routing_decision.is_some(),
                    active_sanitizers: self.sanitizer_names.clone(),
                },
            );
            let critical: Vec<&Finding> = findings
                .iter()
                .filter(|f| f.severity == Severity::Critical)
                .collect();
            if self.policy.antipattern.fail_on_critical && !critical.is_empty() {
                return Err(ForgeError::AntipatternCritical {
                    findings: critical.iter().map(|f| f.title.clone()).collect(),
                });
            }
            for finding in &findings {
                package
                    .warnings
                    .push(format!("antipattern[{:?}] {}", finding.severity, finding.title));
            }
        }

        Ok(package)
    }

    /// Head segments come from the prefix cache when possible; the dynamic
    /// tail is always expanded fresh.
    async fn expand_segments(
        &self,
        request: &BuildRequest,
        model: &str,
    ) -> ForgeResult<Vec<Segment>> {
        let mut head: Option<Vec<Segment>> = None;

        if let Some(cache) = &self.prefix_cache {
            let key = prefix_key(
                &[request.head_cache_input()],
                model,
                &self.policy.version,
            );
            if let Some(entry) = cache.get(&key).await {
                if let Ok(cached) = serde_json::from_slice::<Vec<Segment>>(&entry.value) {
                    debug!(segments = cached.len(), "prefix cache hit");
                    head = Some(cached);
                }
            }
        }

        let head = match head {
            Some(head) => head,
            None => {
                // Count head tokens once up front; Normalize leaves
                // pre-populated counts alone unless content changes.
                let counter = self.registry.resolve(model)?;
                request
                    .head_segments()
                    .into_iter()
                    .map(|seg| {
                        let count =
                            u32::try_from(counter.count(&seg.content)).unwrap_or(u32::MAX);
                        seg.with_token_count(count)
                    })
                    .collect()
            }
        };

        let mut segments = head;
        segments.extend(request.dynamic_segments(segments.len()));
        Ok(segments)
    }

    /// Store the processed static head for the next request with the same
    /// system prompt, tools, and few-shot block.
    async fn write_prefix_cache(&self, request: &BuildRequest, package: &ContextPackage) {
        let Some(cache) = &self.prefix_cache else {
            return;
        };
        let head: Vec<Segment> = package
            .segments
            .iter()
            .filter(|seg| {
                matches!(
                    seg.segment_type,
                    forge_core::SegmentType::System
                        | forge_core::SegmentType::ToolDefinition
                        | forge_core::SegmentType::FewShot
                )
            })
            .cloned()
            .collect();
        // Only a head that survived intact is safe to replay into other
        // requests: a compressed or partially dropped head reflects this
        // request's budget pressure, not the inputs.
        let expected = request.head_segments().len();
        if head.is_empty()
            || head.len() != expected
            || head
                .iter()
                .any(|seg| seg.provenance.source_type == forge_core::SourceType::Compression)
        {
            return;
        }
        let key = prefix_key(
            &[request.head_cache_input()],
            &package.model,
            &self.policy.version,
        );
        if let Ok(bytes) = serde_json::to_vec(&head) {
            cache.set(key, bytes).await;
        }
    }

    fn estimate_request_tokens(&self, request: &BuildRequest, model: &str) -> ForgeResult<u64> {
        let counter = self.registry.resolve(model)?;
        Ok(request
            .to_segments()
            .iter()
            .map(|seg| counter.count(&seg.content) as u64)
            .sum())
    }
}

impl ForgeBuilder {
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Attach an out-of-process cache backend (policy backend `external`).
    pub fn with_l2_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.l2_backend = Some(backend);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    /// Provider for the abstractive compressor.
    pub fn with_summarizer(mut self, provider: Arc<dyn TextGenerator>) -> Self {
        self.summarizer = Some(provider);
        self
    }

    pub fn skip_stage(mut self, name: impl Into<String>) -> Self {
        self.skip_stages.insert(name.into());
        self
    }

    pub fn build(self) -> ForgeResult<Forge> {
        self.policy.validate()?;
        let policy = Arc::new(self.policy);
        let registry = Arc::new(TokenizerRegistry::new());

        // Caches per the cache policy section.
        let make_cache = |enabled: bool| -> Option<Arc<TieredCache>> {
            if !policy.cache.enabled || !enabled {
                return None;
            }
            let mut cache = TieredCache::new(
                policy.cache.max_entries,
                Some(policy.cache.ttl_seconds),
            );
            if let Some(backend) = &self.l2_backend {
                cache = cache.with_backend(Arc::clone(backend));
            }
            Some(Arc::new(cache))
        };
        let package_cache = make_cache(policy.cache.package_cache);
        let prefix_cache = make_cache(policy.cache.prefix_cache);
        let segment_cache = make_cache(true);

        // Default compressor per policy, with summary degrading to
        // truncation when no provider was attached.
        let default_compressor: Arc<dyn Compressor> = match policy.compress.default_compressor {
            CompressorKind::Truncation => {
                Arc::new(TruncationCompressor::new(TruncationMode::Tail))
            }
            CompressorKind::Dedup => {
                Arc::new(DedupCompressor::new(policy.rerank.similarity_threshold))
            }
            CompressorKind::Summary => match &self.summarizer {
                Some(provider) => {
                    let compressor = SummaryCompressor::new(Arc::clone(provider));
                    if policy.compress.fallback_to_truncation {
                        Arc::new(compressor)
                    } else {
                        Arc::new(compressor.without_fallback())
                    }
                }
                None => {
                    warn!("summary compressor configured without a provider, using truncation");
                    Arc::new(TruncationCompressor::new(TruncationMode::Tail))
                }
            },
        };
        let engine = Arc::new(
            CompressEngine::new(
                policy.compress.saturation_trigger,
                policy.compress.preserve_must_keep,
                policy.compress.min_segment_tokens,
                default_compressor,
            )
            .with_dedup(DedupCompressor::new(policy.rerank.similarity_threshold)),
        );

        let mut sanitize_stage = SanitizeStage::from_policy(&policy.sanitize);
        if let Some(cache) = &segment_cache {
            sanitize_stage = sanitize_stage.with_segment_cache(Arc::clone(cache));
        }
        let sanitizer_names = sanitize_stage.sanitizer_names();

        let mut stages: Vec<Box<dyn crate::PipelineStage>> = vec![
            Box::new(NormalizeStage::new()),
            Box::new(sanitize_stage),
            Box::new(RerankStage::new(policy.rerank.clone())),
            Box::new(AllocateStage::new()),
        ];
        if policy.compress.enabled {
            stages.push(Box::new(CompressStage::new(engine)));
        }
        stages.push(Box::new(AssembleStage::new()));

        let pipeline = Pipeline::new(stages).with_skip(self.skip_stages);

        Ok(Forge {
            policy,
            registry,
            pipeline,
            package_cache,
            prefix_cache,
            router: self.router,
            detector: Detector::new(),
            metrics: Arc::new(Metrics::new()),
            sanitizer_names,
        })
    }
}

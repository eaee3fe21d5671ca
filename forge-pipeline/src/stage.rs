//! Stage trait and the ordered runtime

use crate::PipelineContext;
use async_trait::async_trait;
use forge_core::{ForgeError, ForgeResult, Segment, StageError};
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

/// One pipeline stage. Stages receive the full segment list and the shared
/// context, and return the list for the next stage.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stage name, used for skip sets, replacement, timings and audit.
    fn name(&self) -> &str;

    async fn process(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>>;
}

/// Ordered stage executor. Stages named in the skip set are bypassed; a
/// stage can be swapped out by name at construction time. Per-stage
/// wall-clock lands in the context; any stage failure is wrapped with the
/// stage name and is fatal for the request.
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    skip: HashSet<String>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn PipelineStage>>) -> Self {
        Self {
            stages,
            skip: HashSet::new(),
        }
    }

    pub fn with_skip(mut self, skip: impl IntoIterator<Item = String>) -> Self {
        self.skip = skip.into_iter().collect();
        self
    }

    /// Replace the stage with the given name. No-op when absent.
    pub fn replace_stage(&mut self, name: &str, stage: Box<dyn PipelineStage>) {
        for slot in &mut self.stages {
            if slot.name() == name {
                *slot = stage;
                return;
            }
        }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run all stages in order. Cancellation is checked between stages.
    pub async fn execute(
        &self,
        segments: Vec<Segment>,
        ctx: &mut PipelineContext,
    ) -> ForgeResult<Vec<Segment>> {
        let mut current = segments;

        for stage in &self.stages {
            if self.skip.contains(stage.name()) {
                debug!(stage = stage.name(), "stage skipped");
                continue;
            }
            ctx.cancel.check()?;

            let input_count = current.len();
            let start = Instant::now();

            current = stage.process(current, ctx).await.map_err(|err| {
                let err = match err {
                    // Already wrapped by an inner runtime.
                    ForgeError::Stage(_) | ForgeError::Cancelled => err,
                    other => ForgeError::Stage(StageError {
                        stage: stage.name().to_string(),
                        source: Box::new(other),
                    }),
                };
                err
            })?;

            let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;
            ctx.stage_timings.push((stage.name().to_string(), elapsed_ms));

            if ctx.debug {
                debug!(
                    stage = stage.name(),
                    input = input_count,
                    output = current.len(),
                    elapsed_ms = format!("{elapsed_ms:.2}"),
                    "stage complete"
                );
            }
        }

        Ok(current)
    }
}

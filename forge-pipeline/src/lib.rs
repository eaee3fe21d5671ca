//! FORGE Pipeline - Stage Runtime and Build Facade
//!
//! The orchestration layer: a staged, pluggable pipeline
//! (Normalize -> Sanitize -> Rerank -> Allocate -> Compress -> Assemble)
//! driven by a single request-scoped context, and the `Forge` facade that
//! wires routing, caching, metrics, and anti-pattern inspection around it.

mod context;
mod stage;
mod request;
mod metrics;
mod facade;
pub mod stages;

pub use context::PipelineContext;

pub use stage::{Pipeline, PipelineStage};

pub use request::{BuildRequest, Message, RagChunk, ToolSpec};

pub use metrics::{Metrics, MetricsSnapshot, StageTiming};

pub use facade::Forge;

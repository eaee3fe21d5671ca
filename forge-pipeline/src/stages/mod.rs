//! The six standard stages

mod normalize;
mod sanitize;
mod rerank;
mod allocate;
mod compress;
mod assemble;

pub use normalize::NormalizeStage;

pub use sanitize::SanitizeStage;

pub use rerank::RerankStage;

pub use allocate::AllocateStage;

pub use compress::CompressStage;

pub use assemble::AssembleStage;

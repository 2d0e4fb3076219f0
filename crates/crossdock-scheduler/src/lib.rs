//! Release pipeline orchestration for crossdock.
//!
//! Runs builds in parallel, collects their outputs into the staging tree,
//! provisions the image repository once and publishes the
//! multi-architecture image.

pub mod orchestrator;

pub use orchestrator::{
    PipelineConfig, PipelineEvent, PipelineOrchestrator, PipelineResult, StageState, TargetState,
};

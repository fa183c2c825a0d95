// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod assemble;
pub mod batch;
pub mod config;
pub mod error;
pub mod extract;
pub mod generation;
pub mod grounding;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod retrieval;
pub mod review;
pub mod similarity;
pub mod style;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::assemble::Assembler;
pub use crate::batch::{BatchHarness, BatchOutcome, BatchRunResult};
pub use crate::config::PipelineConfig;
pub use crate::error::{
    MalformedMarkerError, PipelineError, ResponseFormatError, RetrievalFailure,
    SectionGenerationError, UnresolvedCitationError,
};
pub use crate::grounding::GroundingEngine;
pub use crate::model::{Citation, Judgement, PipelineInput, Report, Section, SourceDocument};
pub use crate::pipeline::Pipeline;

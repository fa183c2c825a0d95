//! Per-section review loop: a pure state machine (`state`) and the async
//! controller that drives it against the generation service.

pub mod controller;
pub mod state;

pub use controller::{ReviewController, SectionOutcome};
pub use state::{Decision, FinalizeReason, LoopState, Phase, QualitySignal, ReviewPolicy};

//! Pure review-loop state machine: phases, the revise/finalize decision and
//! best-draft bookkeeping. No I/O here.

use serde::{Deserialize, Serialize};

use crate::config::{ReviewConfig, MAX_REVIEW_ITERATIONS};
use crate::grounding::GroundedSection;
use crate::model::ReviewFeedback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Drafting,
    Extracting,
    Grounding,
    Reviewing,
    Revising,
    Finalizing,
}

impl Phase {
    /// Next phase. `decision` is only consulted when leaving `Reviewing`.
    pub fn next(self, decision: Option<Decision>) -> Phase {
        match self {
            Phase::Drafting | Phase::Revising => Phase::Extracting,
            Phase::Extracting => Phase::Grounding,
            Phase::Grounding => Phase::Reviewing,
            Phase::Reviewing => match decision {
                Some(Decision::Revise) => Phase::Revising,
                _ => Phase::Finalizing,
            },
            Phase::Finalizing => Phase::Finalizing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    Accepted,
    IterationCap,
    Cancelled,
    /// Generation gave up; the section is a placeholder.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Revise,
    Finalize(FinalizeReason),
}

/// Grounding outcome of one iteration, as shown to the reviewer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualitySignal {
    pub total_claims: usize,
    pub unsupported_claims: usize,
    pub unsupported_ratio: f32,
    pub key_points: usize,
    pub below_min_key_points: bool,
    pub malformed_markers: bool,
    /// A few unsupported claim texts for the reviewer to address.
    pub unsupported_examples: Vec<String>,
}

impl QualitySignal {
    pub fn from_grounded(grounded: &GroundedSection, min_key_points: usize) -> Self {
        let key_points = grounded.draft.key_points.len();
        Self {
            total_claims: grounded.total_claims(),
            unsupported_claims: grounded.unsupported_claims(),
            unsupported_ratio: grounded.unsupported_ratio(),
            key_points,
            below_min_key_points: key_points < min_key_points,
            malformed_markers: grounded.malformed.is_some(),
            unsupported_examples: grounded.unsupported_texts().into_iter().take(5).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPolicy {
    pub max_iterations: u32,
    pub unsupported_tolerance: f32,
    pub min_key_points: usize,
    pub min_review_confidence: Option<f32>,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self::from(&ReviewConfig::default())
    }
}

impl From<&ReviewConfig> for ReviewPolicy {
    fn from(c: &ReviewConfig) -> Self {
        Self {
            max_iterations: c.max_iterations.clamp(1, MAX_REVIEW_ITERATIONS),
            unsupported_tolerance: c.unsupported_tolerance,
            min_key_points: c.min_key_points,
            min_review_confidence: c.min_review_confidence,
        }
    }
}

impl ReviewPolicy {
    /// Whether this iteration's result calls for another draft.
    pub fn needs_revision(&self, signal: &QualitySignal, feedback: Option<&ReviewFeedback>) -> bool {
        if signal.malformed_markers || signal.unsupported_ratio > self.unsupported_tolerance {
            return true;
        }
        let Some(fb) = feedback else {
            return false;
        };
        if !fb.priority_fixes.is_empty() {
            return true;
        }
        match (self.min_review_confidence, fb.confidence_score) {
            (Some(min), Some(score)) => score < min,
            _ => false,
        }
    }

    /// `completed` is the number of drafts produced so far (1-based).
    pub fn decide(
        &self,
        completed: u32,
        signal: &QualitySignal,
        feedback: Option<&ReviewFeedback>,
    ) -> Decision {
        if !self.needs_revision(signal, feedback) {
            Decision::Finalize(FinalizeReason::Accepted)
        } else if completed >= self.max_iterations {
            Decision::Finalize(FinalizeReason::IterationCap)
        } else {
            Decision::Revise
        }
    }
}

/// One finished iteration.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub iteration: u32,
    pub grounded: GroundedSection,
    pub signal: QualitySignal,
    pub feedback: Option<ReviewFeedback>,
}

impl Candidate {
    /// Strictly better: well-formed beats malformed, then lower unsupported
    /// ratio. Equal candidates never replace an earlier one.
    pub fn beats(&self, other: &Candidate) -> bool {
        match (self.signal.malformed_markers, other.signal.malformed_markers) {
            (false, true) => true,
            (true, false) => false,
            _ => self.signal.unsupported_ratio < other.signal.unsupported_ratio,
        }
    }
}

#[derive(Debug)]
pub struct LoopState {
    pub phase: Phase,
    pub completed: u32,
    latest: Option<Candidate>,
    best: Option<Candidate>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Drafting,
            completed: 0,
            latest: None,
            best: None,
        }
    }

    pub fn advance(&mut self, decision: Option<Decision>) -> Phase {
        self.phase = self.phase.next(decision);
        self.phase
    }

    pub fn record(&mut self, candidate: Candidate) {
        self.completed = self.completed.max(candidate.iteration);
        let replace = match &self.best {
            Some(best) => candidate.beats(best),
            None => true,
        };
        if replace {
            self.best = Some(candidate.clone());
        }
        self.latest = Some(candidate);
    }

    pub fn latest(&self) -> Option<&Candidate> {
        self.latest.as_ref()
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    /// Accepted drafts finalize as-is; capped or cancelled loops fall back
    /// to the best draft seen.
    pub fn into_final(self, reason: FinalizeReason) -> Option<Candidate> {
        match reason {
            FinalizeReason::Accepted => self.latest.or(self.best),
            FinalizeReason::IterationCap | FinalizeReason::Cancelled | FinalizeReason::Failed => {
                self.best.or(self.latest)
            }
        }
    }
}

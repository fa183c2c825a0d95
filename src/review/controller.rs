//! Drives one section through draft → ground → review until it is accepted,
//! the iteration cap is hit, or the run is cancelled.

use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{Candidate, Decision, FinalizeReason, LoopState, QualitySignal, ReviewPolicy};
use crate::config::ReviewConfig;
use crate::error::{GenerationError, SectionGenerationError, Stage};
use crate::generation::{
    generate_validated, parse_review_feedback, parse_section_draft, DynGenerator,
    GenerationRequest, RetryPolicy, SourceDigest,
};
use crate::grounding::GroundingEngine;
use crate::model::{ReviewFeedback, Section, SourceDocument};

/// Finished section plus what the loop went through to get there.
#[derive(Debug, Clone)]
pub struct SectionOutcome {
    pub index: usize,
    pub section: Section,
    pub review: Option<ReviewFeedback>,
    pub iterations: u32,
    pub reason: FinalizeReason,
    pub error: Option<SectionGenerationError>,
}

pub struct ReviewController {
    generator: DynGenerator,
    policy: ReviewPolicy,
    retry: RetryPolicy,
}

impl ReviewController {
    pub fn new(generator: DynGenerator, config: &ReviewConfig) -> Self {
        Self {
            generator,
            policy: ReviewPolicy::from(config),
            retry: RetryPolicy {
                retries: config.generation_retries,
                backoff: Duration::from_millis(config.retry_backoff_ms),
            },
        }
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    pub async fn run_section(
        &self,
        query: &str,
        index: usize,
        title: &str,
        engine: &GroundingEngine,
        pool: &[SourceDocument],
        cancel: &CancellationToken,
    ) -> SectionOutcome {
        let digests: Vec<SourceDigest> = pool.iter().map(SourceDigest::from).collect();
        let mut state = LoopState::new();
        let mut feedback: Option<ReviewFeedback> = None;
        let mut previous_draft: Option<String> = None;

        let reason = loop {
            if cancel.is_cancelled() {
                break FinalizeReason::Cancelled;
            }
            let iteration = state.completed + 1;
            counter!("review_iterations_total").increment(1);

            // Drafting / Revising
            let request = GenerationRequest::DraftSection {
                query: query.to_string(),
                section: title.to_string(),
                sources: digests.clone(),
                min_key_points: self.policy.min_key_points,
                previous_draft: previous_draft.clone(),
                feedback: feedback.clone(),
                strict: false,
            };
            let draft = match generate_validated(
                self.generator.as_ref(),
                request,
                &self.retry,
                cancel,
                parse_section_draft,
            )
            .await
            {
                Ok(d) => d,
                Err(f) if matches!(f.error, GenerationError::Cancelled) => {
                    break FinalizeReason::Cancelled
                }
                Err(f) => {
                    let err = SectionGenerationError {
                        section: title.to_string(),
                        stage: Stage::Drafting,
                        attempts: f.attempts,
                        reason: f.error.to_string(),
                    };
                    return self.fail(index, title, state, err);
                }
            };
            state.advance(None);

            // Extracting + Grounding
            let grounded = engine.ground_section(index, title, draft, pool);
            state.advance(None);
            let signal = QualitySignal::from_grounded(&grounded, self.policy.min_key_points);
            state.advance(None);

            // Reviewing
            let content = grounded.content();
            let request = GenerationRequest::Review {
                query: query.to_string(),
                section: title.to_string(),
                draft: content.clone(),
                key_points: grounded.draft.key_points.clone(),
                quality: signal.clone(),
                strict: false,
            };
            let review = match generate_validated(
                self.generator.as_ref(),
                request,
                &self.retry,
                cancel,
                parse_review_feedback,
            )
            .await
            {
                Ok(fb) => fb,
                Err(f) if matches!(f.error, GenerationError::Cancelled) => {
                    break FinalizeReason::Cancelled
                }
                Err(f) => {
                    let err = SectionGenerationError {
                        section: title.to_string(),
                        stage: Stage::Reviewing,
                        attempts: f.attempts,
                        reason: f.error.to_string(),
                    };
                    return self.fail(index, title, state, err);
                }
            };

            let decision = self.policy.decide(iteration, &signal, Some(&review));
            debug!(
                target: "review",
                section = title,
                iteration,
                unsupported_ratio = signal.unsupported_ratio,
                priority_fixes = review.priority_fixes.len(),
                ?decision,
                "iteration reviewed"
            );
            state.record(Candidate {
                iteration,
                grounded,
                signal,
                feedback: Some(review.clone()),
            });
            state.advance(Some(decision));

            match decision {
                Decision::Revise => {
                    previous_draft = Some(content);
                    feedback = Some(review);
                }
                Decision::Finalize(reason) => break reason,
            }
        };

        self.finish(index, title, state, reason)
    }

    fn finish(
        &self,
        index: usize,
        title: &str,
        state: LoopState,
        reason: FinalizeReason,
    ) -> SectionOutcome {
        let iterations = state.completed;
        match state.into_final(reason) {
            Some(candidate) => {
                info!(
                    target: "review",
                    section = title,
                    iterations,
                    chosen = candidate.iteration,
                    unsupported_ratio = candidate.signal.unsupported_ratio,
                    ?reason,
                    "section finalized"
                );
                let review = candidate.feedback.clone();
                let section = candidate.grounded.finalize(iterations);
                SectionOutcome {
                    index,
                    section,
                    review,
                    iterations,
                    reason,
                    error: None,
                }
            }
            None => {
                warn!(target: "review", section = title, ?reason, "no draft produced, using placeholder");
                counter!("sections_placeholder_total").increment(1);
                SectionOutcome {
                    index,
                    section: Section::placeholder(title, "cancelled before a draft was produced", 0),
                    review: None,
                    iterations: 0,
                    reason,
                    error: None,
                }
            }
        }
    }

    /// Generation gave up: the section becomes a placeholder.
    fn fail(
        &self,
        index: usize,
        title: &str,
        state: LoopState,
        err: SectionGenerationError,
    ) -> SectionOutcome {
        warn!(target: "review", section = title, error = %err, "section generation failed");
        counter!("sections_placeholder_total").increment(1);
        let iterations = state.completed;
        SectionOutcome {
            index,
            section: Section::placeholder(title, err.to_string(), iterations),
            review: None,
            iterations,
            reason: FinalizeReason::Failed,
            error: Some(err),
        }
    }
}

//! Citation grounding: resolve every claim against the retrieved sources,
//! keep the best one at or above the threshold, drop the rest.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::error::MalformedMarkerError;
use crate::extract::{extract_claims, rewrite_markers, sanitize_malformed, strip_markers};
use crate::model::{Citation, Claim, Section, SectionDraft, SectionQuality, SourceDocument};
use crate::similarity::SimilarityScorer;
use crate::style::{valid_url, CitationStyle};
use crate::telemetry::anon_id;

pub const DEFAULT_TIE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSource {
    pub source_id: String,
    pub retrieval_rank: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Grounding {
    Supported(ScoredSource),
    /// Best candidate is kept for diagnostics even though it missed the threshold.
    Unsupported { best: Option<ScoredSource> },
}

impl Grounding {
    pub fn is_supported(&self) -> bool {
        matches!(self, Grounding::Supported(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimOutcome {
    pub claim: Claim,
    pub grounding: Grounding,
}

/// A draft after grounding. Citations carry section-local ids.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundedSection {
    pub section_id: usize,
    pub title: String,
    pub draft: SectionDraft,
    pub outcomes: Vec<ClaimOutcome>,
    pub malformed: Option<MalformedMarkerError>,
    pub citations: Vec<Citation>,
    // local citation id per outcome, None for unsupported claims
    local_ids: Vec<Option<u32>>,
}

impl GroundedSection {
    pub fn total_claims(&self) -> usize {
        self.outcomes.len()
    }

    pub fn unsupported_claims(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !o.grounding.is_supported())
            .count()
    }

    /// Malformed drafts count as fully unsupported.
    pub fn unsupported_ratio(&self) -> f32 {
        if self.malformed.is_some() {
            return 1.0;
        }
        let total = self.total_claims();
        if total == 0 {
            0.0
        } else {
            self.unsupported_claims() as f32 / total as f32
        }
    }

    pub fn unsupported_texts(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.grounding.is_supported())
            .map(|o| o.claim.text.clone())
            .collect()
    }

    /// Draft content with supported markers renumbered to local ids and
    /// unsupported markers removed. A marker repeating the id of the marker
    /// right before it, separated only by spaces (`[1] [1]`), is dropped.
    pub fn content(&self) -> String {
        let text = &self.draft.content;
        if self.malformed.is_some() {
            return sanitize_malformed(text);
        }
        let mut previous: Option<(usize, u32)> = None;
        rewrite_markers(text, |i, m| {
            let id = self.local_ids.get(i).copied().flatten()?;
            let repeated = matches!(
                previous,
                Some((end, prev)) if prev == id && text[end..m.span.start].trim().is_empty()
            );
            previous = Some((m.span.end, id));
            (!repeated).then(|| format!("[{id}]"))
        })
        .unwrap_or_else(|_| sanitize_malformed(text))
    }

    pub fn finalize(self, iterations: u32) -> Section {
        let content = self.content();
        let quality = SectionQuality {
            placeholder: false,
            total_claims: self.total_claims(),
            unsupported_claims: self.unsupported_claims(),
            unsupported_ratio: self.unsupported_ratio(),
            iterations,
            malformed_markers: self.malformed.is_some(),
            failure: None,
        };
        Section {
            title: self.title,
            content,
            key_points: self
                .draft
                .key_points
                .iter()
                .map(|kp| strip_markers(kp))
                .filter(|kp| !kp.is_empty())
                .collect(),
            citations: self.citations,
            quality,
        }
    }
}

pub struct GroundingEngine {
    threshold: f32,
    tie_epsilon: f32,
    style: CitationStyle,
    scorer: Arc<dyn SimilarityScorer>,
}

impl GroundingEngine {
    pub fn new(threshold: f32, scorer: Arc<dyn SimilarityScorer>) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            tie_epsilon: DEFAULT_TIE_EPSILON,
            style: CitationStyle::default(),
            scorer,
        }
    }

    pub fn with_tie_epsilon(mut self, eps: f32) -> Self {
        self.tie_epsilon = eps.max(0.0);
        self
    }

    pub fn with_style(mut self, style: CitationStyle) -> Self {
        self.style = style;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn style(&self) -> CitationStyle {
        self.style
    }

    /// Highest-scoring source. Scores within `tie_epsilon` of the current best
    /// do not displace it, so the earlier retrieval rank wins ties.
    pub fn best_source(&self, claim_text: &str, pool: &[SourceDocument]) -> Option<ScoredSource> {
        let mut ordered: Vec<(usize, &SourceDocument)> = pool.iter().enumerate().collect();
        ordered.sort_by_key(|(pos, d)| (d.retrieval_rank, *pos));

        let mut best: Option<ScoredSource> = None;
        for (_, doc) in ordered {
            let score = self.scorer.score(claim_text, &doc.text);
            match &best {
                Some(b) if score <= b.score + self.tie_epsilon => {}
                _ => {
                    best = Some(ScoredSource {
                        source_id: doc.id.clone(),
                        retrieval_rank: doc.retrieval_rank,
                        score,
                    })
                }
            }
        }
        best
    }

    /// Threshold is inclusive: a score equal to it is supported.
    pub fn ground_claim(&self, claim: &Claim, pool: &[SourceDocument]) -> Grounding {
        if claim.text.trim().is_empty() {
            return Grounding::Unsupported { best: None };
        }
        match self.best_source(&claim.text, pool) {
            Some(best) if best.score >= self.threshold => Grounding::Supported(best),
            best => Grounding::Unsupported { best },
        }
    }

    pub fn ground_section(
        &self,
        section_id: usize,
        title: &str,
        draft: SectionDraft,
        pool: &[SourceDocument],
    ) -> GroundedSection {
        let claims = match extract_claims(section_id, &draft.content, &draft.declared_ids()) {
            Ok(claims) => claims,
            Err(err) => {
                warn!(
                    target: "grounding",
                    section = title,
                    error = %err,
                    "malformed citation markers in draft"
                );
                return GroundedSection {
                    section_id,
                    title: title.to_string(),
                    draft,
                    outcomes: Vec::new(),
                    malformed: Some(err),
                    citations: Vec::new(),
                    local_ids: Vec::new(),
                };
            }
        };

        let mut outcomes = Vec::with_capacity(claims.len());
        let mut local_ids = Vec::with_capacity(claims.len());
        let mut by_source: BTreeMap<String, u32> = BTreeMap::new();
        let mut citations: Vec<Citation> = Vec::new();

        for claim in claims {
            let grounding = self.ground_claim(&claim, pool);
            let local = match &grounding {
                Grounding::Supported(best) => {
                    let next = citations.len() as u32 + 1;
                    let id = *by_source.entry(best.source_id.clone()).or_insert(next);
                    if id == next {
                        citations.push(self.citation_for(id, &best.source_id, pool));
                    }
                    Some(id)
                }
                Grounding::Unsupported { .. } => None,
            };
            debug!(
                target: "grounding",
                section = title,
                claim = %anon_id(&claim.text),
                supported = local.is_some(),
                score = match &grounding {
                    Grounding::Supported(b) => b.score,
                    Grounding::Unsupported { best } => best.as_ref().map_or(0.0, |b| b.score),
                },
                threshold = self.threshold,
                "claim grounded"
            );
            local_ids.push(local);
            outcomes.push(ClaimOutcome { claim, grounding });
        }

        let grounded = GroundedSection {
            section_id,
            title: title.to_string(),
            draft,
            outcomes,
            malformed: None,
            citations,
            local_ids,
        };
        counter!("grounding_claims_total").increment(grounded.total_claims() as u64);
        counter!("grounding_unsupported_total").increment(grounded.unsupported_claims() as u64);
        grounded
    }

    fn citation_for(&self, id: u32, source_id: &str, pool: &[SourceDocument]) -> Citation {
        let doc = pool.iter().find(|d| d.id == source_id);
        Citation {
            id,
            source_ref: source_id.to_string(),
            display_text: doc
                .map(|d| self.style.format(d))
                .unwrap_or_else(|| source_id.to_string()),
            url: doc
                .and_then(|d| valid_url(&d.url))
                .unwrap_or_default()
                .to_string(),
        }
    }
}

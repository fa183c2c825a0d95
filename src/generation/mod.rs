//! Generation service boundary: request shapes, response validation and the
//! retry loop shared by drafting, reviewing, titling and judging.

pub mod cache;
pub mod openai;
pub mod scripted;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{GenerationError, ResponseFormatError};
use crate::model::{Judgement, ReviewFeedback, SectionDraft, SourceDocument};
use crate::review::state::QualitySignal;

pub use cache::CachingGenerator;
pub use openai::OpenAiGenerator;
pub use scripted::ScriptedGenerator;

pub const ENV_TEST_MODE: &str = "GENERATOR_TEST_MODE";
pub const ENV_DAILY_LIMIT: &str = "GENERATION_DAILY_LIMIT";
pub const ENV_CACHE_DIR: &str = "GENERATION_CACHE_DIR";
pub const DEFAULT_DAILY_LIMIT: u32 = 200;

const EXCERPT_CHARS: usize = 600;

/// Source as shown to the generator. `id` is the 1-based retrieval rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDigest {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
    pub excerpt: String,
}

impl From<&SourceDocument> for SourceDigest {
    fn from(d: &SourceDocument) -> Self {
        Self {
            id: d.retrieval_rank.to_string(),
            title: d.title.clone(),
            url: d.url.clone(),
            excerpt: d.text.chars().take(EXCERPT_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationRequest {
    Title {
        query: String,
    },
    DraftSection {
        query: String,
        section: String,
        sources: Vec<SourceDigest>,
        min_key_points: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_draft: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        feedback: Option<ReviewFeedback>,
        strict: bool,
    },
    Review {
        query: String,
        section: String,
        draft: String,
        key_points: Vec<String>,
        quality: QualitySignal,
        strict: bool,
    },
    /// Grade a finished report. Sees the rendered report and nothing else.
    Judge {
        query: String,
        report: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ground_truth: Option<String>,
        strict: bool,
    },
}

impl GenerationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationRequest::Title { .. } => "title",
            GenerationRequest::DraftSection { .. } => "draft",
            GenerationRequest::Review { .. } => "review",
            GenerationRequest::Judge { .. } => "judge",
        }
    }

    pub fn section(&self) -> Option<&str> {
        match self {
            GenerationRequest::Title { .. } | GenerationRequest::Judge { .. } => None,
            GenerationRequest::DraftSection { section, .. }
            | GenerationRequest::Review { section, .. } => Some(section),
        }
    }

    pub fn is_strict(&self) -> bool {
        match self {
            GenerationRequest::Title { .. } => false,
            GenerationRequest::DraftSection { strict, .. }
            | GenerationRequest::Review { strict, .. }
            | GenerationRequest::Judge { strict, .. } => *strict,
        }
    }

    /// Same request with the stricter format instructions turned on.
    pub fn strict(mut self) -> Self {
        match &mut self {
            GenerationRequest::Title { .. } => {}
            GenerationRequest::DraftSection { strict, .. }
            | GenerationRequest::Review { strict, .. }
            | GenerationRequest::Judge { strict, .. } => *strict = true,
        }
        self
    }

    /// System instructions for the service.
    pub fn instructions(&self) -> String {
        let base = match self {
            GenerationRequest::Title { .. } => {
                return "Generate a concise, professional title for a research report on the given query. \
                        Reply with the title only, on one line, without quotes."
                    .to_string();
            }
            GenerationRequest::DraftSection { min_key_points, .. } => format!(
                "Write the requested section of a research report using only the provided sources. \
                 Cite sources inline with numeric markers such as [1] or [2, 3], using the source ids. \
                 Every factual sentence needs a marker. If feedback and a previous draft are given, \
                 revise the draft to address the feedback. Reply with a JSON object: \
                 {{\"title\": string, \"content\": string, \"key_points\": [string] (at least {min_key_points}), \
                 \"citations\": [{{\"id\": string, \"text\": string, \"url\": string}}]}}."
            ),
            GenerationRequest::Review { .. } => "Review the section draft for accuracy, completeness, clarity and citation support. \
                 The quality object lists claims that no source supports. Reply with a JSON object: \
                 {\"strengths\": [string], \"weaknesses\": [string], \"missing_elements\": [string], \
                 \"priority_fixes\": [string], \"suggestions\": [string], \"confidence_score\": number between 0 and 1}."
                .to_string(),
            GenerationRequest::Judge { .. } => "Evaluate the research report. Score factual accuracy (claims match their sources), \
                 citation accuracy (citations match and are formatted consistently), completeness (the query is fully covered) \
                 and source quality (reliable, authoritative sources). Compare with the expected output when one is given. \
                 Every score is a number between 0 and 1. Reply with a JSON object: \
                 {\"factual_accuracy\": number, \"citation_accuracy\": number, \"completeness\": number, \
                 \"source_quality\": number, \"overall_score\": number, \"feedback\": [string], \"confidence\": number}."
                .to_string(),
        };
        if self.is_strict() {
            format!("{base} Output ONLY the JSON object. No prose, no markdown fences.")
        } else {
            base
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Raw response text for `request`. Validation happens in the caller.
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String>;
    fn name(&self) -> &'static str;
}

pub type DynGenerator = Arc<dyn TextGenerator>;

/// Generator from the environment:
///
/// * `GENERATOR_TEST_MODE=mock` gives the deterministic scripted generator.
/// * Otherwise the OpenAI adapter wrapped with the file cache and daily limit.
pub fn build_generator() -> anyhow::Result<DynGenerator> {
    if std::env::var(ENV_TEST_MODE)
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        info!(target: "generation", "using scripted generator (mock mode)");
        return Ok(Arc::new(ScriptedGenerator::new()));
    }
    let provider = OpenAiGenerator::from_env()?;
    let limit = std::env::var(ENV_DAILY_LIMIT)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(DEFAULT_DAILY_LIMIT);
    let dir = std::env::var(ENV_CACHE_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("cache/generation"));
    Ok(Arc::new(CachingGenerator::new(provider, dir, limit)))
}

// ------------------------------------------------------------
// Response validation
// ------------------------------------------------------------

/// Strip markdown fences and keep the outermost `{...}`.
pub fn clean_json_response(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

pub fn parse_section_draft(raw: &str) -> Result<SectionDraft, ResponseFormatError> {
    let body = clean_json_response(raw)
        .ok_or_else(|| ResponseFormatError::new("section", "no JSON object in response"))?;
    let draft: SectionDraft = serde_json::from_str(body)
        .map_err(|e| ResponseFormatError::new("section", e.to_string()))?;
    if draft.content.trim().is_empty() {
        return Err(ResponseFormatError::new("section", "content is empty"));
    }
    Ok(draft)
}

pub fn parse_review_feedback(raw: &str) -> Result<ReviewFeedback, ResponseFormatError> {
    let body = clean_json_response(raw)
        .ok_or_else(|| ResponseFormatError::new("review", "no JSON object in response"))?;
    let mut fb: ReviewFeedback = serde_json::from_str(body)
        .map_err(|e| ResponseFormatError::new("review", e.to_string()))?;
    if let Some(score) = fb.confidence_score {
        if !score.is_finite() {
            return Err(ResponseFormatError::new("review", "confidence_score is not a number"));
        }
        fb.confidence_score = Some(score.clamp(0.0, 1.0));
    }
    Ok(fb)
}

/// Judge scores must be numbers; they are clamped into [0, 1].
pub fn parse_judgement(raw: &str) -> Result<Judgement, ResponseFormatError> {
    let body = clean_json_response(raw)
        .ok_or_else(|| ResponseFormatError::new("judgement", "no JSON object in response"))?;
    let mut j: Judgement = serde_json::from_str(body)
        .map_err(|e| ResponseFormatError::new("judgement", e.to_string()))?;
    for (name, score) in [
        ("factual_accuracy", &mut j.factual_accuracy),
        ("citation_accuracy", &mut j.citation_accuracy),
        ("completeness", &mut j.completeness),
        ("source_quality", &mut j.source_quality),
        ("overall_score", &mut j.overall_score),
    ] {
        if !score.is_finite() {
            return Err(ResponseFormatError::new("judgement", format!("{name} is not a number")));
        }
        *score = score.clamp(0.0, 1.0);
    }
    j.confidence = j.confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0));
    j.passed = false;
    Ok(j)
}

/// First non-empty line, quotes and a trailing period removed.
pub fn parse_title(raw: &str) -> Result<String, ResponseFormatError> {
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with("```"))
        .ok_or_else(|| ResponseFormatError::new("title", "empty response"))?;
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line)
        .trim();
    let title = line
        .trim_matches(|c| c == '"' || c == '\'' || c == '*' || c == '#')
        .trim()
        .trim_end_matches('.')
        .trim()
        .to_string();
    if title.is_empty() {
        Err(ResponseFormatError::new("title", "empty title"))
    } else {
        Ok(title)
    }
}

// ------------------------------------------------------------
// Retry loop
// ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after a service error.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
pub struct GenerationFailure {
    pub attempts: u32,
    pub error: GenerationError,
}

/// Call the generator until `parse` accepts a response.
///
/// Service errors are retried up to `policy.retries` times with linear
/// backoff. A response that fails validation is retried once with the
/// strict variant of the request; a second format failure is final.
pub async fn generate_validated<T, F>(
    generator: &dyn TextGenerator,
    request: GenerationRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    parse: F,
) -> Result<T, GenerationFailure>
where
    F: Fn(&str) -> Result<T, ResponseFormatError>,
{
    let mut request = request;
    let mut attempts = 0u32;
    let mut service_failures = 0u32;
    let mut format_retried = false;

    loop {
        attempts += 1;
        counter!("generation_attempts_total", "kind" => request.kind()).increment(1);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(GenerationFailure { attempts, error: GenerationError::Cancelled });
            }
            r = generator.generate(&request) => r,
        };

        match response {
            Ok(raw) => match parse(&raw) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    counter!("generation_failures_total", "kind" => request.kind(), "cause" => "format")
                        .increment(1);
                    if format_retried {
                        return Err(GenerationFailure { attempts, error: err.into() });
                    }
                    warn!(
                        target: "generation",
                        kind = request.kind(),
                        section = request.section().unwrap_or("-"),
                        error = %err,
                        "invalid response format, retrying with strict instructions"
                    );
                    format_retried = true;
                    request = request.strict();
                }
            },
            Err(err) => {
                counter!("generation_failures_total", "kind" => request.kind(), "cause" => "service")
                    .increment(1);
                service_failures += 1;
                if service_failures > policy.retries {
                    return Err(GenerationFailure {
                        attempts,
                        error: GenerationError::Service(err),
                    });
                }
                warn!(
                    target: "generation",
                    kind = request.kind(),
                    section = request.section().unwrap_or("-"),
                    attempt = attempts,
                    error = %err,
                    "generation call failed, retrying"
                );
                if !policy.backoff.is_zero() {
                    let wait = policy.backoff * service_failures;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(GenerationFailure { attempts, error: GenerationError::Cancelled });
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

//! Typed failures of the report pipeline.
//!
//! Collaborator traits (generation, retrieval) return `anyhow::Result`; these
//! types describe what the pipeline itself decided went wrong.

use std::fmt;

use thiserror::Error;

/// Citation markers in a draft that cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMarkerError {
    #[error("unbalanced `{bracket}` at byte {offset}")]
    Unbalanced { bracket: char, offset: usize },
    #[error("nested `[` at byte {offset}")]
    Nested { offset: usize },
    #[error("marker at byte {offset} references undeclared citation `{id}`")]
    UndeclaredId { id: String, offset: usize },
}

/// A marker in an assembled section that points at no grounded citation.
/// Blocks report finalization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("section `{section}` has marker `{marker}` with no grounded citation")]
pub struct UnresolvedCitationError {
    pub section: String,
    pub marker: String,
}

/// Generation output that does not match the expected schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response does not match the {expected} schema: {reason}")]
pub struct ResponseFormatError {
    pub expected: &'static str,
    pub reason: String,
}

impl ResponseFormatError {
    pub fn new(expected: &'static str, reason: impl Into<String>) -> Self {
        Self {
            expected,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Drafting,
    Reviewing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Drafting => f.write_str("drafting"),
            Stage::Reviewing => f.write_str("reviewing"),
        }
    }
}

/// A section gave up after exhausting its retries. Becomes a placeholder,
/// never aborts the report.
#[derive(Debug, Clone, Error)]
#[error("section `{section}` failed while {stage} after {attempts} attempt(s): {reason}")]
pub struct SectionGenerationError {
    pub section: String,
    pub stage: Stage,
    pub attempts: u32,
    pub reason: String,
}

/// Retrieval returned nothing usable. Logged; the pipeline continues with an
/// empty pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("retrieval for `{query}` failed: {reason}")]
pub struct RetrievalFailure {
    pub query: String,
    pub reason: String,
}

/// One failed generation call as seen by the retry loop.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation service error: {0}")]
    Service(#[from] anyhow::Error),
    #[error(transparent)]
    Format(#[from] ResponseFormatError),
    #[error("generation cancelled")]
    Cancelled,
}

/// Errors that stop a whole query.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    UnresolvedCitation(#[from] UnresolvedCitationError),
    #[error("invalid pipeline input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("pipeline cancelled")]
    Cancelled,
}

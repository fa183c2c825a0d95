//! Report data model: retrieved sources, grounded citations, sections, reports
//! and the structured objects exchanged with the generation service.
//!
//! Shapes here are what gets persisted, so serde names follow the report
//! format (`citations[].text` is the display text, ids are global numbers).

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::style::CitationStyle;

/// Sections drafted when a query does not list its own.
pub const DEFAULT_SECTIONS: &[&str] = &[
    "Introduction",
    "Background",
    "Methodology",
    "Findings",
    "Discussion",
    "Conclusion",
    "References",
];

/// Body text of a section whose generation failed. Must not contain `[`.
pub const PLACEHOLDER_CONTENT: &str = "_This section could not be generated._";

/// A retrieved source. Immutable once it enters a `SourcePool`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
    pub text: String,
    /// 1-based position in the retrieval result (1 = most relevant).
    #[serde(default)]
    pub retrieval_rank: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            text: text.into(),
            retrieval_rank: 0,
            title: None,
            authors: Vec::new(),
            year: None,
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn by(mut self, authors: &[&str], year: i32) -> Self {
        self.authors = authors.iter().map(|a| a.to_string()).collect();
        self.year = Some(year);
        self
    }
}

/// A claim found in a draft: the text a marker attaches to plus the ids it cites.
/// Rebuilt on every extraction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub section_id: usize,
    /// Byte range of the claim text inside the section content.
    pub text_span: Range<usize>,
    pub text: String,
    /// Byte range of the marker itself (`[2,3]`).
    pub marker_span: Range<usize>,
    pub raw_marker_ids: Vec<String>,
}

/// A grounded citation. `id` is section-local until the assembler renumbers it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub id: u32,
    /// Id of the `SourceDocument` this citation resolved to.
    pub source_ref: String,
    #[serde(rename = "text")]
    pub display_text: String,
    #[serde(default)]
    pub url: String,
}

/// Per-section quality record carried into the finalized report so that
/// placeholders and dropped claims are always visible.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SectionQuality {
    #[serde(default)]
    pub placeholder: bool,
    #[serde(default)]
    pub total_claims: usize,
    #[serde(default)]
    pub unsupported_claims: usize,
    #[serde(default)]
    pub unsupported_ratio: f32,
    #[serde(default)]
    pub iterations: u32,
    /// True when the finalized draft had malformed markers and was sanitised.
    #[serde(default, skip_serializing_if = "is_false")]
    pub malformed_markers: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl SectionQuality {
    /// Share of claims that ended up grounded (0.0 when there were no claims).
    pub fn citation_coverage(&self) -> f32 {
        if self.total_claims == 0 {
            0.0
        } else {
            (self.total_claims - self.unsupported_claims.min(self.total_claims)) as f32
                / self.total_claims as f32
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub quality: SectionQuality,
}

impl Section {
    /// Clearly marked stand-in for a section whose generation failed.
    pub fn placeholder(title: impl Into<String>, reason: impl Into<String>, iterations: u32) -> Self {
        Self {
            title: title.into(),
            content: PLACEHOLDER_CONTENT.to_string(),
            key_points: Vec::new(),
            citations: Vec::new(),
            quality: SectionQuality {
                placeholder: true,
                iterations,
                failure: Some(reason.into()),
                ..SectionQuality::default()
            },
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.quality.placeholder
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Draft every listed section (defaults when none are listed).
    #[default]
    Full,
    /// Draft only the explicitly requested sections.
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMetadata {
    pub query: String,
    pub mode: Mode,
    pub citation_style: CitationStyle,
    pub citation_threshold: f32,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_citations: usize,
    #[serde(default)]
    pub sections_with_citations: usize,
    #[serde(default)]
    pub placeholder_sections: usize,
    #[serde(default)]
    pub unsupported_ratio: f32,
    #[serde(default)]
    pub citation_coverage: f32,
    #[serde(default)]
    pub section_iterations: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reviews: BTreeMap<String, ReviewFeedback>,
    #[serde(default)]
    pub retrieved_sources: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_failure: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ReportMetadata {
    pub fn new(query: impl Into<String>, mode: Mode, style: CitationStyle, threshold: f32) -> Self {
        Self {
            query: query.into(),
            mode,
            citation_style: style,
            citation_threshold: threshold,
            generated_at: Utc::now(),
            total_citations: 0,
            sections_with_citations: 0,
            placeholder_sections: 0,
            unsupported_ratio: 0.0,
            citation_coverage: 0.0,
            section_iterations: BTreeMap::new(),
            reviews: BTreeMap::new(),
            retrieved_sources: 0,
            retrieval_failure: None,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub title: String,
    pub sections: Vec<Section>,
    pub metadata: ReportMetadata,
}

impl Report {
    /// Body sections, i.e. everything except the assembled References section.
    pub fn body_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections
            .iter()
            .filter(|s| !crate::assemble::is_references_title(&s.title))
    }

    /// Claims grounded / claims total across body sections (0.0 with no claims).
    pub fn citation_coverage(&self) -> f32 {
        let (total, unsupported) = self.claim_totals();
        if total == 0 {
            0.0
        } else {
            (total - unsupported) as f32 / total as f32
        }
    }

    pub fn unsupported_ratio(&self) -> f32 {
        let (total, unsupported) = self.claim_totals();
        if total == 0 {
            0.0
        } else {
            unsupported as f32 / total as f32
        }
    }

    fn claim_totals(&self) -> (usize, usize) {
        self.body_sections().fold((0, 0), |(t, u), s| {
            (t + s.quality.total_claims, u + s.quality.unsupported_claims)
        })
    }

    /// Plain text of the body sections, used for evaluation-time scoring.
    pub fn body_text(&self) -> String {
        self.body_sections()
            .filter(|s| !s.is_placeholder())
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn to_markdown(&self) -> String {
        let mut md = format!("# {}\n\n", self.title);
        for section in &self.sections {
            md.push_str(&format!("## {}\n\n{}\n\n", section.title, section.content));
            if section.is_placeholder() {
                let reason = section.quality.failure.as_deref().unwrap_or("unknown error");
                md.push_str(&format!("> Placeholder: generation failed ({reason}).\n\n"));
            } else if section.quality.unsupported_claims > 0 {
                md.push_str(&format!(
                    "> {} of {} claims could not be grounded (unsupported ratio {:.2}).\n\n",
                    section.quality.unsupported_claims,
                    section.quality.total_claims,
                    section.quality.unsupported_ratio
                ));
            }
            if !section.key_points.is_empty() {
                md.push_str("### Key Points\n");
                for point in &section.key_points {
                    md.push_str(&format!("- {point}\n"));
                }
                md.push('\n');
            }
        }
        md.push_str("## Metadata\n\n");
        md.push_str(&format!("- query: {}\n", self.metadata.query));
        md.push_str(&format!("- citation_style: {}\n", self.metadata.citation_style));
        md.push_str(&format!(
            "- citation_threshold: {:.2}\n",
            self.metadata.citation_threshold
        ));
        md.push_str(&format!("- total_citations: {}\n", self.metadata.total_citations));
        md.push_str(&format!(
            "- citation_coverage: {:.2}\n",
            self.metadata.citation_coverage
        ));
        md.push_str(&format!(
            "- generated_at: {}\n",
            self.metadata.generated_at.to_rfc3339()
        ));
        md
    }
}

/// Reviewer output for one iteration. Consumed by the next draft request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReviewFeedback {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub missing_elements: Vec<String>,
    pub priority_fixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f32>,
}

/// Grade given to a finished report by the generation service. Scores are
/// in [0, 1]; `passed` is set by the harness from its quality threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Judgement {
    pub factual_accuracy: f32,
    pub citation_accuracy: f32,
    pub completeness: f32,
    pub source_quality: f32,
    pub overall_score: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub passed: bool,
}

impl Judgement {
    pub fn graded(mut self, quality_threshold: f32) -> Self {
        self.passed = self.overall_score >= quality_threshold;
        self
    }
}

/// Citation entry as declared by a draft (pre-grounding, ids are draft-local).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DraftCitation {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Section schema the generation service must answer with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionDraft {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub citations: Vec<DraftCitation>,
}

impl SectionDraft {
    pub fn declared_ids(&self) -> Vec<String> {
        self.citations.iter().map(|c| c.id.clone()).collect()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!(
            "citation id must be a string or number, got {other}"
        ))),
    }
}

fn default_depth() -> u32 {
    3
}
fn default_results() -> usize {
    5
}
fn default_style() -> String {
    "chicago".to_string()
}

/// One query as submitted to the pipeline or listed in a batch file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineInput {
    pub query: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_results")]
    pub results: usize,
    #[serde(default)]
    pub sections: Vec<String>,
    #[serde(default = "default_style")]
    pub citation_style: String,
    /// Falls back to the configured threshold when absent.
    #[serde(default)]
    pub citation_threshold: Option<f32>,
    #[serde(default)]
    pub ground_truth: Option<String>,
}

impl PipelineInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            mode: Mode::Full,
            depth: default_depth(),
            results: default_results(),
            sections: Vec::new(),
            citation_style: default_style(),
            citation_threshold: None,
            ground_truth: None,
        }
    }

    pub fn with_sections(mut self, sections: &[&str]) -> Self {
        self.sections = sections.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.citation_threshold = Some(threshold);
        self
    }

    pub fn with_ground_truth(mut self, truth: impl Into<String>) -> Self {
        self.ground_truth = Some(truth.into());
        self
    }

    pub fn partial(mut self) -> Self {
        self.mode = Mode::Partial;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn citation_serializes_display_text_as_text() {
        let c = Citation {
            id: 1,
            source_ref: "s1".into(),
            display_text: "Doe. 2024. \"Paper.\"".into(),
            url: "https://example.org".into(),
        };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["id"], json!(1));
        assert_eq!(v["text"], json!("Doe. 2024. \"Paper.\""));
        assert!(v.get("display_text").is_none());
    }

    #[test]
    fn draft_citation_accepts_numeric_ids() {
        let d: SectionDraft = serde_json::from_value(json!({
            "title": "Intro",
            "content": "Claim [1].",
            "citations": [{"id": 1}, {"id": " 2 "}]
        }))
        .unwrap();
        assert_eq!(d.declared_ids(), vec!["1".to_string(), "2".to_string()]);
        assert!(d.key_points.is_empty());
    }

    #[test]
    fn coverage_is_zero_without_claims() {
        let q = SectionQuality::default();
        assert_eq!(q.citation_coverage(), 0.0);
        let q = SectionQuality {
            total_claims: 4,
            unsupported_claims: 1,
            ..Default::default()
        };
        assert!((q.citation_coverage() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn placeholder_has_no_brackets() {
        let s = Section::placeholder("Findings", "service down", 2);
        assert!(s.is_placeholder());
        assert!(!s.content.contains('['));
        assert_eq!(s.quality.failure.as_deref(), Some("service down"));
    }

    #[test]
    fn pipeline_input_defaults_follow_cli() {
        let p: PipelineInput = serde_json::from_value(json!({"query": "q"})).unwrap();
        assert_eq!(p.mode, Mode::Full);
        assert_eq!(p.depth, 3);
        assert_eq!(p.results, 5);
        assert_eq!(p.citation_style, "chicago");
        assert!(p.citation_threshold.is_none());
        assert!(p.ground_truth.is_none());
    }
}

//! Report assembly: renumber section-local citations into one global list,
//! rewrite markers, and rebuild the References section.
//!
//! Global ids follow first appearance across sections in order. Running the
//! assembler on its own output changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use metrics::counter;
use tracing::debug;

use crate::error::UnresolvedCitationError;
use crate::extract::{normalize_id, rewrite_markers, scan_markers, strip_markers};
use crate::model::{Citation, Report, ReportMetadata, Section, SectionQuality};

pub const REFERENCES_TITLE: &str = "References";

pub fn is_references_title(title: &str) -> bool {
    title.trim().eq_ignore_ascii_case(REFERENCES_TITLE)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler;

impl Assembler {
    pub fn assemble(
        &self,
        title: String,
        sections: Vec<Section>,
        mut metadata: ReportMetadata,
    ) -> Result<Report, UnresolvedCitationError> {
        let body: Vec<Section> = sections
            .into_iter()
            .filter(|s| !is_references_title(&s.title))
            .collect();

        // Pass 1: resolve every marker and assign global ids by first appearance.
        let mut global_by_source: BTreeMap<String, u32> = BTreeMap::new();
        let mut global: Vec<Citation> = Vec::new();
        let mut resolved: Vec<Vec<Vec<u32>>> = Vec::with_capacity(body.len());

        for section in &body {
            let markers = scan_markers(&section.content).map_err(|e| UnresolvedCitationError {
                section: section.title.clone(),
                marker: e.to_string(),
            })?;
            let mut per_marker = Vec::with_capacity(markers.len());
            for m in &markers {
                let mut ids = BTreeSet::new();
                for raw in &m.ids {
                    let local = section
                        .citations
                        .iter()
                        .find(|c| normalize_id(&c.id.to_string()) == *raw)
                        .ok_or_else(|| UnresolvedCitationError {
                            section: section.title.clone(),
                            marker: format!("[{raw}]"),
                        })?;
                    let next = global.len() as u32 + 1;
                    let id = *global_by_source
                        .entry(local.source_ref.clone())
                        .or_insert(next);
                    if id == next {
                        global.push(Citation {
                            id,
                            ..local.clone()
                        });
                    }
                    ids.insert(id);
                }
                per_marker.push(ids.into_iter().collect());
            }
            resolved.push(per_marker);
        }

        // Pass 2: rewrite content and citation lists with global ids. Key
        // points are never cited, so any marker left in them goes.
        let mut out: Vec<Section> = Vec::with_capacity(body.len() + 1);
        for (mut section, per_marker) in body.into_iter().zip(resolved) {
            let content = rewrite_markers(&section.content, |i, _| {
                per_marker.get(i).map(|ids: &Vec<u32>| format_marker(ids))
            })
            .map_err(|e| UnresolvedCitationError {
                section: section.title.clone(),
                marker: e.to_string(),
            })?;
            let used: BTreeSet<u32> = per_marker.iter().flatten().copied().collect();
            let dropped = section.citations.len().saturating_sub(used.len());
            if dropped > 0 {
                debug!(target: "assemble", section = %section.title, dropped, "unused citations dropped");
            }
            section.content = content;
            section.key_points = section
                .key_points
                .iter()
                .map(|kp| strip_markers(kp))
                .filter(|kp| !kp.is_empty())
                .collect();
            section.citations = used
                .iter()
                .filter_map(|id| global.get(*id as usize - 1).cloned())
                .collect();
            out.push(section);
        }

        if !global.is_empty() {
            out.push(references_section(&global));
        }
        counter!("assemble_citations_total").increment(global.len() as u64);

        refresh_metadata(&mut metadata, &out);
        Ok(Report {
            title,
            sections: out,
            metadata,
        })
    }

    /// Re-run assembly over an already assembled report.
    pub fn reassemble(&self, report: &Report) -> Result<Report, UnresolvedCitationError> {
        self.assemble(
            report.title.clone(),
            report.sections.clone(),
            report.metadata.clone(),
        )
    }
}

fn format_marker(ids: &[u32]) -> String {
    let joined = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
    format!("[{joined}]")
}

fn references_section(global: &[Citation]) -> Section {
    let content = global
        .iter()
        .map(|c| {
            if c.url.is_empty() {
                format!("[{}] {}", c.id, c.display_text)
            } else {
                format!("[{}] {} {}", c.id, c.display_text, c.url)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    Section {
        title: REFERENCES_TITLE.to_string(),
        content,
        key_points: Vec::new(),
        citations: global.to_vec(),
        quality: SectionQuality::default(),
    }
}

fn refresh_metadata(metadata: &mut ReportMetadata, sections: &[Section]) {
    let body = || sections.iter().filter(|s| !is_references_title(&s.title));
    let (total, unsupported) = body().fold((0, 0), |(t, u), s| {
        (t + s.quality.total_claims, u + s.quality.unsupported_claims)
    });
    metadata.total_citations = sections
        .iter()
        .find(|s| is_references_title(&s.title))
        .map_or(0, |r| r.citations.len());
    metadata.sections_with_citations = body().filter(|s| !s.citations.is_empty()).count();
    metadata.placeholder_sections = body().filter(|s| s.is_placeholder()).count();
    metadata.unsupported_ratio = if total == 0 {
        0.0
    } else {
        unsupported as f32 / total as f32
    };
    metadata.citation_coverage = if total == 0 {
        0.0
    } else {
        (total - unsupported) as f32 / total as f32
    };
    metadata.section_iterations = body()
        .map(|s| (s.title.clone(), s.quality.iterations))
        .collect();
}

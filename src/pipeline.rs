//! One query end to end: retrieve → title → per-section review loops
//! (concurrent) → barrier → assembly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assemble::{is_references_title, Assembler};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::generation::{generate_validated, parse_title, DynGenerator, GenerationRequest, RetryPolicy};
use crate::grounding::GroundingEngine;
use crate::model::{Mode, PipelineInput, Report, ReportMetadata, DEFAULT_SECTIONS};
use crate::retrieval::{retrieve_pool, DynRetriever, RetrievalRequest};
use crate::review::{ReviewController, SectionOutcome};
use crate::style::CitationStyle;
use crate::telemetry::anon_id;

pub struct Pipeline {
    config: PipelineConfig,
    generator: DynGenerator,
    retriever: DynRetriever,
    controller: ReviewController,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, generator: DynGenerator, retriever: DynRetriever) -> Self {
        let controller = ReviewController::new(generator.clone(), &config.review);
        Self {
            config,
            generator,
            retriever,
            controller,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn generator(&self) -> &DynGenerator {
        &self.generator
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.config.review.generation_retries,
            backoff: Duration::from_millis(self.config.review.retry_backoff_ms),
        }
    }

    /// Sections to draft, in declared order. `References` is never drafted;
    /// the assembler builds it.
    pub fn sections_for(input: &PipelineInput) -> Result<Vec<String>, PipelineError> {
        let requested: Vec<String> = match (input.mode, input.sections.is_empty()) {
            (Mode::Partial, true) => {
                return Err(PipelineError::InvalidInput(
                    "partial mode needs at least one requested section".into(),
                ))
            }
            (Mode::Full, true) => DEFAULT_SECTIONS.iter().map(|s| s.to_string()).collect(),
            (_, false) => input.sections.clone(),
        };
        let mut out: Vec<String> = Vec::with_capacity(requested.len());
        for title in requested {
            let title = title.trim().to_string();
            if title.is_empty() || is_references_title(&title) {
                continue;
            }
            if !out.iter().any(|t| t.eq_ignore_ascii_case(&title)) {
                out.push(title);
            }
        }
        Ok(out)
    }

    pub fn threshold_for(&self, input: &PipelineInput) -> Result<f32, PipelineError> {
        let t = input
            .citation_threshold
            .unwrap_or(self.config.grounding.citation_threshold);
        if !t.is_finite() || !(0.0..=1.0).contains(&t) {
            return Err(PipelineError::InvalidInput(format!(
                "citation_threshold {t} is outside [0, 1]"
            )));
        }
        Ok(t)
    }

    /// Number of sources to retrieve. Zero would leave every claim unsupported.
    pub fn results_for(input: &PipelineInput) -> Result<usize, PipelineError> {
        if input.results == 0 {
            return Err(PipelineError::InvalidInput(
                "results must be at least 1".into(),
            ));
        }
        Ok(input.results)
    }

    pub async fn run(
        &self,
        input: &PipelineInput,
        cancel: &CancellationToken,
    ) -> Result<Report, PipelineError> {
        if input.query.trim().is_empty() {
            return Err(PipelineError::InvalidInput("query is empty".into()));
        }
        let started = Instant::now();
        let query_id = anon_id(&input.query);
        let threshold = self.threshold_for(input)?;
        let max_results = Self::results_for(input)?;
        let style = CitationStyle::parse(&input.citation_style);
        let titles = Self::sections_for(input)?;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let request = RetrievalRequest {
            query: input.query.clone(),
            max_results,
            depth: input.depth,
        };
        let (pool, retrieval_failure) = retrieve_pool(self.retriever.as_ref(), &request).await;

        let title = self.report_title(&input.query, cancel).await;

        let engine = GroundingEngine::new(threshold, Arc::new(self.config.grounding.metric))
            .with_tie_epsilon(self.config.grounding.tie_epsilon)
            .with_style(style);

        let engine = &engine;
        let docs = pool.as_slice();
        let query = input.query.as_str();
        let controller = &self.controller;
        let mut outcomes: Vec<SectionOutcome> = stream::iter(titles.iter().enumerate())
            .map(move |(i, t)| controller.run_section(query, i, t, engine, docs, cancel))
            .buffer_unordered(self.config.concurrency.max_parallel_sections)
            .collect()
            .await;
        // Barrier passed: every section is final. Restore declared order.
        outcomes.sort_by_key(|o| o.index);

        let mut metadata = ReportMetadata::new(&input.query, input.mode, style, threshold);
        metadata.retrieved_sources = pool.len();
        metadata.retrieval_failure = retrieval_failure.map(|f| f.reason);
        metadata.cancelled = cancel.is_cancelled();
        for o in &outcomes {
            if let Some(review) = &o.review {
                metadata
                    .reviews
                    .insert(o.section.title.clone(), review.clone());
            }
        }
        let sections = outcomes.into_iter().map(|o| o.section).collect();

        let report = Assembler.assemble(title, sections, metadata)?;
        histogram!("report_citation_coverage").record(report.metadata.citation_coverage as f64);
        info!(
            target: "pipeline",
            query = %query_id,
            sections = report.sections.len(),
            citations = report.metadata.total_citations,
            coverage = report.metadata.citation_coverage,
            placeholders = report.metadata.placeholder_sections,
            cancelled = report.metadata.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "report assembled"
        );
        Ok(report)
    }

    async fn report_title(&self, query: &str, cancel: &CancellationToken) -> String {
        let retry = self.retry_policy();
        let request = GenerationRequest::Title {
            query: query.to_string(),
        };
        match generate_validated(self.generator.as_ref(), request, &retry, cancel, parse_title).await {
            Ok(title) => title,
            Err(f) => {
                warn!(target: "pipeline", error = %f.error, "title generation failed, using fallback");
                format!("Research Report: {query}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mode_defaults_and_references_is_never_drafted() {
        let input = PipelineInput::new("q");
        let s = Pipeline::sections_for(&input).unwrap();
        assert_eq!(s.len(), DEFAULT_SECTIONS.len() - 1);
        assert!(!s.iter().any(|t| is_references_title(t)));

        let input = PipelineInput::new("q").with_sections(&["Findings", "findings", "references", " "]);
        assert_eq!(Pipeline::sections_for(&input).unwrap(), vec!["Findings".to_string()]);
    }

    #[test]
    fn partial_mode_requires_sections() {
        let input = PipelineInput::new("q").partial();
        assert!(matches!(
            Pipeline::sections_for(&input),
            Err(PipelineError::InvalidInput(_))
        ));
        let input = PipelineInput::new("q").partial().with_sections(&["Discussion"]);
        assert_eq!(Pipeline::sections_for(&input).unwrap(), vec!["Discussion".to_string()]);
    }
}

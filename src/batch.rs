//! Batch evaluation: run many queries in parallel, score finished reports
//! against optional ground truth, optionally have the generation service
//! grade them, aggregate.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::generation::{generate_validated, parse_judgement, DynGenerator, GenerationRequest, RetryPolicy};
use crate::model::{Judgement, PipelineInput, Report};
use crate::pipeline::Pipeline;
use crate::similarity::SimilarityScorer;
use crate::telemetry::anon_id;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRunResult {
    pub query: String,
    pub report: Report,
    pub citation_coverage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth_similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judgement: Option<Judgement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchFailure {
    pub query: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub evaluation_metric: String,
    pub mean_citation_coverage: f32,
    pub best_citation_coverage: f32,
    pub mean_unsupported_ratio: f32,
    /// Queries that supplied a ground truth.
    pub evaluated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_ground_truth_similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ground_truth_similarity: Option<f32>,
    /// Reports graded by the judge.
    #[serde(default)]
    pub judged: usize,
    #[serde(default)]
    pub passed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_overall_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_factual_accuracy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_citation_accuracy: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchOutcome {
    pub results: Vec<BatchRunResult>,
    pub failures: Vec<BatchFailure>,
    /// Queries whose partial results were discarded.
    pub cancelled: Vec<String>,
    pub summary: BatchSummary,
}

enum QueryOutcome {
    Completed(BatchRunResult),
    Failed(BatchFailure),
    Cancelled(String),
}

struct Judge {
    generator: DynGenerator,
    quality_threshold: f32,
    retry: RetryPolicy,
}

pub struct BatchHarness {
    pipeline: Arc<Pipeline>,
    evaluator: Arc<dyn SimilarityScorer>,
    max_parallel: usize,
    judge: Option<Judge>,
}

impl BatchHarness {
    /// Judging is on when `evaluation.judge` is set; it then uses the
    /// pipeline's own generator.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let cfg = pipeline.config();
        let evaluator = Arc::new(cfg.evaluation.metric);
        let max_parallel = cfg.concurrency.max_parallel_queries.max(1);
        let judge = cfg.evaluation.judge.then(|| Judge {
            generator: pipeline.generator().clone(),
            quality_threshold: cfg.evaluation.quality_threshold,
            retry: pipeline.retry_policy(),
        });
        Self {
            pipeline,
            evaluator,
            max_parallel,
            judge,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn SimilarityScorer>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_judge(mut self, generator: DynGenerator, quality_threshold: f32) -> Self {
        let quality_threshold = if quality_threshold.is_finite() {
            quality_threshold.clamp(0.0, 1.0)
        } else {
            0.7
        };
        self.judge = Some(Judge {
            generator,
            quality_threshold,
            retry: self.pipeline.retry_policy(),
        });
        self
    }

    pub async fn run(&self, queries: Vec<PipelineInput>, cancel: &CancellationToken) -> BatchOutcome {
        let total = queries.len();
        info!(target: "batch", queries = total, parallel = self.max_parallel, "batch started");

        let mut indexed: Vec<(usize, QueryOutcome)> = stream::iter(queries.into_iter().enumerate())
            .map(move |(i, input)| async move { (i, self.run_one(input, cancel).await) })
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);

        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = Vec::new();
        for (_, outcome) in indexed {
            match outcome {
                QueryOutcome::Completed(r) => results.push(r),
                QueryOutcome::Failed(f) => failures.push(f),
                QueryOutcome::Cancelled(q) => cancelled.push(q),
            }
        }

        let summary = summarize(
            &results,
            failures.len(),
            cancelled.len(),
            self.evaluator.name(),
        );
        info!(
            target: "batch",
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            mean_coverage = summary.mean_citation_coverage,
            "batch finished"
        );
        BatchOutcome {
            results,
            failures,
            cancelled,
            summary,
        }
    }

    async fn run_one(&self, input: PipelineInput, cancel: &CancellationToken) -> QueryOutcome {
        let query_id = anon_id(&input.query);
        if cancel.is_cancelled() {
            return self.discard(input.query);
        }
        let token = cancel.child_token();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.pipeline.run(&input, &token) => Some(r),
        };

        match result {
            None | Some(Err(PipelineError::Cancelled)) => self.discard(input.query),
            Some(Ok(report)) if report.metadata.cancelled || cancel.is_cancelled() => {
                self.discard(input.query)
            }
            Some(Ok(report)) => {
                // Scoring reads the finished report only.
                let ground_truth = input.ground_truth.as_deref();
                let ground_truth_similarity = self.evaluate(&report, ground_truth);
                let judgement = self.judge(&input.query, &report, ground_truth, &token).await;
                if cancel.is_cancelled() {
                    return self.discard(input.query);
                }
                counter!("batch_queries_total", "outcome" => "completed").increment(1);
                QueryOutcome::Completed(BatchRunResult {
                    query: input.query,
                    citation_coverage: report.citation_coverage(),
                    ground_truth_similarity,
                    judgement,
                    report,
                })
            }
            Some(Err(e)) => {
                counter!("batch_queries_total", "outcome" => "failed").increment(1);
                warn!(target: "batch", query = %query_id, error = %e, "query failed");
                QueryOutcome::Failed(BatchFailure {
                    query: input.query,
                    error: e.to_string(),
                })
            }
        }
    }

    fn discard(&self, query: String) -> QueryOutcome {
        counter!("batch_queries_total", "outcome" => "cancelled").increment(1);
        counter!("batch_queries_cancelled_total").increment(1);
        info!(target: "batch", query = %anon_id(&query), "query cancelled, partial result discarded");
        QueryOutcome::Cancelled(query)
    }

    /// Similarity of the report body to the ground truth, if one was given.
    pub fn evaluate(&self, report: &Report, ground_truth: Option<&str>) -> Option<f32> {
        let truth = ground_truth.map(str::trim).filter(|t| !t.is_empty())?;
        Some(self.evaluator.score(&report.body_text(), truth))
    }

    /// Grade the rendered report. Judge failures leave the result ungraded.
    pub async fn judge(
        &self,
        query: &str,
        report: &Report,
        ground_truth: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<Judgement> {
        let judge = self.judge.as_ref()?;
        let request = GenerationRequest::Judge {
            query: query.to_string(),
            report: report.to_markdown(),
            ground_truth: ground_truth
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            strict: false,
        };
        match generate_validated(
            judge.generator.as_ref(),
            request,
            &judge.retry,
            cancel,
            parse_judgement,
        )
        .await
        {
            Ok(j) => {
                let j = j.graded(judge.quality_threshold);
                let outcome = if j.passed { "passed" } else { "below_threshold" };
                counter!("batch_judged_total", "outcome" => outcome).increment(1);
                info!(
                    target: "batch",
                    query = %anon_id(query),
                    overall = j.overall_score,
                    passed = j.passed,
                    "report judged"
                );
                Some(j)
            }
            Err(f) => {
                counter!("batch_judged_total", "outcome" => "error").increment(1);
                warn!(
                    target: "batch",
                    query = %anon_id(query),
                    attempts = f.attempts,
                    error = %f.error,
                    "judge failed, keeping report without a judgement"
                );
                None
            }
        }
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

fn best(values: &[f32]) -> f32 {
    values.iter().copied().fold(0.0, f32::max)
}

pub fn summarize(
    results: &[BatchRunResult],
    failed: usize,
    cancelled: usize,
    metric: &str,
) -> BatchSummary {
    let coverage: Vec<f32> = results.iter().map(|r| r.citation_coverage).collect();
    let unsupported: Vec<f32> = results.iter().map(|r| r.report.unsupported_ratio()).collect();
    let similarity: Vec<f32> = results
        .iter()
        .filter_map(|r| r.ground_truth_similarity)
        .collect();
    let judged: Vec<&Judgement> = results.iter().filter_map(|r| r.judgement.as_ref()).collect();
    let judged_mean = |score: fn(&Judgement) -> f32| {
        let values: Vec<f32> = judged.iter().map(|j| score(j)).collect();
        (!values.is_empty()).then(|| mean(&values))
    };
    BatchSummary {
        total: results.len() + failed + cancelled,
        completed: results.len(),
        failed,
        cancelled,
        evaluation_metric: metric.to_string(),
        mean_citation_coverage: mean(&coverage),
        best_citation_coverage: best(&coverage),
        mean_unsupported_ratio: mean(&unsupported),
        evaluated: similarity.len(),
        mean_ground_truth_similarity: (!similarity.is_empty()).then(|| mean(&similarity)),
        best_ground_truth_similarity: (!similarity.is_empty()).then(|| best(&similarity)),
        judged: judged.len(),
        passed: judged.iter().filter(|j| j.passed).count(),
        mean_overall_score: judged_mean(|j| j.overall_score),
        mean_factual_accuracy: judged_mean(|j| j.factual_accuracy),
        mean_citation_accuracy: judged_mean(|j| j.citation_accuracy),
    }
}

impl BatchOutcome {
    /// Human-readable summary, persisted as `evaluation_summary.md`.
    pub fn summary_markdown(&self) -> String {
        let s = &self.summary;
        let mut md = String::from("# Evaluation Summary\n\n");
        md.push_str(&format!(
            "- queries: {} (completed {}, failed {}, cancelled {})\n",
            s.total, s.completed, s.failed, s.cancelled
        ));
        md.push_str(&format!(
            "- citation coverage: mean {:.3}, best {:.3}\n",
            s.mean_citation_coverage, s.best_citation_coverage
        ));
        md.push_str(&format!("- mean unsupported ratio: {:.3}\n", s.mean_unsupported_ratio));
        match (s.mean_ground_truth_similarity, s.best_ground_truth_similarity) {
            (Some(m), Some(b)) => md.push_str(&format!(
                "- ground truth similarity ({}, {} queries): mean {:.3}, best {:.3}\n",
                s.evaluation_metric, s.evaluated, m, b
            )),
            _ => md.push_str("- ground truth similarity: no ground truth supplied\n"),
        }
        if let Some(overall) = s.mean_overall_score {
            md.push_str(&format!(
                "- judge ({} reports): mean overall {:.3}, passed {}/{}\n",
                s.judged, overall, s.passed, s.judged
            ));
        }

        md.push_str("\n## Queries\n\n| query | coverage | ground truth | judge |\n|---|---|---|---|\n");
        for r in &self.results {
            let gt = r
                .ground_truth_similarity
                .map(|v| format!("{v:.3}"))
                .unwrap_or_else(|| "-".to_string());
            let judge = r
                .judgement
                .as_ref()
                .map(|j| format!("{:.3} ({})", j.overall_score, if j.passed { "pass" } else { "fail" }))
                .unwrap_or_else(|| "-".to_string());
            md.push_str(&format!(
                "| {} | {:.3} | {} | {} |\n",
                r.query, r.citation_coverage, gt, judge
            ));
        }
        for f in &self.failures {
            md.push_str(&format!("| {} | failed: {} | - | - |\n", f.query, f.error));
        }
        for q in &self.cancelled {
            md.push_str(&format!("| {q} | cancelled | - | - |\n"));
        }
        md
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, ReportMetadata};
    use crate::style::CitationStyle;

    fn result(query: &str, coverage: f32, gt: Option<f32>) -> BatchRunResult {
        BatchRunResult {
            query: query.into(),
            report: Report {
                title: "t".into(),
                sections: Vec::new(),
                metadata: ReportMetadata::new(query, Mode::Full, CitationStyle::Chicago, 0.6),
            },
            citation_coverage: coverage,
            ground_truth_similarity: gt,
            judgement: None,
        }
    }

    fn judgement(overall: f32, passed: bool) -> Judgement {
        Judgement {
            factual_accuracy: 1.0,
            citation_accuracy: overall,
            completeness: overall,
            source_quality: overall,
            overall_score: overall,
            feedback: Vec::new(),
            confidence: None,
            passed,
        }
    }

    #[test]
    fn summary_means_and_bests() {
        let results = vec![
            result("a", 0.5, Some(0.2)),
            result("b", 1.0, None),
            result("c", 0.0, Some(0.6)),
        ];
        let s = summarize(&results, 1, 2, "cosine");
        assert_eq!(s.total, 6);
        assert_eq!(s.completed, 3);
        assert!((s.mean_citation_coverage - 0.5).abs() < 1e-6);
        assert_eq!(s.best_citation_coverage, 1.0);
        assert_eq!(s.evaluated, 2);
        assert!((s.mean_ground_truth_similarity.unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(s.best_ground_truth_similarity, Some(0.6));
    }

    #[test]
    fn no_ground_truth_leaves_similarity_absent() {
        let s = summarize(&[result("a", 0.3, None)], 0, 0, "cosine");
        assert!(s.mean_ground_truth_similarity.is_none());
        let json = serde_json::to_value(&result("a", 0.3, None)).unwrap();
        assert!(json.get("ground_truth_similarity").is_none());
        assert!(json.get("judgement").is_none());
        assert_eq!(s.judged, 0);
        assert!(s.mean_overall_score.is_none());
    }

    #[test]
    fn judge_means_skip_ungraded_results() {
        let mut a = result("a", 1.0, None);
        a.judgement = Some(judgement(0.9, true));
        let mut b = result("b", 1.0, None);
        b.judgement = Some(judgement(0.5, false));
        let c = result("c", 1.0, None);
        let s = summarize(&[a, b, c], 0, 0, "cosine");
        assert_eq!(s.judged, 2);
        assert_eq!(s.passed, 1);
        assert!((s.mean_overall_score.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(s.mean_factual_accuracy, Some(1.0));
        assert!((s.mean_citation_accuracy.unwrap() - 0.7).abs() < 1e-6);
    }
}

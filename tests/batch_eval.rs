// tests/batch_eval.rs
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use deep_research_report::batch::BatchHarness;
use deep_research_report::config::PipelineConfig;
use deep_research_report::generation::ScriptedGenerator;
use deep_research_report::model::{PipelineInput, SourceDocument};
use deep_research_report::retrieval::StaticRetriever;
use deep_research_report::similarity::SimilarityScorer;
use deep_research_report::Pipeline;

fn sources() -> Vec<SourceDocument> {
    vec![
        SourceDocument::new(
            "ions",
            "https://ions.example.org",
            "Trapped ions keep coherence for whole seconds. Gate speed is slower.",
        ),
        SourceDocument::new(
            "atoms",
            "https://atoms.example.org",
            "Neutral atom arrays reach hundreds of qubits. Loading is probabilistic.",
        ),
    ]
}

fn harness(gen: ScriptedGenerator, parallel: usize) -> BatchHarness {
    let mut cfg = PipelineConfig::default();
    cfg.review.retry_backoff_ms = 0;
    cfg.concurrency.max_parallel_queries = parallel;
    let retriever = StaticRetriever::new().with_default(sources());
    BatchHarness::new(Arc::new(Pipeline::new(cfg, Arc::new(gen), Arc::new(retriever))))
}

fn query(q: &str) -> PipelineInput {
    PipelineInput::new(q).with_sections(&["Findings"])
}

#[tokio::test]
async fn ground_truth_is_scored_only_when_present() {
    let h = harness(ScriptedGenerator::new(), 2);
    let queries = vec![
        query("trapped ions").with_ground_truth("Trapped ions keep coherence for whole seconds."),
        query("neutral atoms"),
        // Partial mode with no sections fails validation.
        PipelineInput::new("broken").partial(),
    ];
    let out = h.run(queries, &CancellationToken::new()).await;

    assert_eq!(out.results.len(), 2);
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].query, "broken");
    assert!(out.cancelled.is_empty());

    let with_gt = &out.results[0];
    assert_eq!(with_gt.query, "trapped ions");
    let sim = with_gt.ground_truth_similarity.expect("scored");
    assert!(sim > 0.0 && sim <= 1.0);
    assert!(out.results[1].ground_truth_similarity.is_none());
    assert!(out.results.iter().all(|r| r.judgement.is_none()));

    let s = &out.summary;
    assert_eq!(s.total, 3);
    assert_eq!(s.completed, 2);
    assert_eq!(s.failed, 1);
    assert_eq!(s.evaluated, 1);
    assert_eq!(s.evaluation_metric, "cosine");
    assert_eq!(s.mean_ground_truth_similarity, Some(sim));
    assert!((s.mean_citation_coverage - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn blank_ground_truth_is_not_evaluated() {
    let h = harness(ScriptedGenerator::new(), 1);
    let out = h
        .run(vec![query("trapped ions").with_ground_truth("   ")], &CancellationToken::new())
        .await;
    assert!(out.results[0].ground_truth_similarity.is_none());
    assert_eq!(out.summary.evaluated, 0);
    assert!(out.summary_markdown().contains("no ground truth supplied"));
}

struct Constant;

impl SimilarityScorer for Constant {
    fn score(&self, _claim: &str, _source: &str) -> f32 {
        0.42
    }
    fn name(&self) -> &'static str {
        "constant"
    }
}

#[tokio::test]
async fn evaluator_is_pluggable() {
    let h = harness(ScriptedGenerator::new(), 1).with_evaluator(Arc::new(Constant));
    let out = h
        .run(vec![query("trapped ions").with_ground_truth("anything")], &CancellationToken::new())
        .await;
    assert_eq!(out.results[0].ground_truth_similarity, Some(0.42));
    assert_eq!(out.summary.evaluation_metric, "constant");
}

#[tokio::test]
async fn cancelled_before_start_discards_everything() {
    let gen = Arc::new(ScriptedGenerator::new());
    let mut cfg = PipelineConfig::default();
    cfg.review.retry_backoff_ms = 0;
    let h = BatchHarness::new(Arc::new(Pipeline::new(
        cfg,
        gen.clone(),
        Arc::new(StaticRetriever::new().with_default(sources())),
    )));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let out = h.run(vec![query("a"), query("b")], &cancel).await;
    assert!(out.results.is_empty());
    assert_eq!(out.cancelled, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(out.summary.cancelled, 2);
    assert!(gen.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancellation_mid_batch_keeps_finished_queries_only() {
    let gen = ScriptedGenerator::new().with_delay(Duration::from_millis(10));
    let h = harness(gen, 1);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // First query needs three calls (title, draft, review); the second is mid-flight here.
        tokio::time::sleep(Duration::from_millis(45)).await;
        trigger.cancel();
    });

    let out = h.run(vec![query("first"), query("second")], &cancel).await;
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].query, "first");
    assert_eq!(out.cancelled, vec!["second".to_string()]);
    assert!(out.summary_markdown().contains("| second | cancelled | - | - |"));
}

fn judged_harness(gen: Arc<ScriptedGenerator>, quality_threshold: f32) -> BatchHarness {
    let mut cfg = PipelineConfig::default();
    cfg.review.retry_backoff_ms = 0;
    cfg.evaluation.judge = true;
    cfg.evaluation.quality_threshold = quality_threshold;
    let retriever = StaticRetriever::new().with_default(sources());
    BatchHarness::new(Arc::new(Pipeline::new(cfg, gen, Arc::new(retriever))))
}

#[tokio::test]
async fn judge_grades_reports_against_quality_threshold() {
    let gen = Arc::new(
        ScriptedGenerator::new()
            .judgement("trapped ions", ScriptedGenerator::judge_json(0.9))
            // Unparseable first answer, then the strict retry succeeds.
            .judgement("neutral atoms", "looks fine to me")
            .judgement("neutral atoms", ScriptedGenerator::judge_json(0.5)),
    );
    let h = judged_harness(gen.clone(), 0.7);
    let out = h
        .run(vec![query("trapped ions"), query("neutral atoms")], &CancellationToken::new())
        .await;

    assert_eq!(out.results.len(), 2);
    let first = out.results[0].judgement.as_ref().expect("judged");
    assert!((first.overall_score - 0.9).abs() < 1e-6);
    assert!(first.passed);
    let second = out.results[1].judgement.as_ref().expect("judged");
    assert!(!second.passed);

    let judge_calls: Vec<bool> = gen
        .calls()
        .iter()
        .filter(|c| c.kind == "judge")
        .map(|c| c.strict)
        .collect();
    assert_eq!(judge_calls.len(), 3);
    assert_eq!(judge_calls.iter().filter(|strict| **strict).count(), 1);

    let s = &out.summary;
    assert_eq!(s.judged, 2);
    assert_eq!(s.passed, 1);
    assert!((s.mean_overall_score.unwrap() - 0.7).abs() < 1e-6);
    let md = out.summary_markdown();
    assert!(md.contains("passed 1/2"));
    assert!(md.contains("0.900 (pass)"));
    assert!(md.contains("0.500 (fail)"));
}

#[tokio::test]
async fn judge_failure_keeps_the_report_ungraded() {
    let gen = Arc::new(ScriptedGenerator::new().judge_failure("trapped ions", "judge offline"));
    let h = judged_harness(gen.clone(), 0.7);
    let out = h
        .run(vec![query("trapped ions")], &CancellationToken::new())
        .await;

    assert_eq!(out.summary.completed, 1);
    assert!(out.failures.is_empty());
    assert!(out.results[0].judgement.is_none());
    assert_eq!(out.summary.judged, 0);
    assert!(out.summary.mean_overall_score.is_none());
    // One call plus the default two retries.
    assert_eq!(gen.judge_calls(), 3);
}

#[tokio::test]
async fn judging_is_off_unless_configured() {
    let gen = Arc::new(ScriptedGenerator::new());
    let mut cfg = PipelineConfig::default();
    cfg.review.retry_backoff_ms = 0;
    let pipeline = Arc::new(Pipeline::new(
        cfg,
        gen.clone(),
        Arc::new(StaticRetriever::new().with_default(sources())),
    ));

    let out = BatchHarness::new(pipeline.clone())
        .run(vec![query("trapped ions")], &CancellationToken::new())
        .await;
    assert!(out.results[0].judgement.is_none());
    assert_eq!(gen.judge_calls(), 0);

    let out = BatchHarness::new(pipeline)
        .with_judge(gen.clone(), 0.75)
        .run(vec![query("trapped ions")], &CancellationToken::new())
        .await;
    // Unscripted judge answers score 0.8 across the board.
    let j = out.results[0].judgement.as_ref().expect("judged");
    assert!(j.passed);
    assert_eq!(gen.judge_calls(), 1);
}

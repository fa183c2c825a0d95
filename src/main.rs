//! Batch runner: reads a batch file, produces one grounded report per query
//! and writes reports, batch results and the evaluation summary.
//!
//! Usage: `research-batch <batch.json|batch.toml> [sources.json]`
//! (or `BATCH_CONFIG_PATH` / `SOURCES_PATH`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deep_research_report::batch::BatchHarness;
use deep_research_report::config::{load_batch_file, PipelineConfig};
use deep_research_report::generation::build_generator;
use deep_research_report::output::{FileSink, ReportSink};
use deep_research_report::pipeline::Pipeline;
use deep_research_report::retrieval::StaticRetriever;
use deep_research_report::telemetry;
use deep_research_report::PipelineError;

const ENV_BATCH_PATH: &str = "BATCH_CONFIG_PATH";
const ENV_SOURCES_PATH: &str = "SOURCES_PATH";

#[tokio::main]
async fn main() {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "research-batch failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let batch_path = args
        .next()
        .or_else(|| std::env::var(ENV_BATCH_PATH).ok())
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: research-batch <batch.json|batch.toml> [sources.json]"))?;
    let sources_path = args
        .next()
        .or_else(|| std::env::var(ENV_SOURCES_PATH).ok())
        .map(PathBuf::from);

    let config =
        PipelineConfig::load().map_err(|e| PipelineError::Config(format!("{e:#}")))?;
    let queries = load_batch_file(&batch_path)?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;
    telemetry::describe_metrics();

    let generator = build_generator()?;
    let retriever = match &sources_path {
        Some(p) => StaticRetriever::from_json_file(p)?,
        None => {
            warn!("no sources file given, every query runs with an empty source pool");
            StaticRetriever::new()
        }
    };

    let out_dir = config
        .output
        .dir
        .join(format!("batch_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
    let sink = FileSink::new(&out_dir)?;

    let pipeline = Arc::new(Pipeline::new(config, generator, Arc::new(retriever)));
    let harness = BatchHarness::new(pipeline);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            ctrl_c.cancel();
        }
    });

    info!(queries = queries.len(), out = %out_dir.display(), "starting batch");
    let outcome = harness.run(queries, &cancel).await;

    for result in &outcome.results {
        sink.write_report(&result.report)?;
    }
    sink.write_batch(&outcome)?;
    sink.write_metrics(&prometheus.render())?;

    info!(
        completed = outcome.summary.completed,
        failed = outcome.summary.failed,
        cancelled = outcome.summary.cancelled,
        out = %sink.dir().display(),
        "batch complete"
    );
    Ok(())
}

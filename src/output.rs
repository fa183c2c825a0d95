//! Persistence of finished reports and batch artifacts.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

use crate::batch::BatchOutcome;
use crate::model::Report;
use crate::telemetry::anon_id;

pub trait ReportSink: Send + Sync {
    /// Persist one report; returns where its JSON form was written.
    fn write_report(&self, report: &Report) -> anyhow::Result<PathBuf>;
    /// Persist batch results and the aggregate summary.
    fn write_batch(&self, outcome: &BatchOutcome) -> anyhow::Result<PathBuf>;
}

/// Writes under one output directory:
/// `reports/<slug>.json`, `reports/<slug>.md`, `batch_results.json`,
/// `evaluation_summary.md`.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("reports"))
            .with_context(|| format!("creating output dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the rendered Prometheus exposition next to the batch files.
    pub fn write_metrics(&self, exposition: &str) -> anyhow::Result<PathBuf> {
        let path = self.dir.join("metrics.prom");
        write_atomic(&path, exposition.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

impl ReportSink for FileSink {
    fn write_report(&self, report: &Report) -> anyhow::Result<PathBuf> {
        let slug = report_slug(&report.metadata.query);
        let json_path = self.dir.join("reports").join(format!("{slug}.json"));
        let md_path = self.dir.join("reports").join(format!("{slug}.md"));

        let json = serde_json::to_vec_pretty(report).context("serialising report")?;
        write_atomic(&json_path, &json).with_context(|| format!("writing {}", json_path.display()))?;
        write_atomic(&md_path, report.to_markdown().as_bytes())
            .with_context(|| format!("writing {}", md_path.display()))?;

        info!(target: "output", path = %json_path.display(), "report written");
        Ok(json_path)
    }

    fn write_batch(&self, outcome: &BatchOutcome) -> anyhow::Result<PathBuf> {
        let results_path = self.dir.join("batch_results.json");
        let summary_path = self.dir.join("evaluation_summary.md");

        let json = serde_json::to_vec_pretty(outcome).context("serialising batch results")?;
        write_atomic(&results_path, &json)
            .with_context(|| format!("writing {}", results_path.display()))?;
        write_atomic(&summary_path, outcome.summary_markdown().as_bytes())
            .with_context(|| format!("writing {}", summary_path.display()))?;

        info!(target: "output", path = %results_path.display(), "batch results written");
        Ok(results_path)
    }
}

/// File-name-safe prefix of the query plus a short hash so that similar
/// queries never collide.
pub fn report_slug(query: &str) -> String {
    let mut prefix = String::with_capacity(30);
    let mut last_dash = true;
    for c in query.chars() {
        if prefix.len() >= 30 {
            break;
        }
        if c.is_ascii_alphanumeric() {
            prefix.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            prefix.push('-');
            last_dash = true;
        }
    }
    let prefix = prefix.trim_matches('-');
    let hash = anon_id(query);
    if prefix.is_empty() {
        format!("report-{}", &hash[..8])
    } else {
        format!("{prefix}-{}", &hash[..8])
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    fs::rename(tmp, path)
}

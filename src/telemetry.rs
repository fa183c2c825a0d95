//! Tracing setup, metric descriptions and log-safe identifiers.

use metrics::{describe_counter, describe_histogram};
use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "RESEARCH_LOG_FORMAT";

/// Install the global subscriber. `RUST_LOG` drives filtering (default `info`);
/// `RESEARCH_LOG_FORMAT=json` switches to JSON lines. Safe to call twice.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Register help text for every metric series once per process.
pub fn describe_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("grounding_claims_total", "Claims extracted and scored against sources");
        describe_counter!("grounding_unsupported_total", "Claims left without a source");
        describe_counter!("review_iterations_total", "Draft iterations across all sections");
        describe_counter!("generation_attempts_total", "Calls made to the generation service");
        describe_counter!("generation_failures_total", "Failed or rejected generation calls");
        describe_counter!("sections_placeholder_total", "Sections replaced by placeholders");
        describe_counter!("assemble_citations_total", "Global citations in assembled reports");
        describe_counter!("batch_queries_total", "Batch queries by outcome");
        describe_counter!("batch_queries_cancelled_total", "Batch queries discarded on cancel");
        describe_counter!("batch_judged_total", "Judge verdicts on finished reports by outcome");
        describe_histogram!("report_citation_coverage", "Per-report grounded claim share");
    });
}

/// Short stable id for text that must not appear in logs verbatim.
pub fn anon_id(text: &str) -> String {
    use sha2::{Digest, Sha256};
    use std::fmt::Write as _;

    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

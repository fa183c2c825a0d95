// src/config.rs
//! Pipeline configuration (TOML + env overrides) and batch file loading.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::PipelineInput;
use crate::similarity::Metric;

pub const DEFAULT_CONFIG_PATH: &str = "config/research.toml";
pub const ENV_CONFIG_PATH: &str = "RESEARCH_CONFIG_PATH";
pub const ENV_CITATION_THRESHOLD: &str = "CITATION_THRESHOLD";
pub const ENV_REVIEW_MAX_ITERATIONS: &str = "REVIEW_MAX_ITERATIONS";

pub const MAX_REVIEW_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub grounding: GroundingConfig,
    pub review: ReviewConfig,
    pub concurrency: ConcurrencyConfig,
    pub evaluation: EvaluationConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GroundingConfig {
    pub citation_threshold: f32,
    pub tie_epsilon: f32,
    pub metric: Metric,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            citation_threshold: 0.6,
            tie_epsilon: 1e-6,
            metric: Metric::TokenOverlap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Hard cap on drafts per section, including the first one.
    pub max_iterations: u32,
    pub unsupported_tolerance: f32,
    pub min_key_points: usize,
    /// Retries after a failed generation call (service errors).
    pub generation_retries: u32,
    pub retry_backoff_ms: u64,
    pub min_review_confidence: Option<f32>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            unsupported_tolerance: 0.2,
            min_key_points: 3,
            generation_retries: 2,
            retry_backoff_ms: 250,
            min_review_confidence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_parallel_sections: usize,
    pub max_parallel_queries: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_sections: 4,
            max_parallel_queries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluationConfig {
    pub metric: Metric,
    /// Ask the generation service to grade every finished report.
    pub judge: bool,
    /// Overall judge score a report needs to pass.
    pub quality_threshold: f32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            judge: false,
            quality_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("out"),
        }
    }
}

impl PipelineConfig {
    /// Load using `$RESEARCH_CONFIG_PATH`, then `config/research.toml`, then
    /// built-in defaults. Env overrides and clamping are applied in all cases.
    pub fn load() -> Result<Self> {
        let cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::from_path(&pb)?
        } else {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.exists() {
                Self::from_path(&default)?
            } else {
                info!(target: "config", "no config file found, using defaults");
                Self::default()
            }
        };
        Ok(cfg.with_env_overrides().validated())
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(s)?;
        Ok(cfg.validated())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(t) = parse_threshold_env(std::env::var(ENV_CITATION_THRESHOLD).ok()) {
            self.grounding.citation_threshold = t;
        }
        if let Ok(raw) = std::env::var(ENV_REVIEW_MAX_ITERATIONS) {
            match raw.trim().parse::<u32>() {
                Ok(n) => self.review.max_iterations = n,
                Err(_) => warn!(target: "config", value = %raw, "ignoring invalid {ENV_REVIEW_MAX_ITERATIONS}"),
            }
        }
        self
    }

    /// Clamp every knob into its valid range.
    pub fn validated(mut self) -> Self {
        let g = &mut self.grounding;
        g.citation_threshold = clamp_unit(g.citation_threshold, 0.6);
        g.tie_epsilon = if g.tie_epsilon.is_finite() {
            g.tie_epsilon.max(0.0)
        } else {
            1e-6
        };
        let r = &mut self.review;
        r.max_iterations = r.max_iterations.clamp(1, MAX_REVIEW_ITERATIONS);
        r.unsupported_tolerance = clamp_unit(r.unsupported_tolerance, 0.2);
        r.min_review_confidence = r.min_review_confidence.map(|c| clamp_unit(c, 0.0));
        let c = &mut self.concurrency;
        c.max_parallel_sections = c.max_parallel_sections.max(1);
        c.max_parallel_queries = c.max_parallel_queries.max(1);
        self.evaluation.quality_threshold = clamp_unit(self.evaluation.quality_threshold, 0.7);
        self
    }
}

fn clamp_unit(v: f32, fallback: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

fn parse_threshold_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, 1.0))
}

// ------------------------------------------------------------
// Batch files
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BatchFile {
    queries: Vec<PipelineInput>,
}

/// Load a batch file. Supports JSON or TOML (`[[queries]]`).
pub fn load_batch_file(path: &Path) -> Result<Vec<PipelineInput>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading batch file {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_batch(&content, &ext).with_context(|| format!("parsing batch file {}", path.display()))
}

pub fn parse_batch(s: &str, hint_ext: &str) -> Result<Vec<PipelineInput>> {
    let try_toml = hint_ext == "toml" || s.contains("[[queries]]");
    let parsed = if try_toml {
        toml::from_str::<BatchFile>(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| serde_json::from_str::<BatchFile>(s).map_err(anyhow::Error::from))
    } else {
        serde_json::from_str::<BatchFile>(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| toml::from_str::<BatchFile>(s).map_err(anyhow::Error::from))
    };
    let batch = parsed.map_err(|e| anyhow!("unsupported batch format: {e}"))?;
    let queries: Vec<PipelineInput> = batch
        .queries
        .into_iter()
        .filter(|q| !q.query.trim().is_empty())
        .collect();
    if queries.is_empty() {
        return Err(anyhow!("batch file lists no queries"));
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
[grounding]
citation_threshold = 0.75

[review]
max_iterations = 50
"#,
        )
        .unwrap();
        assert!((cfg.grounding.citation_threshold - 0.75).abs() < 1e-6);
        assert_eq!(cfg.grounding.metric, Metric::TokenOverlap);
        assert_eq!(cfg.review.max_iterations, MAX_REVIEW_ITERATIONS);
        assert_eq!(cfg.review.min_key_points, 3);
        assert_eq!(cfg.evaluation.metric, Metric::Cosine);
        assert!(!cfg.evaluation.judge);
        assert!((cfg.evaluation.quality_threshold - 0.7).abs() < 1e-6);
        assert_eq!(cfg.concurrency.max_parallel_sections, 4);
    }

    #[test]
    fn judge_settings_parse_and_clamp() {
        let cfg = PipelineConfig::from_toml_str("[evaluation]
judge = true
quality_threshold = 1.5
")
            .unwrap();
        assert!(cfg.evaluation.judge);
        assert_eq!(cfg.evaluation.quality_threshold, 1.0);
        assert_eq!(cfg.evaluation.metric, Metric::Cosine);
    }

    #[test]
    fn zero_iterations_and_out_of_range_values_are_clamped() {
        let cfg = PipelineConfig::from_toml_str(
            "[review]\nmax_iterations = 0\nunsupported_tolerance = 3.0\n[concurrency]\nmax_parallel_queries = 0\n",
        )
        .unwrap();
        assert_eq!(cfg.review.max_iterations, 1);
        assert_eq!(cfg.review.unsupported_tolerance, 1.0);
        assert_eq!(cfg.concurrency.max_parallel_queries, 1);
    }

    #[test]
    fn threshold_env_parsing_clamps() {
        assert_eq!(parse_threshold_env(Some(" 1.7 ".into())), Some(1.0));
        assert_eq!(parse_threshold_env(Some("-1".into())), Some(0.0));
        assert_eq!(parse_threshold_env(Some("abc".into())), None);
        assert_eq!(parse_threshold_env(None), None);
    }

    #[test]
    fn batch_json_and_toml() {
        let json = r#"{"queries":[{"query":"quantum error correction","ground_truth":"Qubits"},{"query":"  "}]}"#;
        let q = parse_batch(json, "json").unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].ground_truth.as_deref(), Some("Qubits"));

        let toml = r#"
[[queries]]
query = "solid state batteries"
mode = "partial"
sections = ["Findings"]
citation_threshold = 0.5
"#;
        let q = parse_batch(toml, "toml").unwrap();
        assert_eq!(q[0].mode, Mode::Partial);
        assert_eq!(q[0].sections, vec!["Findings".to_string()]);
        assert_eq!(q[0].citation_threshold, Some(0.5));

        assert!(parse_batch(r#"{"queries":[]}"#, "json").is_err());
        assert!(parse_batch("not a batch", "txt").is_err());
    }
}

//! Claim/source similarity metrics.
//!
//! All scores are deterministic and lie in [0.0, 1.0]. Grounding and
//! evaluation use the same trait but are configured independently.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?u)\b\w+\b").expect("tokenizer regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in", "is",
    "it", "its", "of", "on", "or", "that", "the", "their", "this", "to", "was", "were", "which",
    "with",
];

pub trait SimilarityScorer: Send + Sync {
    /// Similarity of `claim` against `source`, in [0.0, 1.0].
    fn score(&self, claim: &str, source: &str) -> f32;
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Share of the claim's content words found in the source.
    #[default]
    TokenOverlap,
    /// Term-frequency cosine over lowercase words.
    Cosine,
    /// Character-bigram Sørensen-Dice (strsim).
    SorensenDice,
    /// Normalized Levenshtein distance (strsim).
    Levenshtein,
}

impl SimilarityScorer for Metric {
    fn score(&self, claim: &str, source: &str) -> f32 {
        let raw = match self {
            Metric::TokenOverlap => token_overlap(claim, source),
            Metric::Cosine => cosine(claim, source),
            Metric::SorensenDice => {
                strsim::sorensen_dice(&claim.to_lowercase(), &source.to_lowercase()) as f32
            }
            Metric::Levenshtein => {
                strsim::normalized_levenshtein(&claim.to_lowercase(), &source.to_lowercase())
                    as f32
            }
        };
        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 1.0)
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Metric::TokenOverlap => "token_overlap",
            Metric::Cosine => "cosine",
            Metric::SorensenDice => "sorensen_dice",
            Metric::Levenshtein => "levenshtein",
        }
    }
}

/// Lowercased word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    WORD.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

fn content_words(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn token_overlap(claim: &str, source: &str) -> f32 {
    let claim_words = content_words(claim);
    if claim_words.is_empty() {
        return 0.0;
    }
    let source_words = content_words(source);
    let hits = claim_words.intersection(&source_words).count();
    hits as f32 / claim_words.len() as f32
}

fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let mut tf = BTreeMap::new();
    for t in tokenize(text) {
        *tf.entry(t).or_insert(0.0) += 1.0;
    }
    tf
}

fn cosine(a: &str, b: &str) -> f32 {
    let ta = term_frequencies(a);
    let tb = term_frequencies(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let dot: f64 = ta
        .iter()
        .filter_map(|(k, va)| tb.get(k).map(|vb| va * vb))
        .sum();
    let na: f64 = ta.values().map(|v| v * v).sum::<f64>().sqrt();
    let nb: f64 = tb.values().map(|v| v * v).sum::<f64>().sqrt();
    (dot / (na * nb)) as f32
}

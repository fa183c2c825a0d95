//! Reference formatting for `chicago` and `apa` styles.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::SourceDocument;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationStyle {
    #[default]
    Chicago,
    Apa,
}

impl CitationStyle {
    /// Case-insensitive parse. Unknown names fall back to chicago with a warning.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "chicago" | "" => CitationStyle::Chicago,
            "apa" => CitationStyle::Apa,
            other => {
                warn!(target: "style", style = other, "unknown citation style, using chicago");
                CitationStyle::Chicago
            }
        }
    }

    /// Display text for a source (without the URL, which is stored separately).
    pub fn format(&self, source: &SourceDocument) -> String {
        let authors = self.join_authors(&source.authors);
        let year = source
            .year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "n.d.".to_string());
        let title = source
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled");
        let title = title.trim_end_matches('.');

        let text = match self {
            CitationStyle::Chicago => format!("{authors}. {year}. \"{title}.\""),
            CitationStyle::Apa => format!("{authors}. ({year}). {title}."),
        };
        bracket_free(&text)
    }

    fn join_authors(&self, authors: &[String]) -> String {
        let names: Vec<&str> = authors
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .take(3)
            .collect();
        let conj = match self {
            CitationStyle::Chicago => "and",
            CitationStyle::Apa => "&",
        };
        match names.as_slice() {
            [] => "Unknown Author".to_string(),
            [one] => one.to_string(),
            [a, b] => format!("{a} {conj} {b}"),
            [a, b, c, ..] => format!("{a}, {b}, {conj} {c}"),
        }
    }
}

impl fmt::Display for CitationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CitationStyle::Chicago => f.write_str("chicago"),
            CitationStyle::Apa => f.write_str("apa"),
        }
    }
}

/// Only http(s) URLs are kept in citations.
pub fn valid_url(url: &str) -> Option<&str> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Some(url)
    } else {
        None
    }
}

// Square brackets in reference text would be read back as markers.
fn bracket_free(text: &str) -> String {
    text.replace('[', "(").replace(']', ")")
}

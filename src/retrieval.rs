//! Retrieval boundary and the read-only source pool built from its results.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RetrievalFailure;
use crate::model::SourceDocument;
use crate::telemetry::anon_id;

const MAX_SOURCE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub max_results: usize,
    /// Search refinement depth hint, passed through to the retriever.
    pub depth: u32,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    /// Sources for the query, most relevant first.
    async fn retrieve(&self, request: &RetrievalRequest) -> anyhow::Result<Vec<SourceDocument>>;
    fn name(&self) -> &'static str;
}

pub type DynRetriever = Arc<dyn Retriever>;

/// Normalised, deduplicated sources of one query. Cloning shares the data;
/// nothing can mutate it after construction.
#[derive(Debug, Clone)]
pub struct SourcePool {
    docs: Arc<[SourceDocument]>,
}

impl SourcePool {
    pub fn empty() -> Self {
        Self {
            docs: Arc::from(Vec::new()),
        }
    }

    /// Build the pool from raw retriever output (relevance order). Texts are
    /// normalised, empty ones dropped, duplicate URLs keep the first copy and
    /// ranks are renumbered 1..n. At most `max_results` documents are kept.
    pub fn from_retrieved(raw: Vec<SourceDocument>, max_results: usize) -> Self {
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut docs: Vec<SourceDocument> = Vec::with_capacity(raw.len());

        for mut doc in raw {
            if docs.len() >= max_results {
                break;
            }
            doc.text = normalize_text(&doc.text);
            if doc.text.is_empty() {
                debug!(target: "retrieval", url = %doc.url, "dropping source with empty text");
                continue;
            }
            doc.url = doc.url.trim().to_string();
            doc.title = doc
                .title
                .map(|t| normalize_text(&t))
                .filter(|t| !t.is_empty());

            let key = if doc.url.is_empty() {
                format!("text:{}", anon_id(&doc.text))
            } else {
                format!("url:{}", doc.url.trim_end_matches('/').to_ascii_lowercase())
            };
            if !seen_keys.insert(key) {
                debug!(target: "retrieval", url = %doc.url, "dropping duplicate source");
                continue;
            }

            doc.retrieval_rank = docs.len() + 1;
            let mut id = doc.id.trim().to_string();
            if id.is_empty() {
                id = format!(
                    "src-{}",
                    anon_id(if doc.url.is_empty() { &doc.text } else { &doc.url })
                );
            }
            if seen_ids.contains(&id) {
                id = format!("{id}-{}", doc.retrieval_rank);
            }
            seen_ids.insert(id.clone());
            doc.id = id;
            docs.push(doc);
        }

        Self {
            docs: Arc::from(docs),
        }
    }

    pub fn as_slice(&self) -> &[SourceDocument] {
        &self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SourceDocument> {
        self.docs.iter().find(|d| d.id == id)
    }
}

/// Run the retriever and build a pool. Failures and empty results are
/// reported alongside an empty pool instead of aborting the query.
pub async fn retrieve_pool(
    retriever: &dyn Retriever,
    request: &RetrievalRequest,
) -> (SourcePool, Option<RetrievalFailure>) {
    let result = retriever.retrieve(request).await;
    let (pool, failure) = match result {
        Ok(raw) => {
            let pool = SourcePool::from_retrieved(raw, request.max_results);
            let failure = pool.is_empty().then(|| RetrievalFailure {
                query: request.query.clone(),
                reason: "no usable sources returned".to_string(),
            });
            (pool, failure)
        }
        Err(e) => (
            SourcePool::empty(),
            Some(RetrievalFailure {
                query: request.query.clone(),
                reason: format!("{e:#}"),
            }),
        ),
    };
    match &failure {
        Some(f) => warn!(target: "retrieval", retriever = retriever.name(), error = %f, "continuing with empty source pool"),
        None => info!(target: "retrieval", retriever = retriever.name(), sources = pool.len(), "sources retrieved"),
    }
    (pool, failure)
}

/// Clean retrieved text before scoring: entities decoded, tags stripped,
/// typographic quotes folded, whitespace collapsed, length capped.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_SOURCE_CHARS {
        out = out.chars().take(MAX_SOURCE_CHARS).collect();
    }
    out
}

// ------------------------------------------------------------
// Static retriever (offline runs, tests)
// ------------------------------------------------------------

/// Serves fixed source lists by query. File form:
/// `{"queries": {"<query>": [SourceDocument, ...]}, "default": [...]}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticRetriever {
    #[serde(default)]
    queries: BTreeMap<String, Vec<SourceDocument>>,
    #[serde(default)]
    default: Vec<SourceDocument>,
}

impl StaticRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: &str, docs: Vec<SourceDocument>) -> Self {
        self.queries.insert(query_key(query), docs);
        self
    }

    pub fn with_default(mut self, docs: Vec<SourceDocument>) -> Self {
        self.default = docs;
        self
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("reading sources from {}", path.display()))?;
        let parsed: StaticRetriever = serde_json::from_str(&s)
            .with_context(|| format!("parsing sources file {}", path.display()))?;
        Ok(Self {
            queries: parsed
                .queries
                .into_iter()
                .map(|(k, v)| (query_key(&k), v))
                .collect(),
            default: parsed.default,
        })
    }
}

fn query_key(q: &str) -> String {
    q.trim().to_lowercase()
}

#[async_trait]
impl Retriever for StaticRetriever {
    async fn retrieve(&self, request: &RetrievalRequest) -> anyhow::Result<Vec<SourceDocument>> {
        let docs = self
            .queries
            .get(&query_key(&request.query))
            .unwrap_or(&self.default);
        Ok(docs.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

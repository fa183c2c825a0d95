//! Citation marker scanning and claim extraction.
//!
//! A marker is a bracketed group of decimal ids (`[3]`, `[2, 5]`). Any other
//! bracketed text (`[sic]`, markdown link labels) is prose. Brackets must be
//! balanced and never nested, otherwise the whole draft is malformed.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MalformedMarkerError;
use crate::model::Claim;

static MARKER_BODY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+(?:\s*,\s*\d+)*\s*$").expect("marker regex"));
static NUMERIC_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*\d+(?:\s*,\s*\d+)*\s*\]").expect("numeric group regex"));
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+([.,;:!?)])").expect("punct regex"));
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}").expect("space regex"));

/// One marker as it appears in text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerOccurrence {
    /// Byte range including both brackets.
    pub span: Range<usize>,
    /// Ids in written order, leading zeros removed.
    pub ids: Vec<String>,
}

/// Canonical form of a marker id (`"007"` and `" 7"` are both `"7"`).
pub fn normalize_id(id: &str) -> String {
    let t = id.trim().trim_start_matches('0');
    if t.is_empty() && !id.trim().is_empty() {
        "0".to_string()
    } else {
        t.to_string()
    }
}

/// Scan `content` for markers. Brackets are ASCII, so a byte scan is char-boundary safe.
pub fn scan_markers(content: &str) -> Result<Vec<MarkerOccurrence>, MalformedMarkerError> {
    let mut out = Vec::new();
    let mut open: Option<usize> = None;
    for (i, b) in content.bytes().enumerate() {
        match b {
            b'[' => {
                if open.is_some() {
                    return Err(MalformedMarkerError::Nested { offset: i });
                }
                open = Some(i);
            }
            b']' => {
                let start = open.take().ok_or(MalformedMarkerError::Unbalanced {
                    bracket: ']',
                    offset: i,
                })?;
                let inner = &content[start + 1..i];
                if MARKER_BODY.is_match(inner) {
                    out.push(MarkerOccurrence {
                        span: start..i + 1,
                        ids: inner.split(',').map(normalize_id).collect(),
                    });
                }
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        return Err(MalformedMarkerError::Unbalanced {
            bracket: '[',
            offset: start,
        });
    }
    Ok(out)
}

/// Rebuild `content` with every marker passed through `replace`.
///
/// `Some(text)` substitutes the marker; `None` removes it together with the
/// spacing that separated it from the preceding word.
pub fn rewrite_markers<F>(content: &str, mut replace: F) -> Result<String, MalformedMarkerError>
where
    F: FnMut(usize, &MarkerOccurrence) -> Option<String>,
{
    let markers = scan_markers(content)?;
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for (i, m) in markers.iter().enumerate() {
        out.push_str(&content[cursor..m.span.start]);
        cursor = m.span.end;
        match replace(i, m) {
            Some(text) => out.push_str(&text),
            None => {
                let next = content[cursor..].chars().next();
                if next.map_or(true, |c| c.is_whitespace() || ".,;:!?)".contains(c)) {
                    let kept = out.trim_end_matches([' ', '\t']).len();
                    out.truncate(kept);
                }
            }
        }
    }
    out.push_str(&content[cursor..]);
    Ok(out)
}

/// Text with every marker removed. Key points carry no citations of their own.
pub fn strip_markers(text: &str) -> String {
    rewrite_markers(text, |_, _| None).unwrap_or_else(|_| sanitize_malformed(text))
}

/// Lenient cleanup for drafts whose markers cannot be parsed: drops numeric
/// groups and any stray bracket, then tidies the spacing left behind.
pub fn sanitize_malformed(content: &str) -> String {
    let stripped = NUMERIC_GROUP.replace_all(content, "");
    let stripped = stripped.replace(['[', ']'], "");
    let tidy = SPACE_BEFORE_PUNCT.replace_all(&stripped, "$1");
    SPACE_RUNS.replace_all(&tidy, " ").trim().to_string()
}

/// Extract one claim per marker occurrence.
///
/// `declared` are the citation ids the draft says it uses. When non-empty,
/// every marker id must be among them. An empty list is the pre-grounding
/// state and is accepted.
pub fn extract_claims(
    section_id: usize,
    content: &str,
    declared: &[String],
) -> Result<Vec<Claim>, MalformedMarkerError> {
    let markers = scan_markers(content)?;

    if !declared.is_empty() {
        let declared: Vec<String> = declared.iter().map(|d| normalize_id(d)).collect();
        for m in &markers {
            if let Some(missing) = m.ids.iter().find(|id| !declared.contains(id)) {
                return Err(MalformedMarkerError::UndeclaredId {
                    id: missing.clone(),
                    offset: m.span.start,
                });
            }
        }
    }

    let mut claims: Vec<Claim> = Vec::with_capacity(markers.len());
    let mut floor = 0usize;
    for (idx, m) in markers.iter().enumerate() {
        let start = sentence_start(content, m.span.start).max(floor);
        let mut span = trim_span(content, start..m.span.start);

        if span.is_empty() {
            span = match claims.last() {
                // `[1] [2]` or `claim [1], [2]`: both markers attach to the same text.
                Some(prev) if only_glue(&content[prev.marker_span.end..m.span.start]) => {
                    prev.text_span.clone()
                }
                _ => {
                    let previous = previous_sentence(content, start, floor);
                    if previous.is_empty() {
                        let limit = markers
                            .get(idx + 1)
                            .map(|n| n.span.start)
                            .unwrap_or(content.len());
                        following_sentence(content, m.span.end, limit)
                    } else {
                        previous
                    }
                }
            };
        }

        claims.push(Claim {
            section_id,
            text: content[span.clone()].to_string(),
            text_span: span,
            marker_span: m.span.clone(),
            raw_marker_ids: m.ids.clone(),
        });
        floor = m.span.end;
    }
    Ok(claims)
}

fn is_terminator(bytes: &[u8], j: usize) -> bool {
    bytes[j] == b'\n'
        || (matches!(bytes[j], b'.' | b'!' | b'?')
            && bytes.get(j + 1).map_or(true, |n| n.is_ascii_whitespace()))
}

fn sentence_start(content: &str, pos: usize) -> usize {
    let bytes = content.as_bytes();
    let mut j = pos;
    while j > 0 {
        j -= 1;
        if is_terminator(bytes, j) && j + 1 < pos {
            return j + 1;
        }
    }
    0
}

fn previous_sentence(content: &str, start: usize, floor: usize) -> Range<usize> {
    let end = trim_span(content, floor..start).end;
    if end <= floor {
        return floor..floor;
    }
    let begin = sentence_start(content, end.saturating_sub(1)).max(floor);
    trim_span(content, begin..end)
}

fn following_sentence(content: &str, from: usize, limit: usize) -> Range<usize> {
    let bytes = content.as_bytes();
    let mut end = limit;
    for j in from..limit {
        if is_terminator(bytes, j) && !(j == from && bytes[j] == b'\n') {
            end = if bytes[j] == b'\n' { j } else { j + 1 };
            if end > from && !content[from..end].trim().is_empty() {
                break;
            }
            end = limit;
        }
    }
    trim_span(content, from..end)
}

fn only_glue(gap: &str) -> bool {
    gap.chars().all(|c| c.is_whitespace() || c == ',' || c == ';')
}

fn trim_span(content: &str, r: Range<usize>) -> Range<usize> {
    let s = &content[r.clone()];
    if s.trim().is_empty() {
        return r.start..r.start;
    }
    let lead = s.len() - s.trim_start().len();
    let trail = s.trim_end().len();
    (r.start + lead)..(r.start + trail)
}

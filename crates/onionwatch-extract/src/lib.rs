//! Address extraction, page parsing and signal-term matching for onionwatch.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use onionwatch_core::{SignalConfig, SignalKind};
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "onionwatch-extract";

/// Length of a v3 onion service label (base32 of key, checksum and version).
pub const ONION_LABEL_LEN: usize = 56;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("signal term {term:?} cannot be compiled: {source}")]
    InvalidTerm {
        term: String,
        #[source]
        source: regex::Error,
    },
    #[error("unsupported content type {0}")]
    UnsupportedContent(String),
}

fn onion_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b([a-z2-7]{{{ONION_LABEL_LEN}}})\.onion\b"))
            .expect("onion address pattern is valid")
    })
}

/// Every distinct, normalized onion address mentioned anywhere in `text`.
///
/// Subdomain labels, scheme, port and path are dropped; the result is the
/// lower-cased `<label>.onion` host.
pub fn extract_onion_addresses(text: &str) -> BTreeSet<String> {
    onion_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|label| format!("{}.onion", label.as_str().to_ascii_lowercase()))
        .collect()
}

/// Normalize a single user-supplied address or URL. `None` if it holds no onion host.
pub fn normalize_address(input: &str) -> Option<String> {
    let mut found = extract_onion_addresses(input.trim()).into_iter();
    let first = found.next()?;
    if found.next().is_some() {
        return None;
    }
    Some(first)
}

/// URL used to reach an address through the proxy.
pub fn address_url(address: &str) -> String {
    format!("http://{address}/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    PlainText,
}

/// Decide how a response body should be read. A missing header is treated as HTML.
pub fn classify_content_type(content_type: Option<&str>) -> Result<ContentKind, ExtractError> {
    let Some(raw) = content_type else {
        return Ok(ContentKind::Html);
    };
    let mime = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "" | "text/html" | "application/xhtml+xml" => Ok(ContentKind::Html),
        "text/plain" => Ok(ContentKind::PlainText),
        _ => Err(ExtractError::UnsupportedContent(raw.to_string())),
    }
}

/// Text views of a fetched page used for matching and triage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPage {
    pub title: String,
    pub meta_text: String,
    pub body_text: String,
}

impl ParsedPage {
    pub fn parse(content_type: Option<&str>, body: &str) -> Result<Self, ExtractError> {
        match classify_content_type(content_type)? {
            ContentKind::Html => Ok(Self::from_html(body)),
            ContentKind::PlainText => Ok(Self::from_plain_text(body)),
        }
    }

    pub fn from_html(html: &str) -> Self {
        let document = Html::parse_document(html);
        Self {
            title: select_first_text(&document, "title").unwrap_or_default(),
            meta_text: select_attr_values(&document, "meta[content]", "content").join(" "),
            body_text: visible_text(&document),
        }
    }

    pub fn from_plain_text(text: &str) -> Self {
        Self {
            title: String::new(),
            meta_text: String::new(),
            body_text: collapse_whitespace(text),
        }
    }

    /// Title, meta values and body text joined into one haystack.
    pub fn searchable_text(&self) -> String {
        [
            self.title.as_str(),
            self.meta_text.as_str(),
            self.body_text.as_str(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Option<String> {
    let sel = selector(css)?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_attr_values(document: &Html, css: &str, attr: &str) -> Vec<String> {
    let Some(sel) = selector(css) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect()
}

fn visible_text(document: &Html) -> String {
    let root = selector("body")
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut parts = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript" | "template"));
        if !hidden {
            parts.push(&**text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One configured term together with its first whole-word hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermMatch {
    pub kind: SignalKind,
    pub term: String,
    /// Byte offset of the first whole-word occurrence in the scanned text.
    pub position: usize,
}

#[derive(Debug, Clone)]
struct CompiledTerm {
    kind: SignalKind,
    term: String,
    pattern: Regex,
}

/// Case-insensitive, whole-word matcher over the configured keywords and scam patterns.
///
/// An occurrence only counts when the characters on either side of it are
/// not alphanumeric, so `leak` hits "data leak." but not "leakage".
#[derive(Debug, Clone)]
pub struct SignalMatcher {
    terms: Vec<CompiledTerm>,
}

impl SignalMatcher {
    pub fn new(config: &SignalConfig) -> Result<Self, ExtractError> {
        let mut terms: Vec<CompiledTerm> = Vec::new();
        for (kind, term) in config.terms() {
            if terms.iter().any(|t| t.term.eq_ignore_ascii_case(term)) {
                continue;
            }
            let body = term
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+");
            let pattern =
                Regex::new(&format!("(?i){body}")).map_err(|source| ExtractError::InvalidTerm {
                    term: term.to_string(),
                    source,
                })?;
            terms.push(CompiledTerm {
                kind,
                term: term.to_string(),
                pattern,
            });
        }
        Ok(Self { terms })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Every term with at least one whole-word hit in `text`, in configuration order.
    pub fn scan(&self, text: &str) -> Vec<TermMatch> {
        self.terms
            .iter()
            .filter_map(|t| {
                first_whole_word(&t.pattern, text).map(|position| TermMatch {
                    kind: t.kind,
                    term: t.term.clone(),
                    position,
                })
            })
            .collect()
    }

    /// Match a parsed page and build the triage snippet around the earliest hit.
    pub fn inspect(&self, page: &ParsedPage, window: SnippetWindow) -> Option<PageSignals> {
        let haystack = page.searchable_text();
        let matches = self.scan(&haystack);
        if matches.is_empty() {
            return None;
        }

        let body_hits = self.scan(&page.body_text);
        let snippet = match body_hits.iter().map(|m| m.position).min() {
            Some(pos) => context_snippet(&page.body_text, pos, window),
            None => {
                let pos = matches.iter().map(|m| m.position).min().unwrap_or_default();
                context_snippet(&haystack, pos, window)
            }
        };

        Some(PageSignals {
            title: page.title.clone(),
            matched_terms: matches.into_iter().map(|m| m.term).collect(),
            context_snippet: snippet,
        })
    }
}

fn first_whole_word(pattern: &Regex, text: &str) -> Option<usize> {
    pattern
        .find_iter(text)
        .find(|m| {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .map(|m| m.start())
}

/// What a page contributed to a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSignals {
    pub title: String,
    pub matched_terms: Vec<String>,
    pub context_snippet: String,
}

/// Bounds of the excerpt kept around a match, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetWindow {
    pub lead_chars: usize,
    pub max_chars: usize,
}

impl Default for SnippetWindow {
    fn default() -> Self {
        Self {
            lead_chars: 80,
            max_chars: 200,
        }
    }
}

/// Excerpt of `text` starting up to `lead_chars` before `byte_pos`.
///
/// Control and other non-printable characters are removed and whitespace
/// collapsed; the result never exceeds `max_chars` characters.
pub fn context_snippet(text: &str, byte_pos: usize, window: SnippetWindow) -> String {
    let mut pos = byte_pos.min(text.len());
    while !text.is_char_boundary(pos) {
        pos -= 1;
    }
    let char_index = text[..pos].chars().count();
    let start = char_index.saturating_sub(window.lead_chars);

    let raw = text
        .chars()
        .skip(start)
        .take(window.max_chars)
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| is_printable(*c))
        .collect::<String>();
    collapse_whitespace(&raw)
}

fn is_printable(c: char) -> bool {
    if c.is_control() {
        return false;
    }
    // zero-width and bidi formatting characters
    !matches!(c, '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}')
}

//! Label extraction from iNews NSML story documents.
//!
//! Rótulos live inside `<ap>` elements. Their text follows a handful of loose
//! layouts written by hand in the newsroom:
//!
//! ```text
//! [A1-A2-A3] 10 QR -- 00010829: |contenido|
//! Faldon | 00013523: |contenido(
//! [CG1] 10 X_Total -- 00010829: |https://x.com/user/status/123(
//! ```
//!
//! A label is kept only when it sits in an `<ap>` element and its kind ends
//! in one of the recognized suffix classes (see [`LabelClass::from_kind`]).

use std::sync::LazyLock;

use regex::Regex;
use rotulos_common::LabelClass;

use crate::error::ParseError;
use crate::snapshot::Story;

static AP_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?)ap>").expect("valid regex"));
static AP_ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<ap>(.*?)</ap>").expect("valid regex"));
static CHANNEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9\-]+)\]").expect("valid regex"));
static CODED_KIND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--\s+\d+:\s+([A-Za-z_0-9]+)").expect("valid regex"));
static NUMBERED_KIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\s+([A-Za-z_][A-Za-z_0-9]*(?:\s+\d+)?)").expect("valid regex")
});
static CONTENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\|([^|(]+)").expect("valid regex"));
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<f id=title[^>]*>([^<]*)</f>").expect("valid regex"));

/// A qualifying label found in a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub story: String,
    /// Graphics channel in brackets, e.g. `CG1`.
    pub channel: Option<String>,
    /// Kind as written, e.g. `X_Total`.
    pub kind: String,
    pub class: LabelClass,
    /// Text between the first `|` and the next `|` or `(`.
    pub content: String,
    /// Whole element body.
    pub raw: String,
}

/// Fields of one `<ap>` element before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRotulo {
    pub channel: Option<String>,
    pub kind: String,
    pub content: String,
}

/// Qualifying labels of a story, lazily and in document order.
///
/// Structure is checked up front: unbalanced or nested `<ap>` tags reject the
/// whole story with a [`ParseError`].
pub fn extract_labels(story: &Story) -> Result<impl Iterator<Item = Label> + '_, ParseError> {
    check_structure(&story.content)?;
    Ok(ap_elements(&story.content).filter_map(move |body| {
        let rotulo = parse_rotulo(body)?;
        let class = LabelClass::from_kind(&rotulo.kind)?;
        Some(Label {
            story: story.name.clone(),
            channel: rotulo.channel,
            kind: rotulo.kind,
            class,
            content: rotulo.content,
            raw: body.to_string(),
        })
    }))
}

/// Per-monitor story filter.
#[derive(Debug, Clone)]
pub enum ApFilter {
    /// Admit stories with at least one qualifying label.
    QualifyingLabels,
    /// Admit stories where some `<ap>` body contains `text` or matches it as
    /// a regex. An invalid regex only falls back to the substring test.
    Pattern { text: String, regex: Option<Regex> },
}

impl ApFilter {
    pub fn new(pattern: &str) -> Self {
        if pattern.is_empty() || pattern == "ROTULOS" {
            return ApFilter::QualifyingLabels;
        }
        ApFilter::Pattern {
            text: pattern.to_string(),
            regex: Regex::new(pattern).ok(),
        }
    }

    pub fn admits(&self, story: &Story) -> bool {
        match self {
            ApFilter::QualifyingLabels => extract_labels(story)
                .map(|mut labels| labels.next().is_some())
                .unwrap_or(false),
            ApFilter::Pattern { text, regex } => ap_elements(&story.content).any(|body| {
                body.contains(text.as_str()) || regex.as_ref().is_some_and(|re| re.is_match(body))
            }),
        }
    }
}

/// Bodies of every `<ap>` element.
pub fn ap_elements(content: &str) -> impl Iterator<Item = &str> {
    AP_ELEMENT_RE
        .captures_iter(content)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
}

fn check_structure(content: &str) -> Result<(), ParseError> {
    let mut open: Option<usize> = None;
    for cap in AP_TAG_RE.captures_iter(content) {
        let Some(tag) = cap.get(0) else { continue };
        let closing = cap.get(1).is_some_and(|m| !m.as_str().is_empty());
        match (closing, open) {
            (false, None) => open = Some(tag.start()),
            (false, Some(_)) => return Err(ParseError::Nested(tag.start())),
            (true, Some(_)) => open = None,
            (true, None) => return Err(ParseError::StrayClose(tag.start())),
        }
    }
    match open {
        Some(at) => Err(ParseError::Unclosed(at)),
        None => Ok(()),
    }
}

/// Parse the body of an `<ap>` element. `None` when no kind can be found.
pub fn parse_rotulo(body: &str) -> Option<RawRotulo> {
    if body.trim().is_empty() {
        return None;
    }

    let channel_match = CHANNEL_RE.captures(body);
    let channel = channel_match
        .as_ref()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    let rest = match channel_match.as_ref().and_then(|c| c.get(0)) {
        Some(m) => body[m.end()..].trim(),
        None => body.trim(),
    };

    let kind = CODED_KIND_RE
        .captures(rest)
        .or_else(|| NUMBERED_KIND_RE.captures(rest))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .or_else(|| first_word(rest))?;
    if kind.is_empty() {
        return None;
    }

    let content = CONTENT_RE
        .captures(rest)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default();

    Some(RawRotulo {
        channel,
        kind,
        content,
    })
}

fn first_word(text: &str) -> Option<String> {
    const PUNCTUATION: &[&str] = &["]", "[[", "]]", "|", "--"];
    text.split_whitespace()
        .find(|w| {
            let digits = w.replace('-', "");
            let numeric = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
            !numeric && !PUNCTUATION.contains(w)
        })
        .map(|w| w.to_string())
}

/// Story title from the NSML `<f id=title>` field.
pub fn story_title(content: &str) -> Option<&str> {
    TITLE_RE
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|t| !t.is_empty())
}

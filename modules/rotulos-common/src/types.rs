use std::fmt;

use serde::{Deserialize, Serialize};

// --- Labels ---

/// The two rótulo families that carry embedded social posts.
/// Matched on the suffix of the label kind (`X_Total`, `X_Faldon`), case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelClass {
    Total,
    Faldon,
}

impl LabelClass {
    /// Classify a label kind. The kind needs a non-empty prefix before the
    /// recognized suffix, so a bare `Total` or `_Faldon` does not qualify.
    pub fn from_kind(kind: &str) -> Option<Self> {
        let (prefix, suffix) = kind.rsplit_once('_')?;
        if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
            return None;
        }
        if suffix.eq_ignore_ascii_case("total") {
            Some(LabelClass::Total)
        } else if suffix.eq_ignore_ascii_case("faldon") {
            Some(LabelClass::Faldon)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelClass::Total => "total",
            LabelClass::Faldon => "faldon",
        }
    }
}

impl fmt::Display for LabelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Posts ---

/// Canonical identifier of a social post: the numeric status id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(String);

impl PostId {
    /// Accepts only non-empty ASCII digit strings, which also keeps the id
    /// safe to use as a directory name.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(PostId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    AnimatedGif,
    ProfileImage,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::AnimatedGif)
    }
}

// --- Content state ---

/// Lifecycle of a tracked post in the content state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Resolved,
    Downloaded,
    Stale,
    Removed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Resolved => "RESOLVED",
            EntryStatus::Downloaded => "DOWNLOADED",
            EntryStatus::Stale => "STALE",
            EntryStatus::Removed => "REMOVED",
            EntryStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_suffixes_classify() {
        assert_eq!(LabelClass::from_kind("X_Total"), Some(LabelClass::Total));
        assert_eq!(LabelClass::from_kind("x_faldon"), Some(LabelClass::Faldon));
        assert_eq!(LabelClass::from_kind("IG_FALDON"), Some(LabelClass::Faldon));
    }

    #[test]
    fn other_kinds_are_rejected() {
        for kind in ["Faldon", "Total", "_Total", "X_Totales", "X_Titulo", "QR", "", "X Y_Total"] {
            assert_eq!(LabelClass::from_kind(kind), None, "{kind} should not classify");
        }
    }

    #[test]
    fn post_id_requires_digits() {
        assert_eq!(PostId::parse(" 1880677589356020087 ").unwrap().as_str(), "1880677589356020087");
        assert!(PostId::parse("").is_none());
        assert!(PostId::parse("12a").is_none());
        assert!(PostId::parse("../etc").is_none());
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&EntryStatus::Downloaded).unwrap();
        assert_eq!(json, "\"DOWNLOADED\"");
    }
}

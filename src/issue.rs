//! The unit of batch work: one newspaper issue in the archive.

use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Date patterns embedded in archive identifiers, most specific first.
#[allow(clippy::expect_used)]
static IDENTIFIER_DATE_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        r"_(\d{4})-(\d{2})-(\d{2})(?:_|$)",
        r"_(\d{4})(\d{2})(\d{2})(?:_|$)",
        r"_(\d{4})_(\d{2})_(\d{2})(?:_|$)",
    ]
    .map(|pattern| Regex::new(pattern).expect("identifier date regex is valid")) // Static pattern, safe to panic
});

/// One newspaper issue, identified by its archive identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<String>,
}

impl Issue {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date: None,
            publication: None,
        }
    }

    #[must_use]
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    #[must_use]
    pub fn with_publication(mut self, publication: impl Into<String>) -> Self {
        self.publication = Some(publication.into());
        self
    }

    /// The explicit date, or one recovered from the identifier.
    #[must_use]
    pub fn effective_date(&self) -> Option<NaiveDate> {
        self.date.or_else(|| date_from_identifier(&self.id))
    }
}

/// Extracts a publication date embedded in an archive identifier.
///
/// Recognizes `_YYYY-MM-DD_`, `_YYYYMMDD_` and `_YYYY_MM_DD_`, in that order.
///
/// ```
/// use chrono::NaiveDate;
/// use storydredge_core::issue::date_from_identifier;
///
/// assert_eq!(
///     date_from_identifier("per_atlanta-constitution_1922-01-01_54_203"),
///     NaiveDate::from_ymd_opt(1922, 1, 1)
/// );
/// assert_eq!(date_from_identifier("no-date-here"), None);
/// ```
#[must_use]
pub fn date_from_identifier(id: &str) -> Option<NaiveDate> {
    IDENTIFIER_DATE_PATTERNS.iter().find_map(|re| {
        let caps = re.captures(id)?;
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// Errors reading an issue list.
#[derive(Debug, Error)]
pub enum IssueListError {
    #[error("failed to read issue list {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON issue list: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListEntry {
    Id(String),
    Full(Issue),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListDocument {
    Bare(Vec<ListEntry>),
    Wrapped { issues: Vec<ListEntry> },
}

/// Parses an issue list.
///
/// Accepts a JSON array (of IDs or issue objects), a JSON object with an
/// `issues` array, or plain text with one ID per line. Blank lines and lines
/// starting with `#` are ignored.
///
/// # Errors
///
/// Returns [`IssueListError::Json`] when the input looks like JSON but is not
/// a supported shape.
pub fn parse_issue_list(text: &str) -> Result<Vec<Issue>, IssueListError> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        let entries = match serde_json::from_str::<ListDocument>(trimmed)? {
            ListDocument::Bare(entries) | ListDocument::Wrapped { issues: entries } => entries,
        };
        return Ok(entries
            .into_iter()
            .map(|entry| match entry {
                ListEntry::Id(id) => Issue::new(id.trim()),
                ListEntry::Full(issue) => issue,
            })
            .filter(|issue| !issue.id.is_empty())
            .collect());
    }

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(Issue::new)
        .collect())
}

/// Reads and parses an issue list file.
///
/// # Errors
///
/// Returns [`IssueListError`] if the file cannot be read or parsed.
pub fn load_issue_list(path: &Path) -> Result<Vec<Issue>, IssueListError> {
    let text = std::fs::read_to_string(path).map_err(|source| IssueListError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_issue_list(&text)
}

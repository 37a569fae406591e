//! Validation and output of finished article records.
//!
//! Records land in `<output>/hsa-ready/YYYY/MM/DD/`, one JSON file per
//! article. File names carry the issue identifier and article index, so two
//! issues never write the same path.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{ClassifiedArticle, IssueContext, Stage, StageError};

/// Directory under the output root that holds formatted records.
pub const RECORDS_DIR: &str = "hsa-ready";

/// Sections a record may be filed under.
pub const VALID_SECTIONS: &[&str] = &[
    "news",
    "sports",
    "business",
    "entertainment",
    "opinion",
    "local",
    "national",
    "international",
    "politics",
    "science",
    "health",
    "technology",
    "education",
    "weather",
    "obituaries",
    "lifestyle",
    "culture",
    "arts",
    "food",
    "travel",
    "other",
];

const MAX_SLUG_CHARS: usize = 50;

/// One output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HsaRecord {
    pub headline: String,
    pub body: String,
    pub tags: Vec<String>,
    pub section: String,
    pub timestamp: String,
    pub publication: String,
    pub source_issue: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byline: Option<String>,
}

impl HsaRecord {
    /// Checks required fields and the section.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), StageError> {
        let required = [
            ("headline", self.headline.as_str()),
            ("body", self.body.as_str()),
            ("section", self.section.as_str()),
            ("timestamp", self.timestamp.as_str()),
            ("publication", self.publication.as_str()),
            ("source_issue", self.source_issue.as_str()),
            ("source_url", self.source_url.as_str()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(StageError::validation(
                Stage::Format,
                format!("{field} is empty"),
            ));
        }
        if self.tags.is_empty() {
            return Err(StageError::validation(Stage::Format, "tags are empty"));
        }
        if !VALID_SECTIONS.contains(&self.section.as_str()) {
            return Err(StageError::validation(
                Stage::Format,
                format!("invalid section {:?}", self.section),
            ));
        }
        Ok(())
    }
}

/// Maps a free-form model category onto a valid section.
///
/// ```
/// use storydredge_core::stages::formatter::section_for_category;
///
/// assert_eq!(section_for_category("Editorial"), "opinion");
/// assert_eq!(section_for_category("high school sports"), "sports");
/// assert_eq!(section_for_category("feature"), "other");
/// ```
#[must_use]
pub fn section_for_category(category: &str) -> &'static str {
    const PARTIAL: &[(&[&str], &str)] = &[
        (&["sport"], "sports"),
        (&["opin", "editor"], "opinion"),
        (&["business", "finance"], "business"),
        (&["entertainment", "movie", "film"], "entertainment"),
        (&["world", "global", "foreign"], "international"),
        (&["tech"], "technology"),
        (&["health", "medical"], "health"),
        (&["edu", "school"], "education"),
        (&["art"], "arts"),
        (&["food", "recipe", "dining"], "food"),
        (&["travel", "vacation", "tourism"], "travel"),
        (&["polit", "election", "government"], "politics"),
        (&["local", "community"], "local"),
        (&["nation"], "national"),
    ];

    let category = category.trim().to_lowercase();
    if let Some(section) = VALID_SECTIONS.iter().find(|s| **s == category) {
        return *section;
    }
    PARTIAL
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| category.contains(n)))
        .map_or("other", |(_, section)| *section)
}

/// Lowercase, dash-separated file stem from a headline.
fn slugify(headline: &str) -> String {
    let mut slug = String::new();
    for c in headline.chars().take(MAX_SLUG_CHARS) {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug.to_string()
    }
}

/// Builds, validates and writes output records.
#[derive(Debug, Clone)]
pub struct HsaFormatter {
    output_root: PathBuf,
    archive_base: String,
    default_publication: Option<String>,
}

impl HsaFormatter {
    #[must_use]
    pub fn new(
        output_root: impl Into<PathBuf>,
        archive_base: &str,
        default_publication: Option<String>,
    ) -> Self {
        Self {
            output_root: output_root.into(),
            archive_base: archive_base.trim_end_matches('/').to_string(),
            default_publication,
        }
    }

    /// Builds the record for one classified article.
    #[must_use]
    pub fn build_record(&self, ctx: &IssueContext, classified: &ClassifiedArticle) -> HsaRecord {
        let issue = &ctx.issue;
        let section = section_for_category(&classified.category).to_string();

        let meta = &classified.metadata;
        let mut tags: BTreeSet<String> = std::iter::once(classified.category.clone())
            .chain(meta.topic.clone())
            .chain(meta.people.iter().cloned())
            .chain(meta.organizations.iter().cloned())
            .chain(meta.locations.iter().cloned())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            tags.insert(section.clone());
        }

        HsaRecord {
            headline: classified.article.headline.clone(),
            body: classified.article.body.clone(),
            tags: tags.into_iter().collect(),
            section,
            timestamp: format_timestamp(self.record_date(ctx)),
            publication: issue
                .publication
                .clone()
                .or_else(|| self.default_publication.clone())
                .unwrap_or_else(|| issue.id.clone()),
            source_issue: issue.id.clone(),
            source_url: format!("{}/details/{}", self.archive_base, issue.id),
            byline: classified.article.byline.clone(),
        }
    }

    fn record_date(&self, ctx: &IssueContext) -> NaiveDate {
        ctx.issue.effective_date().unwrap_or_else(|| {
            warn!(issue_id = %ctx.issue.id, "issue has no date, filing under today");
            Utc::now().date_naive()
        })
    }

    /// Where the record for `classified` is written.
    #[must_use]
    pub fn record_path(&self, ctx: &IssueContext, classified: &ClassifiedArticle) -> PathBuf {
        let date = self.record_date(ctx);
        self.output_root
            .join(RECORDS_DIR)
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join(format!(
                "{}-{}-{:04}.json",
                slugify(&classified.article.headline),
                ctx.issue.id,
                classified.article.index
            ))
    }

    /// Validates and writes the record, returning its path.
    ///
    /// # Errors
    ///
    /// [`StageError::Validation`] for invalid records, [`StageError::Io`] when
    /// the file cannot be written.
    #[instrument(skip_all, fields(issue_id = %ctx.issue.id, article = classified.article.index))]
    pub async fn write(
        &self,
        ctx: &IssueContext,
        classified: &ClassifiedArticle,
    ) -> Result<PathBuf, StageError> {
        let record = self.build_record(ctx, classified);
        record.validate()?;

        let path = self.record_path(ctx, classified);
        write_json(&path, &record).await?;
        debug!(path = %path.display(), "record written");
        Ok(path)
    }
}

/// ISO-8601 midnight timestamp for a publication date.
fn format_timestamp(date: NaiveDate) -> String {
    format!("{}T00:00:00.000Z", date.format("%Y-%m-%d"))
}

/// Writes `value` as pretty JSON, creating parent directories.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StageError::io(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StageError::validation(Stage::Format, format!("unencodable record: {e}")))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| StageError::io(path, e))
}

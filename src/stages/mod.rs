//! The five per-issue stages and the contract the engine drives them through.
//!
//! An issue flows through the stages in a fixed order:
//!
//! 1. [`fetch`](StagePipeline::fetch) raw OCR text from the archive (network, retried)
//! 2. [`clean`](StagePipeline::clean) the OCR noise out of it
//! 3. [`split`](StagePipeline::split) it into articles
//! 4. [`classify`](StagePipeline::classify) each article with the model (network, retried, cached)
//! 5. [`format_and_write`](StagePipeline::format_and_write) each record into the dated output tree
//!
//! [`NewspaperPipeline`] is the production implementation; tests substitute
//! their own.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::issue::Issue;

pub mod archive;
pub mod classifier;
pub mod cleaner;
mod error;
pub mod formatter;
mod newspaper;
pub mod splitter;

pub use archive::{ArchiveFetcher, is_valid_identifier};
pub use classifier::{OllamaClassifier, parse_classification};
pub use cleaner::OcrCleaner;
pub use error::StageError;
pub use formatter::{HsaFormatter, HsaRecord};
pub use newspaper::{NewspaperPipeline, PipelineConfig};
pub use splitter::ArticleSplitter;

/// Name of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Clean,
    Split,
    Classify,
    Format,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Clean,
        Stage::Split,
        Stage::Classify,
        Stage::Format,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Clean => "clean",
            Stage::Split => "split",
            Stage::Classify => "classify",
            Stage::Format => "format",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-issue information handed to every stage call.
#[derive(Debug, Clone)]
pub struct IssueContext {
    pub issue: Issue,
    /// Directory for this issue's diagnostic artifacts. Only this issue writes here.
    pub artifact_dir: PathBuf,
}

impl IssueContext {
    #[must_use]
    pub fn new(issue: Issue, output_dir: &Path) -> Self {
        let artifact_dir = output_dir.join(&issue.id);
        Self {
            issue,
            artifact_dir,
        }
    }

    #[must_use]
    pub fn issue_id(&self) -> &str {
        &self.issue.id
    }
}

/// One article cut from an issue's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// 1-based position within the issue.
    pub index: usize,
    pub headline: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byline: Option<String>,
}

/// Entities and topic the model pulled out of an article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArticleMetadata {
    pub topic: Option<String>,
    pub people: Vec<String>,
    pub organizations: Vec<String>,
    pub locations: Vec<String>,
}

/// An article plus its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedArticle {
    #[serde(flatten)]
    pub article: Article,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: ArticleMetadata,
}

/// The stage contract the engines drive.
///
/// Implementations must be shareable across worker tasks. Artifact writing is
/// the implementation's business; the engine only sequences calls, retries
/// [`fetch`](Self::fetch) and [`classify`](Self::classify), and times each
/// stage.
#[async_trait]
pub trait StagePipeline: Send + Sync {
    /// Retrieves the raw OCR text of the issue.
    async fn fetch(&self, ctx: &IssueContext) -> Result<String, StageError>;

    /// Removes OCR noise.
    async fn clean(&self, ctx: &IssueContext, raw: &str) -> Result<String, StageError>;

    /// Cuts cleaned text into articles.
    async fn split(&self, ctx: &IssueContext, cleaned: &str) -> Result<Vec<Article>, StageError>;

    /// Classifies one article.
    async fn classify(
        &self,
        ctx: &IssueContext,
        article: &Article,
    ) -> Result<ClassifiedArticle, StageError>;

    /// Validates and writes one record, returning where it landed.
    async fn format_and_write(
        &self,
        ctx: &IssueContext,
        classified: &ClassifiedArticle,
    ) -> Result<PathBuf, StageError>;
}

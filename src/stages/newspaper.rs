//! The production pipeline: archive fetch, OCR cleanup, splitting, Ollama
//! classification and record output.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

use super::archive::{ArchiveFetcher, DEFAULT_ARCHIVE_URL, DEFAULT_FETCH_TIMEOUT};
use super::classifier::{DEFAULT_CLASSIFY_TIMEOUT, DEFAULT_MODEL, DEFAULT_MODEL_URL, OllamaClassifier};
use super::formatter::{HsaFormatter, write_json};
use super::{
    Article, ArticleSplitter, ClassifiedArticle, IssueContext, OcrCleaner, Stage, StageError,
    StagePipeline,
};
use crate::cache::ContentCache;
use crate::engine::RateLimiter;

/// Settings for [`NewspaperPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of per-issue artifacts and of the formatted record tree.
    pub output_dir: PathBuf,
    pub archive_url: Url,
    pub model_url: Url,
    pub model: String,
    pub fetch_timeout: Duration,
    pub classify_timeout: Duration,
    /// Where fetched OCR text is kept for reuse; `None` disables reuse.
    pub raw_text_dir: Option<PathBuf>,
    /// Publication name for issues that do not carry one.
    pub default_publication: Option<String>,
    pub splitter: ArticleSplitter,
    /// Write raw/cleaned/article/classified diagnostics per issue.
    pub write_artifacts: bool,
}

impl PipelineConfig {
    /// Defaults pointing at archive.org and a local Ollama.
    ///
    /// # Errors
    ///
    /// Never in practice; the built-in URLs are valid.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, url::ParseError> {
        Ok(Self {
            output_dir: output_dir.into(),
            archive_url: Url::parse(DEFAULT_ARCHIVE_URL)?,
            model_url: Url::parse(DEFAULT_MODEL_URL)?,
            model: DEFAULT_MODEL.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            raw_text_dir: None,
            default_publication: None,
            splitter: ArticleSplitter::default(),
            write_artifacts: true,
        })
    }
}

/// [`StagePipeline`] backed by the archive and a local model.
#[derive(Debug, Clone)]
pub struct NewspaperPipeline {
    fetcher: ArchiveFetcher,
    cleaner: OcrCleaner,
    splitter: ArticleSplitter,
    classifier: OllamaClassifier,
    formatter: HsaFormatter,
    write_artifacts: bool,
}

impl NewspaperPipeline {
    /// Builds the pipeline. `limiter` and `cache` are shared by every worker.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if an HTTP client cannot be built or the model
    /// URL is unusable.
    pub fn new(
        config: PipelineConfig,
        limiter: Arc<RateLimiter>,
        cache: Arc<ContentCache>,
    ) -> Result<Self, StageError> {
        let fetcher = ArchiveFetcher::new(
            config.archive_url.clone(),
            limiter,
            config.fetch_timeout,
            config.raw_text_dir.clone(),
        )?;
        let classifier = OllamaClassifier::new(
            &config.model_url,
            config.model.clone(),
            config.classify_timeout,
            cache,
        )?;
        let formatter = HsaFormatter::new(
            &config.output_dir,
            config.archive_url.as_str(),
            config.default_publication.clone(),
        );
        Ok(Self {
            fetcher,
            cleaner: OcrCleaner,
            splitter: config.splitter,
            classifier,
            formatter,
            write_artifacts: config.write_artifacts,
        })
    }

    async fn write_text_artifact(&self, ctx: &IssueContext, name: &str, text: &str) -> Result<(), StageError> {
        if !self.write_artifacts {
            return Ok(());
        }
        let path = ctx.artifact_dir.join(name);
        ensure_dir(&ctx.artifact_dir).await?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| StageError::io(&path, e))
    }
}

async fn ensure_dir(dir: &Path) -> Result<(), StageError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StageError::io(dir, e))
}

fn article_file(index: usize) -> String {
    format!("article_{index:04}.json")
}

#[async_trait]
impl StagePipeline for NewspaperPipeline {
    async fn fetch(&self, ctx: &IssueContext) -> Result<String, StageError> {
        let raw = self.fetcher.fetch_text(ctx.issue_id()).await?;
        self.write_text_artifact(ctx, "raw.txt", &raw).await?;
        Ok(raw)
    }

    #[instrument(skip_all, fields(issue_id = %ctx.issue_id()))]
    async fn clean(&self, ctx: &IssueContext, raw: &str) -> Result<String, StageError> {
        let cleaned = self.cleaner.clean(raw);
        if cleaned.is_empty() {
            return Err(StageError::validation(
                Stage::Clean,
                "no text left after OCR cleanup",
            ));
        }
        debug!(raw_bytes = raw.len(), cleaned_bytes = cleaned.len(), "cleaned OCR text");
        self.write_text_artifact(ctx, "cleaned.txt", &cleaned).await?;
        Ok(cleaned)
    }

    #[instrument(skip_all, fields(issue_id = %ctx.issue_id()))]
    async fn split(&self, ctx: &IssueContext, cleaned: &str) -> Result<Vec<Article>, StageError> {
        let articles = self.splitter.split(cleaned);
        if articles.is_empty() {
            return Err(StageError::validation(Stage::Split, "no articles found"));
        }
        if self.write_artifacts {
            let dir = ctx.artifact_dir.join("articles");
            ensure_dir(&dir).await?;
            for article in &articles {
                write_json(&dir.join(article_file(article.index)), article).await?;
            }
        }
        Ok(articles)
    }

    async fn classify(
        &self,
        ctx: &IssueContext,
        article: &Article,
    ) -> Result<ClassifiedArticle, StageError> {
        let classified = self.classifier.classify(article).await?;
        if self.write_artifacts {
            let dir = ctx.artifact_dir.join("classified");
            ensure_dir(&dir).await?;
            write_json(&dir.join(article_file(article.index)), &classified).await?;
        }
        Ok(classified)
    }

    async fn format_and_write(
        &self,
        ctx: &IssueContext,
        classified: &ClassifiedArticle,
    ) -> Result<PathBuf, StageError> {
        self.formatter.write(ctx, classified).await
    }
}

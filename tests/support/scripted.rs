//! Scripted [`StagePipeline`] for engine tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use storydredge_core::stages::ArticleMetadata;
use storydredge_core::{Article, ClassifiedArticle, IssueContext, StageError, StagePipeline};

/// Pipeline whose behavior per issue is set up front.
#[derive(Default)]
pub struct ScriptedPipeline {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    unwritable: HashSet<String>,
    fetch_delay: Duration,
    slow: HashMap<String, Duration>,
    interrupt_on_fetch: Option<Arc<AtomicBool>>,
    fetches: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    format_calls: AtomicUsize,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch for `issue_id` always fails with a retryable 503.
    pub fn failing(mut self, issue_id: &str) -> Self {
        self.failing.insert(issue_id.to_string());
        self
    }

    /// Fetch for `issue_id` panics.
    pub fn panicking(mut self, issue_id: &str) -> Self {
        self.panicking.insert(issue_id.to_string());
        self
    }

    /// Writing records for `issue_id` hits a disk error.
    pub fn unwritable(mut self, issue_id: &str) -> Self {
        self.unwritable.insert(issue_id.to_string());
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Fetch for `issue_id` alone takes `delay`.
    pub fn slow(mut self, issue_id: &str, delay: Duration) -> Self {
        self.slow.insert(issue_id.to_string(), delay);
        self
    }

    /// Sets `flag` during the first fetch.
    pub fn interrupting(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt_on_fetch = Some(flag);
        self
    }

    /// Every fetch call, in call order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    /// Fetch calls per issue.
    pub fn fetch_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for id in self.fetches() {
            *counts.entry(id).or_default() += 1;
        }
        counts
    }

    /// Number of format calls across all issues.
    pub fn format_calls(&self) -> usize {
        self.format_calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed running at once.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StagePipeline for ScriptedPipeline {
    async fn fetch(&self, ctx: &IssueContext) -> Result<String, StageError> {
        let id = ctx.issue_id().to_string();
        self.fetches.lock().unwrap().push(id.clone());
        if let Some(flag) = &self.interrupt_on_fetch {
            flag.store(true, Ordering::SeqCst);
        }
        assert!(!self.panicking.contains(&id), "scripted panic for {id}");

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = self.slow.get(&id).copied().unwrap_or(self.fetch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&id) {
            return Err(StageError::http_status("https://archive.test/download", 503));
        }
        Ok(format!("OCR text of {id}"))
    }

    async fn clean(&self, _ctx: &IssueContext, raw: &str) -> Result<String, StageError> {
        Ok(raw.trim().to_string())
    }

    async fn split(&self, _ctx: &IssueContext, cleaned: &str) -> Result<Vec<Article>, StageError> {
        Ok(vec![Article {
            index: 1,
            headline: "FRONT PAGE".to_string(),
            body: cleaned.to_string(),
            byline: None,
        }])
    }

    async fn classify(
        &self,
        _ctx: &IssueContext,
        article: &Article,
    ) -> Result<ClassifiedArticle, StageError> {
        Ok(ClassifiedArticle {
            article: article.clone(),
            category: "news".to_string(),
            confidence: 1.0,
            metadata: ArticleMetadata::default(),
        })
    }

    async fn format_and_write(
        &self,
        ctx: &IssueContext,
        classified: &ClassifiedArticle,
    ) -> Result<PathBuf, StageError> {
        self.format_calls.fetch_add(1, Ordering::SeqCst);
        let path = ctx
            .artifact_dir
            .join(format!("record_{:04}.json", classified.article.index));
        if self.unwritable.contains(ctx.issue_id()) {
            return Err(StageError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            ));
        }
        tokio::fs::create_dir_all(&ctx.artifact_dir)
            .await
            .map_err(|e| StageError::io(&ctx.artifact_dir, e))?;
        tokio::fs::write(&path, &classified.article.body)
            .await
            .map_err(|e| StageError::io(&path, e))?;
        Ok(path)
    }
}

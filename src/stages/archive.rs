//! Fetching raw OCR text for an issue from the archive.
//!
//! Every outbound request passes through the shared [`RateLimiter`]. Fetched
//! text is kept under a raw-text cache directory so a re-run after a crash
//! does not hit the archive again for issues it already downloaded.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{Stage, StageError};
use crate::engine::RateLimiter;
use crate::engine::rate_limiter::parse_retry_after;

/// Default archive base URL.
pub const DEFAULT_ARCHIVE_URL: &str = "https://archive.org";

/// Per-request timeout for archive downloads.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[allow(clippy::expect_used)]
static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][\w\-]{2,}$").expect("identifier regex is valid") // Static pattern, safe to panic
});

/// Whether `id` looks like an archive identifier.
///
/// ```
/// use storydredge_core::stages::is_valid_identifier;
///
/// assert!(is_valid_identifier("per_atlanta-constitution_1922-01-01_54_203"));
/// assert!(!is_valid_identifier("../etc"));
/// assert!(!is_valid_identifier("ab"));
/// ```
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(id)
}

/// HTTP fetcher for archive OCR text.
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: Client,
    base_url: Url,
    limiter: Arc<RateLimiter>,
    /// Where fetched text is kept between runs; `None` disables reuse.
    raw_cache_dir: Option<PathBuf>,
}

impl ArchiveFetcher {
    /// Creates a fetcher against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: Url,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
        raw_cache_dir: Option<PathBuf>,
    ) -> Result<Self, StageError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("storydredge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StageError::network(base_url.as_str(), e))?;
        Ok(Self {
            client,
            base_url,
            limiter,
            raw_cache_dir,
        })
    }

    /// URL of the full-text OCR file for `id`.
    #[must_use]
    pub fn text_url(&self, id: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/download/{id}/{id}_djvu.txt")
    }

    /// Downloads the OCR text for `id`, reusing a previously stored copy.
    ///
    /// # Errors
    ///
    /// - [`StageError::InvalidIdentifier`] for malformed identifiers
    /// - [`StageError::HttpStatus`] for non-success responses (429 also pauses the limiter)
    /// - [`StageError::Timeout`] / [`StageError::Network`] for transport failures
    /// - [`StageError::Validation`] when the archive returns an empty document
    #[instrument(skip(self), fields(issue_id = %id))]
    pub async fn fetch_text(&self, id: &str) -> Result<String, StageError> {
        if !is_valid_identifier(id) {
            return Err(StageError::InvalidIdentifier { id: id.to_string() });
        }

        if let Some(text) = self.read_stored(id).await {
            info!(bytes = text.len(), "using stored OCR text");
            return Ok(text);
        }

        self.limiter.acquire().await;

        let url = self.text_url(id);
        debug!(url = %url, "requesting OCR text");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StageError::network(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            if status.as_u16() == 429 {
                warn!(retry_after_secs = retry_after.map(|d| d.as_secs()), "archive rate limited us");
                if let Some(delay) = retry_after {
                    self.limiter.record_rate_limit(delay).await;
                }
            }
            return Err(StageError::HttpStatus {
                url,
                status: status.as_u16(),
                retry_after,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| StageError::network(&url, e))?;
        if text.trim().is_empty() {
            return Err(StageError::validation(
                Stage::Fetch,
                "archive returned an empty document",
            ));
        }

        self.store(id, &text).await;
        info!(bytes = text.len(), "fetched OCR text");
        Ok(text)
    }

    async fn read_stored(&self, id: &str) -> Option<String> {
        let path = self.raw_cache_dir.as_ref()?.join(format!("{id}.txt"));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }

    /// Best-effort: a failed store only costs a re-download later.
    async fn store(&self, id: &str, text: &str) {
        let Some(dir) = self.raw_cache_dir.as_ref() else {
            return;
        };
        let path = dir.join(format!("{id}.txt"));
        // Only a complete copy ever appears under the final name.
        let tmp = dir.join(format!("{id}.txt.{:08x}.tmp", rand::random::<u32>()));
        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&tmp, text).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            warn!(path = %path.display(), error = %e, "failed to store OCR text");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::engine::FailureType;

    fn fetcher(server: &MockServer, cache: Option<PathBuf>) -> ArchiveFetcher {
        ArchiveFetcher::new(
            Url::parse(&server.uri()).unwrap(),
            Arc::new(RateLimiter::disabled()),
            Duration::from_secs(5),
            cache,
        )
        .unwrap()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("abc"));
        assert!(is_valid_identifier("sn84020558_1901-03-04_ed-1"));
        assert!(!is_valid_identifier("_abc"));
        assert!(!is_valid_identifier("a/b/c"));
        assert!(!is_valid_identifier(""));
    }

    #[tokio::test]
    async fn test_fetch_text_success_and_stores_copy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/issue-1/issue-1_djvu.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("THE NEWS\nbody"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher(&server, Some(dir.path().to_path_buf()));

        assert_eq!(fetcher.fetch_text("issue-1").await.unwrap(), "THE NEWS\nbody");
        // Second call is served from the stored copy; the mock expects one hit.
        assert_eq!(fetcher.fetch_text("issue-1").await.unwrap(), "THE NEWS\nbody");
        assert!(dir.path().join("issue-1.txt").exists());
    }

    #[tokio::test]
    async fn test_fetch_text_stores_without_leftover_temp_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FULL ISSUE TEXT"))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();

        fetcher(&server, Some(dir.path().to_path_buf()))
            .fetch_text("issue-1")
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, ["issue-1.txt"]);
    }

    #[tokio::test]
    async fn test_interrupted_store_is_not_reused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/download/issue-1/issue-1_djvu.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("FULL ISSUE TEXT"))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        // What a write cut short by a crash or timeout leaves behind.
        std::fs::write(dir.path().join("issue-1.txt.0badf00d.tmp"), "FULL IS").unwrap();

        let text = fetcher(&server, Some(dir.path().to_path_buf()))
            .fetch_text("issue-1")
            .await
            .unwrap();

        assert_eq!(text, "FULL ISSUE TEXT");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("issue-1.txt")).unwrap(),
            "FULL ISSUE TEXT"
        );
    }

    #[tokio::test]
    async fn test_fetch_text_rate_limited_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch_text("issue-1").await.unwrap_err();
        assert!(matches!(
            err,
            StageError::HttpStatus {
                status: 429,
                retry_after: Some(d),
                ..
            } if d.is_zero()
        ));
        assert_eq!(err.failure_type(), FailureType::RateLimited);
    }

    #[tokio::test]
    async fn test_fetch_text_not_found_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch_text("issue-1").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_text_empty_body_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("   \n"))
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch_text("issue-1").await.unwrap_err();
        assert!(matches!(err, StageError::Validation { stage: Stage::Fetch, .. }));
    }

    #[tokio::test]
    async fn test_fetch_text_rejects_bad_identifier_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x"))
            .expect(0)
            .mount(&server)
            .await;

        let err = fetcher(&server, None).fetch_text("../x").await.unwrap_err();
        assert!(matches!(err, StageError::InvalidIdentifier { .. }));
    }

    #[test]
    fn test_text_url_tolerates_trailing_slash() {
        let fetcher = ArchiveFetcher::new(
            Url::parse("https://archive.example/").unwrap(),
            Arc::new(RateLimiter::disabled()),
            DEFAULT_FETCH_TIMEOUT,
            None,
        )
        .unwrap();
        assert_eq!(
            fetcher.text_url("abc"),
            "https://archive.example/download/abc/abc_djvu.txt"
        );
    }
}

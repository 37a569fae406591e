//! Article classification through a local Ollama model, fronted by the
//! [`ContentCache`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{Article, ArticleMetadata, ClassifiedArticle, StageError};
use crate::cache::{ContentCache, fingerprint};

/// Default Ollama endpoint.
pub const DEFAULT_MODEL_URL: &str = "http://localhost:11434";

/// Default model name.
pub const DEFAULT_MODEL: &str = "llama2";

/// Per-call timeout for the model.
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// Category used when the model does not name one.
pub const FALLBACK_CATEGORY: &str = "other";

const PROMPT_TEMPLATE: &str = r#"You are an expert newspaper article classifier.

Classify the article below into one of: News, Opinion, Feature, Sports, Business, Entertainment, Other.
Also extract the main topic and the key people, organizations and locations mentioned.

Headline: {headline}

Article:
{body}

Respond with JSON only, shaped exactly like:
{"category": "category_name", "confidence": 0.95, "metadata": {"topic": "main_topic", "people": [], "organizations": [], "locations": []}}"#;

/// The model's verdict on one article, as cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: ArticleMetadata,
}

impl Classification {
    fn normalized(mut self) -> Self {
        self.category = self.category.trim().to_lowercase();
        if self.category.is_empty() {
            self.category = FALLBACK_CATEGORY.to_string();
        }
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Parses the model's text answer.
///
/// The answer must be a single JSON object with at least a `category`; any
/// other shape is a [`StageError::Unparseable`].
///
/// # Errors
///
/// Returns [`StageError::Unparseable`] when the text is not such an object.
pub fn parse_classification(text: &str) -> Result<Classification, StageError> {
    serde_json::from_str::<Classification>(text.trim())
        .map(Classification::normalized)
        .map_err(|e| StageError::unparseable(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Ollama-backed classifier.
#[derive(Debug, Clone)]
pub struct OllamaClassifier {
    client: Client,
    generate_url: Url,
    model: String,
    temperature: f64,
    max_tokens: u32,
    cache: Arc<ContentCache>,
}

impl OllamaClassifier {
    /// Creates a classifier talking to the Ollama server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Validation`] if `base_url` cannot take the API
    /// path, or [`StageError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &Url,
        model: impl Into<String>,
        timeout: Duration,
        cache: Arc<ContentCache>,
    ) -> Result<Self, StageError> {
        let generate_url = base_url.join("api/generate").map_err(|e| {
            StageError::validation(super::Stage::Classify, format!("bad model URL: {e}"))
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::network(base_url.as_str(), e))?;
        Ok(Self {
            client,
            generate_url,
            model: model.into(),
            temperature: 0.1,
            max_tokens: 1000,
            cache,
        })
    }

    #[must_use]
    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Classifies `article`, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Transport, HTTP and unparseable-answer errors from the model call.
    #[instrument(skip_all, fields(article = article.index, headline = %article.headline))]
    pub async fn classify(&self, article: &Article) -> Result<ClassifiedArticle, StageError> {
        let key = fingerprint(&article.body, &article.headline);

        if let Some(payload) = self.cache.get(&key).await {
            match serde_json::from_value::<Classification>(payload) {
                Ok(cached) => {
                    debug!("classification served from cache");
                    return Ok(into_classified(article, cached.normalized()));
                }
                Err(e) => debug!(error = %e, "cached classification has wrong shape, recomputing"),
            }
        }

        let classification = self.call_model(article).await?;

        match serde_json::to_value(&classification) {
            Ok(payload) => {
                if let Err(e) = self.cache.put(&key, &payload).await {
                    warn!(error = %e, "failed to cache classification");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode classification for cache"),
        }

        Ok(into_classified(article, classification))
    }

    async fn call_model(&self, article: &Article) -> Result<Classification, StageError> {
        let prompt = PROMPT_TEMPLATE
            .replace("{headline}", &article.headline)
            .replace("{body}", &article.body);
        let url = self.generate_url.as_str();

        let response = self
            .client
            .post(self.generate_url.clone())
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": self.temperature,
                    "num_predict": self.max_tokens,
                },
            }))
            .send()
            .await
            .map_err(|e| StageError::network(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::http_status(url, status.as_u16()));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| StageError::unparseable(format!("model envelope: {e}")))?;

        parse_classification(&body.response)
    }
}

fn into_classified(article: &Article, classification: Classification) -> ClassifiedArticle {
    ClassifiedArticle {
        article: article.clone(),
        category: classification.category,
        confidence: classification.confidence,
        metadata: classification.metadata,
    }
}

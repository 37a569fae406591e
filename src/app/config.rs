//! Configuration file loading and CLI/file/default merging.
//!
//! Precedence is CLI flag, then config file, then built-in default.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use storydredge_core::DEFAULT_CACHE_TTL;
use storydredge_core::engine::rate_limiter::DEFAULT_MAX_PER_PERIOD;
use storydredge_core::engine::retry::DEFAULT_MAX_ATTEMPTS;
use storydredge_core::engine::{DEFAULT_CHECKPOINT_INTERVAL, MAX_WORKERS};
use storydredge_core::stages::archive::{DEFAULT_ARCHIVE_URL, DEFAULT_FETCH_TIMEOUT};
use storydredge_core::stages::classifier::{
    DEFAULT_CLASSIFY_TIMEOUT, DEFAULT_MODEL, DEFAULT_MODEL_URL,
};
use storydredge_core::stages::splitter::DEFAULT_MIN_ARTICLE_LENGTH;
use url::Url;

use crate::cli::Args;

const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_CHECKPOINT_FILE: &str = "checkpoint.json";
const DEFAULT_CACHE_DIR: &str = "cache";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// TOML-backed file configuration. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub checkpoint_file: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    /// Worker count (same range as CLI).
    pub workers: Option<u8>,
    pub checkpoint_interval: Option<u16>,
    pub max_retries: Option<u8>,
    /// Archive requests per minute; 0 disables limiting.
    pub rate_limit: Option<u32>,
    pub archive_url: Option<String>,
    pub model_url: Option<String>,
    pub model: Option<String>,
    /// Publication name for issues that carry none.
    pub publication: Option<String>,
    pub issue_timeout_secs: Option<u64>,
    pub fetch_timeout_secs: Option<u64>,
    pub classify_timeout_secs: Option<u64>,
    pub cache_ttl_days: Option<u64>,
    pub min_article_length: Option<usize>,
    pub drop_advertisements: Option<bool>,
    /// Write per-issue diagnostic artifacts.
    pub write_artifacts: Option<bool>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(workers) = self.workers
            && !(1..=MAX_WORKERS).contains(&usize::from(workers))
        {
            bail!("Invalid config value for `workers`: {workers}. Expected range: 1..={MAX_WORKERS}");
        }
        if let Some(interval) = self.checkpoint_interval
            && !(1..=1000).contains(&interval)
        {
            bail!(
                "Invalid config value for `checkpoint_interval`: {interval}. Expected range: 1..=1000"
            );
        }
        if let Some(retries) = self.max_retries
            && retries > 10
        {
            bail!("Invalid config value for `max_retries`: {retries}. Expected range: 0..=10");
        }
        if let Some(rate_limit) = self.rate_limit
            && rate_limit > 600
        {
            bail!("Invalid config value for `rate_limit`: {rate_limit}. Expected range: 0..=600");
        }
        for (field, value) in [
            ("archive_url", self.archive_url.as_deref()),
            ("model_url", self.model_url.as_deref()),
        ] {
            if let Some(value) = value {
                Url::parse(value)
                    .with_context(|| format!("Invalid config value for `{field}`: {value:?}"))?;
            }
        }
        validate_timeout_secs("issue_timeout_secs", self.issue_timeout_secs, 86_400)?;
        validate_timeout_secs("fetch_timeout_secs", self.fetch_timeout_secs, 3600)?;
        validate_timeout_secs("classify_timeout_secs", self.classify_timeout_secs, 3600)?;
        if self.cache_ttl_days == Some(0) {
            bail!("Invalid config value for `cache_ttl_days`: 0. Expected at least 1");
        }
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..={max}");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/storydredge/config.toml`
/// 2. `$HOME/.config/storydredge/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("storydredge")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("storydredge")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(FileConfig::default()),
        },
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
    tracing::debug!(path = %path.display(), "config file loaded");
    Ok(config)
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Fully resolved run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    /// `None` when checkpointing is disabled.
    pub checkpoint_file: Option<PathBuf>,
    pub checkpoint_interval: usize,
    /// 1 selects the sequential engine.
    pub workers: usize,
    pub max_retries: u32,
    /// `None` when caching is disabled.
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl: Duration,
    /// Archive requests per minute; 0 disables limiting.
    pub rate_limit: u32,
    pub archive_url: Url,
    pub model_url: Url,
    pub model: String,
    pub publication: Option<String>,
    pub issue_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
    pub fetch_timeout: Duration,
    pub classify_timeout: Duration,
    pub min_article_length: usize,
    pub drop_advertisements: bool,
    pub write_artifacts: bool,
}

impl Settings {
    /// Merges CLI arguments over the file config over built-in defaults.
    pub fn resolve(args: &Args, file: &FileConfig) -> Result<Self> {
        let workers = if args.sequential {
            1
        } else {
            args.workers.or(file.workers).map_or(1, usize::from)
        };

        let checkpoint_file = (!args.disable_checkpointing).then(|| {
            args.checkpoint_file
                .clone()
                .or_else(|| file.checkpoint_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_FILE))
        });

        let cache_dir = (!args.no_cache).then(|| {
            args.cache_dir
                .clone()
                .or_else(|| file.cache_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
        });

        Ok(Self {
            output_dir: args
                .output_dir
                .clone()
                .or_else(|| file.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            checkpoint_file,
            checkpoint_interval: args
                .checkpoint_interval
                .or(file.checkpoint_interval)
                .map_or(DEFAULT_CHECKPOINT_INTERVAL, usize::from),
            workers,
            max_retries: args
                .max_retries
                .or(file.max_retries)
                .map_or(DEFAULT_MAX_ATTEMPTS - 1, u32::from),
            cache_dir,
            cache_ttl: file
                .cache_ttl_days
                .map_or(DEFAULT_CACHE_TTL, |days| Duration::from_secs(days * SECS_PER_DAY)),
            rate_limit: args
                .rate_limit
                .or(file.rate_limit)
                .unwrap_or(DEFAULT_MAX_PER_PERIOD),
            archive_url: resolve_url(
                args.archive_url.as_ref(),
                file.archive_url.as_deref(),
                DEFAULT_ARCHIVE_URL,
            )?,
            model_url: resolve_url(
                args.model_url.as_ref(),
                file.model_url.as_deref(),
                DEFAULT_MODEL_URL,
            )?,
            model: args
                .model
                .clone()
                .or_else(|| file.model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            publication: file.publication.clone(),
            issue_timeout: args
                .issue_timeout
                .or(file.issue_timeout_secs)
                .map(Duration::from_secs),
            deadline: args.deadline.map(Duration::from_secs),
            fetch_timeout: file
                .fetch_timeout_secs
                .map_or(DEFAULT_FETCH_TIMEOUT, Duration::from_secs),
            classify_timeout: file
                .classify_timeout_secs
                .map_or(DEFAULT_CLASSIFY_TIMEOUT, Duration::from_secs),
            min_article_length: file
                .min_article_length
                .unwrap_or(DEFAULT_MIN_ARTICLE_LENGTH),
            drop_advertisements: file.drop_advertisements.unwrap_or(true),
            write_artifacts: file.write_artifacts.unwrap_or(true),
        })
    }

    /// Directory where fetched OCR text is kept for reuse.
    #[must_use]
    pub fn raw_text_dir(&self) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join("raw"))
    }
}

fn resolve_url(cli: Option<&Url>, file: Option<&str>, default: &str) -> Result<Url> {
    if let Some(url) = cli {
        return Ok(url.clone());
    }
    let raw = file.unwrap_or(default);
    Url::parse(raw).with_context(|| format!("Invalid URL {raw:?}"))
}

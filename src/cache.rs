//! File-backed cache of classification results keyed by content fingerprint.
//!
//! Each entry lives in its own `{key}.json` file holding `{key, payload,
//! created_at}`. Expiry is enforced when an entry is read: an entry older than
//! the TTL is reported as absent and its file removed. The cache only saves
//! work; a lost, corrupt or expired entry makes the caller recompute.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default time-to-live for cache entries (30 days).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Number of leading characters of the article text that feed the fingerprint.
pub const FINGERPRINT_PREFIX_CHARS: usize = 1000;

const ENTRY_EXTENSION: &str = "json";

/// Errors raised while writing or sweeping the cache.
///
/// Reads never fail; an unreadable entry is a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache entry {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One persisted cache record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        // Entries stamped in the future (clock skew) count as fresh.
        age.to_std().is_ok_and(|age| age >= ttl)
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries found on disk but past their TTL.
    pub expired: u64,
    pub writes: u64,
}

impl CacheStats {
    /// Hit rate as percentage (0-100).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    writes: AtomicU64,
}

/// Fingerprint-keyed classification cache.
///
/// Safe to share across tasks behind an `Arc`; all state lives on disk except
/// the statistics counters.
#[derive(Debug)]
pub struct ContentCache {
    /// `None` when caching is disabled.
    dir: Option<PathBuf>,
    ttl: Duration,
    counters: CacheCounters,
}

impl ContentCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory cannot be created.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display(), ttl_secs = ttl.as_secs()))]
    pub fn open(dir: impl AsRef<Path>, ttl: Duration) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        debug!("opened content cache");
        Ok(Self {
            dir: Some(dir),
            ttl,
            counters: CacheCounters::default(),
        })
    }

    /// A cache that never hits and never stores.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dir: None,
            ttl: DEFAULT_CACHE_TTL,
            counters: CacheCounters::default(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
        }
    }

    /// Looks up `key`, returning the payload of a fresh entry.
    ///
    /// Missing, unreadable, mismatched and expired entries all return `None`;
    /// expired and unreadable files are removed best-effort.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let dir = self.dir.as_ref()?;
        let path = entry_path(dir, key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "unreadable cache entry, treating as miss");
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == key => entry,
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "corrupt cache entry, discarding");
                remove_quietly(&path).await;
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.is_expired(self.ttl, Utc::now()) {
            debug!(created_at = %entry.created_at, "cache entry expired");
            remove_quietly(&path).await;
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!("cache hit");
        Some(entry.payload)
    }

    /// Stores `payload` under `key`, replacing any previous entry wholesale.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the entry cannot be encoded or written.
    #[instrument(skip(self, payload))]
    pub async fn put(&self, key: &str, payload: &serde_json::Value) -> Result<(), CacheError> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };
        self.write_entry(
            dir,
            &CacheEntry {
                key: key.to_string(),
                payload: payload.clone(),
                created_at: Utc::now(),
            },
        )
        .await
    }

    async fn write_entry(&self, dir: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = entry_path(dir, &entry.key);
        let bytes = serde_json::to_vec(entry).map_err(|source| CacheError::Encode {
            key: entry.key.clone(),
            source,
        })?;

        // Unique temp name: two tasks may refresh the same key at once.
        let tmp = path.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| CacheError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_quietly(&tmp).await;
            return Err(CacheError::io(&path, e));
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "cache entry written");
        Ok(())
    }

    /// Deletes every expired or unreadable entry, returning how many were removed.
    ///
    /// Safe to run while other tasks read and write: a file that vanishes
    /// mid-sweep is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the cache directory cannot be listed.
    #[instrument(skip(self))]
    pub async fn clean_expired(&self) -> Result<usize, CacheError> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(0);
        };

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| CacheError::io(dir, e))?;
        let now = Utc::now();
        let mut removed = 0;

        while let Some(dir_entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::io(dir, e))?
        {
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let stale = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<CacheEntry>(&bytes)
                    .map_or(true, |entry| entry.is_expired(self.ttl, now)),
                Err(_) => continue,
            };
            if stale && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        debug!(removed, "expired cache entries cleaned");
        Ok(removed)
    }
}

/// Computes the cache key for a classification input.
///
/// Hashes the first [`FINGERPRINT_PREFIX_CHARS`] characters of `text` plus
/// `title`, so near-duplicate articles that differ only in their tail share an
/// entry.
///
/// ```
/// use storydredge_core::cache::fingerprint;
///
/// let a = fingerprint("Council meets Tuesday.", "CITY COUNCIL");
/// assert_eq!(a, fingerprint("Council meets Tuesday.", "CITY COUNCIL"));
/// assert_ne!(a, fingerprint("Council meets Tuesday.", "SCHOOL BOARD"));
/// assert_eq!(a.len(), 64);
/// ```
#[must_use]
pub fn fingerprint(text: &str, title: &str) -> String {
    let prefix_end = text
        .char_indices()
        .nth(FINGERPRINT_PREFIX_CHARS)
        .map_or(text.len(), |(idx, _)| idx);

    let mut hasher = Sha256::new();
    hasher.update(text[..prefix_end].as_bytes());
    hasher.update(title.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Maps a key to its entry file, hashing keys that are not filename-safe.
fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let safe = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    let stem = if safe {
        key.to_string()
    } else {
        fingerprint(key, "")
    };
    dir.join(format!("{stem}.{ENTRY_EXTENSION}"))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn open_cache(dir: &TempDir) -> ContentCache {
        ContentCache::open(dir.path().join("cache"), DEFAULT_CACHE_TTL).unwrap()
    }

    async fn write_backdated(cache: &ContentCache, key: &str, age: chrono::Duration) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload: json!({"category": "news"}),
            created_at: Utc::now() - age,
        };
        cache
            .write_entry(cache.dir.as_ref().unwrap(), &entry)
            .await
            .unwrap();
    }

    // ==================== fingerprint Tests ====================

    #[test]
    fn test_fingerprint_ignores_text_beyond_prefix() {
        let base = "a".repeat(FINGERPRINT_PREFIX_CHARS);
        let longer = format!("{base}tail that differs");
        assert_eq!(fingerprint(&base, "T"), fingerprint(&longer, "T"));
    }

    #[test]
    fn test_fingerprint_prefix_counts_characters_not_bytes() {
        let base = "é".repeat(FINGERPRINT_PREFIX_CHARS);
        let longer = format!("{base}ü");
        assert_eq!(fingerprint(&base, ""), fingerprint(&longer, ""));
    }

    #[test]
    fn test_fingerprint_depends_on_text_prefix() {
        assert_ne!(fingerprint("alpha", "T"), fingerprint("beta", "T"));
    }

    #[test]
    fn test_entry_path_hashes_unsafe_keys() {
        let dir = Path::new("/cache");
        assert_eq!(entry_path(dir, "abc123"), dir.join("abc123.json"));
        let hashed = entry_path(dir, "../escape");
        assert_eq!(hashed.parent(), Some(dir));
        assert!(!hashed.to_string_lossy().contains(".."));
    }

    // ==================== get/put Tests ====================

    #[tokio::test]
    async fn test_put_then_get_round_trips_payload() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let payload = json!({"category": "sports", "confidence": 0.9});

        cache.put("k1", &payload).await.unwrap();

        assert_eq!(cache.get("k1").await, Some(payload));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 0,
                expired: 0,
                writes: 1
            }
        );
    }

    #[tokio::test]
    async fn test_get_missing_key_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        assert_eq!(cache.get("absent").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_entry() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);

        cache.put("k", &json!(1)).await.unwrap();
        cache.put("k", &json!(2)).await.unwrap();

        assert_eq!(cache.get("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_evicted() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        write_backdated(&cache, "old", chrono::Duration::days(31)).await;
        let path = dir.path().join("cache").join("old.json");
        assert!(path.exists());

        assert_eq!(cache.get("old").await, None);
        assert!(!path.exists(), "expired entry should be removed on lookup");
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_entry_within_ttl_is_served() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        write_backdated(&cache, "recent", chrono::Duration::days(29)).await;

        assert!(cache.get("recent").await.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        std::fs::write(dir.path().join("cache").join("bad.json"), b"{not json").unwrap();

        assert_eq!(cache.get("bad").await, None);
        cache.put("bad", &json!("fresh")).await.unwrap();
        assert_eq!(cache.get("bad").await, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = ContentCache::disabled();
        cache.put("k", &json!(1)).await.unwrap();

        assert!(!cache.is_enabled());
        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.clean_expired().await.unwrap(), 0);
    }

    // ==================== clean_expired Tests ====================

    #[tokio::test]
    async fn test_clean_expired_removes_only_stale_entries() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        write_backdated(&cache, "stale1", chrono::Duration::days(40)).await;
        write_backdated(&cache, "stale2", chrono::Duration::days(31)).await;
        cache.put("fresh", &json!("keep")).await.unwrap();
        std::fs::write(dir.path().join("cache").join("notes.txt"), b"ignored").unwrap();

        assert_eq!(cache.clean_expired().await.unwrap(), 2);
        assert_eq!(cache.get("fresh").await, Some(json!("keep")));
        assert!(dir.path().join("cache").join("notes.txt").exists());
    }

    #[test]
    fn test_hit_rate_percent() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            expired: 0,
            writes: 1,
        };
        assert!((stats.hit_rate_percent() - 75.0).abs() < f64::EPSILON);
        assert!(CacheStats::default().hit_rate_percent().abs() < f64::EPSILON);
    }
}

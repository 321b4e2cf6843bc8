//! Durable per-feed offer cache + HTTP image fetch utilities for offerwatch.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use offerwatch_core::{CacheEntry, SourceKind};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Version written into new blobs. Older blobs decode as long as their fields still fit.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const CACHE_FILE_SUFFIX: &str = "cache.json.gz";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid feed name `{0}`: use ascii letters, digits, '-' or '_'")]
    InvalidFeed(String),
    #[error("serializing cache blob: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("compressing cache blob: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompressing cache blob: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("deserializing cache blob: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Name of one cache namespace. Doubles as the cache file stem, so it is kept filesystem-safe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedName(String);

impl FeedName {
    pub fn new(name: impl Into<String>) -> Result<Self, CacheError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(CacheError::InvalidFeed(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SourceKind> for FeedName {
    fn from(kind: SourceKind) -> Self {
        Self(kind.as_str().to_string())
    }
}

impl TryFrom<String> for FeedName {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FeedName> for String {
    fn from(value: FeedName) -> Self {
        value.0
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-memory cache for one feed, owned by a single run between `load` and `persist`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheState {
    feed: FeedName,
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheState {
    pub fn empty(feed: FeedName) -> Self {
        Self {
            feed,
            entries: BTreeMap::new(),
        }
    }

    pub fn feed(&self) -> &FeedName {
        &self.feed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.id.clone(), entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        self.entries.remove(id)
    }

    /// Drop entries whose `last_seen` is strictly older than `now - retention`.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            debug!(feed = %self.feed, "retention reaches past the calendar; nothing to evict");
            return 0;
        };
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen >= cutoff);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            info!(feed = %self.feed, evicted, %cutoff, "evicted stale cache entries");
        }
        evicted
    }

    pub fn source_tally(&self) -> BTreeMap<SourceKind, usize> {
        let mut tally = BTreeMap::new();
        for source in self.entries.values().flat_map(|e| e.sources_seen.iter()) {
            *tally.entry(*source).or_default() += 1;
        }
        tally
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheBlob {
    #[serde(default)]
    format_version: u32,
    #[serde(default)]
    feed: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
}

pub fn encode_blob(state: &CacheState) -> Result<Vec<u8>, CacheError> {
    let blob = CacheBlob {
        format_version: CACHE_FORMAT_VERSION,
        feed: Some(state.feed.to_string()),
        entries: state.entries.clone(),
    };
    let json = serde_json::to_vec(&blob).map_err(CacheError::Serialize)?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json).map_err(CacheError::Compress)?;
    encoder.finish().map_err(CacheError::Compress)
}

pub fn decode_blob(feed: FeedName, bytes: &[u8]) -> Result<CacheState, CacheError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(CacheError::Decompress)?;
    let blob: CacheBlob = serde_json::from_slice(&json).map_err(CacheError::Deserialize)?;
    if blob.format_version > CACHE_FORMAT_VERSION {
        debug!(
            feed = %feed,
            format_version = blob.format_version,
            "cache blob written by a newer version; unknown fields are ignored"
        );
    }
    if let Some(stored) = blob.feed.as_deref().filter(|stored| *stored != feed.as_str()) {
        warn!(feed = %feed, stored, "cache blob was written for another feed");
    }
    Ok(CacheState {
        feed,
        entries: blob.entries,
    })
}

#[derive(Debug, Clone)]
pub struct PersistedCache {
    pub path: PathBuf,
    pub entries: usize,
    pub byte_size: usize,
}

/// Directory of compressed cache blobs, one file per feed.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, feed: &FeedName) -> PathBuf {
        self.root.join(format!("{feed}.{CACHE_FILE_SUFFIX}"))
    }

    /// Load the feed's cache. Missing or unreadable blobs yield an empty cache.
    pub async fn load(&self, feed: &FeedName) -> CacheState {
        let path = self.path_for(feed);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(feed = %feed, path = %path.display(), "no cache found; starting empty");
                return CacheState::empty(feed.clone());
            }
            Err(err) => {
                warn!(feed = %feed, path = %path.display(), error = %err, "cache unreadable; starting empty");
                return CacheState::empty(feed.clone());
            }
        };

        match decode_blob(feed.clone(), &bytes) {
            Ok(state) => {
                debug!(feed = %feed, entries = state.len(), "loaded cache");
                state
            }
            Err(err) => {
                warn!(feed = %feed, path = %path.display(), error = %err, "cache corrupt; starting empty");
                CacheState::empty(feed.clone())
            }
        }
    }

    /// Write the whole cache through a temp file + rename so a crash never leaves a torn blob.
    ///
    /// Temp files left behind by an earlier persist of the same feed that never finished
    /// are removed first. The directory is synced after the rename on unix.
    pub async fn persist(&self, state: &CacheState) -> Result<PersistedCache, CacheError> {
        let bytes = encode_blob(state)?;
        let path = self.path_for(&state.feed);

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::io("creating cache directory", &self.root, e))?;
        self.remove_stale_temps(&state.feed).await;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", state.feed, Uuid::new_v4()));
        if let Err(err) = write_new_file(&temp_path, &bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(CacheError::io("replacing cache file", &path, err));
        }
        sync_dir(&self.root).await?;

        debug!(feed = %state.feed, entries = state.len(), bytes = bytes.len(), "persisted cache");
        Ok(PersistedCache {
            path,
            entries: state.len(),
            byte_size: bytes.len(),
        })
    }

    async fn remove_stale_temps(&self, feed: &FeedName) -> usize {
        let prefix = format!(".{feed}.");
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) => {
                debug!(root = %self.root.display(), error = %err, "cannot list cache directory");
                return 0;
            }
        };
        let mut removed = 0;
        while let Ok(Some(item)) = dir.next_entry().await {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".tmp") {
                match fs::remove_file(item.path()).await {
                    Ok(()) => removed += 1,
                    Err(err) => debug!(path = %item.path().display(), error = %err, "stale temp file kept"),
                }
            }
        }
        if removed > 0 {
            info!(feed = %feed, removed, "removed temp files of an unfinished persist");
        }
        removed
    }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), CacheError> {
    let handle = fs::File::open(dir)
        .await
        .map_err(|e| CacheError::io("opening cache directory", dir, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| CacheError::io("syncing cache directory", dir, e))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), CacheError> {
    Ok(())
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| CacheError::io("opening temp cache file", path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::io("writing temp cache file", path, e))?;
    file.flush()
        .await
        .map_err(|e| CacheError::io("flushing temp cache file", path, e))?;
    file.sync_all()
        .await
        .map_err(|e| CacheError::io("syncing temp cache file", path, e))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Sum of every sleep a fully retried fetch goes through.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }

    /// Per-attempt timeout so that every attempt plus its backoff fits inside `budget`.
    /// Falls back to the whole budget when the backoff alone would consume it.
    pub fn attempt_timeout(&self, budget: Duration) -> Duration {
        let attempts = u32::try_from(self.max_retries.saturating_add(1)).unwrap_or(u32::MAX);
        let share = budget.saturating_sub(self.total_delay()) / attempts;
        if share.is_zero() {
            budget
        } else {
            share
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetcher shut down")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Capability to turn an image URL into bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetcher for deployments without network access: every URL reports as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

#[async_trait]
impl ImageFetcher for OfflineFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::Other(format!("offline: not fetching {url}")))
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            let outcome = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    (
                        classify_status(status),
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        },
                    )
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            match outcome {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    debug!(url, attempt, error = %err, "retrying image fetch");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("image_fetch", url);
        self.fetch_bytes(url).instrument(span).await
    }
}

use std::path::PathBuf;
use std::time::Duration;

use offerwatch_storage::{BackoffPolicy, HttpClientConfig};

use crate::matcher::MatchConfig;
use crate::normalize::NormalizerConfig;

/// Longest accepted retention; larger settings are clamped to it.
pub const MAX_RETENTION_DAYS: u64 = 36_500;

/// Tunables of one diff run.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Max Hamming distance (of 256 bits) for two images to count as the same photo.
    pub hash_threshold: u32,
    /// Lenient Jaro-Winkler floor applied to image-driven matches.
    pub title_similarity: f64,
    /// `None` disables eviction.
    pub retention: Option<chrono::Duration>,
    pub fetch_timeout: Duration,
    pub workers: usize,
    pub placeholder_image_suffixes: Vec<String>,
    pub normalizer: NormalizerConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let matching = MatchConfig::default();
        Self {
            hash_threshold: matching.hash_threshold,
            title_similarity: matching.title_similarity,
            retention: Some(chrono::Duration::days(90)),
            fetch_timeout: Duration::from_secs(5),
            workers: 8,
            placeholder_image_suffixes: vec!["nophoto.png".to_string()],
            normalizer: NormalizerConfig::default(),
        }
    }
}

impl DedupConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            hash_threshold: lookup("OFFERWATCH_HASH_THRESHOLD")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.hash_threshold),
            title_similarity: lookup("OFFERWATCH_TITLE_SIMILARITY")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(defaults.title_similarity),
            retention: match parsed("OFFERWATCH_RETENTION_DAYS") {
                Some(0) => None,
                Some(days) => i64::try_from(days.min(MAX_RETENTION_DAYS))
                    .ok()
                    .and_then(chrono::Duration::try_days)
                    .or(defaults.retention),
                None => defaults.retention,
            },
            fetch_timeout: parsed("OFFERWATCH_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            workers: parsed("OFFERWATCH_WORKERS")
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.workers),
            ..defaults
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            hash_threshold: self.hash_threshold,
            title_similarity: self.title_similarity,
        }
    }
}

/// Process-level settings for a watch run: where caches live and how images are fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub cache_dir: PathBuf,
    pub user_agent: String,
    pub dedup: DedupConfig,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            cache_dir: lookup("OFFERWATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            user_agent: lookup("OFFERWATCH_USER_AGENT")
                .unwrap_or_else(|| "offerwatch/0.1".to_string()),
            dedup: DedupConfig::from_lookup(&lookup),
        }
    }

    /// `fetch_timeout` bounds a whole fetch, so each attempt gets a share of it.
    pub fn http_client_config(&self) -> HttpClientConfig {
        let backoff = BackoffPolicy::default();
        HttpClientConfig {
            timeout: backoff.attempt_timeout(self.dedup.fetch_timeout),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.dedup.workers,
            backoff,
        }
    }
}

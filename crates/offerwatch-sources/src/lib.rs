//! Offer source contract, capture-file sources and the `sources.yaml` registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use offerwatch_core::{ImageRef, RawOffer, SourceKind};
use offerwatch_storage::FeedName;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading capture {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing capture {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Anything that can produce a batch of raw offers for one marketplace.
#[async_trait]
pub trait OfferSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn offers(&self) -> Result<Vec<RawOffer>, SourceError>;
}

/// Scraper output as captured on disk: the flat `{name, link, image, price}` export shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOffer {
    #[serde(alias = "title")]
    pub name: String,
    pub link: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl CapturedOffer {
    /// Records without a title or link break the input contract and are dropped.
    pub fn into_raw(self, kind: SourceKind) -> Option<RawOffer> {
        let title = self.name.trim();
        let link = self.link.trim();
        if title.is_empty() || link.is_empty() {
            return None;
        }
        Some(RawOffer {
            source: kind,
            title: title.to_string(),
            link: link.to_string(),
            image_ref: non_blank(self.image).map(ImageRef::Url),
            price_text: non_blank(self.price),
            description: non_blank(self.description),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads a JSON array of [`CapturedOffer`] written by a scraper.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    kind: SourceKind,
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl OfferSource for JsonFileSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn offers(&self) -> Result<Vec<RawOffer>, SourceError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        let captured: Vec<CapturedOffer> =
            serde_json::from_str(&text).map_err(|source| SourceError::Parse {
                path: self.path.clone(),
                source,
            })?;

        let total = captured.len();
        let offers: Vec<RawOffer> = captured
            .into_iter()
            .filter_map(|c| c.into_raw(self.kind))
            .collect();
        if offers.len() < total {
            warn!(
                source = %self.kind,
                dropped = total - offers.len(),
                "dropped captured offers without title or link"
            );
        }
        Ok(offers)
    }
}

/// Pull every source in order. A failing source is logged and contributes nothing.
pub async fn collect_offers(sources: &[Box<dyn OfferSource>]) -> Vec<RawOffer> {
    let mut aggregated = Vec::new();
    for source in sources {
        match source.offers().await {
            Ok(offers) => {
                info!(source = %source.kind(), fetched = offers.len(), "collected offers");
                aggregated.extend(offers);
            }
            Err(err) => warn!(source = %source.kind(), error = %err, "offer source failed; skipping"),
        }
    }
    aggregated
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(skip)]
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub feed: Option<String>,
    pub input: PathBuf,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn feed_name(&self) -> Result<FeedName> {
        match &self.feed {
            Some(feed) => FeedName::new(feed.clone())
                .with_context(|| format!("feed of source {}", self.kind)),
            None => Ok(FeedName::from(self.kind)),
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        registry.base_dir = base_dir.into();
        Ok(registry)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&text, base_dir).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn build_source(&self, config: &SourceConfig) -> Box<dyn OfferSource> {
        let input = if config.input.is_absolute() {
            config.input.clone()
        } else {
            self.base_dir.join(&config.input)
        };
        Box::new(JsonFileSource::new(config.kind, input))
    }

    /// Enabled sources grouped by the feed whose cache they share.
    pub fn feeds(&self) -> Result<BTreeMap<FeedName, Vec<Box<dyn OfferSource>>>> {
        let mut feeds: BTreeMap<FeedName, Vec<Box<dyn OfferSource>>> = BTreeMap::new();
        for config in self.sources.iter().filter(|s| s.enabled) {
            feeds
                .entry(config.feed_name()?)
                .or_default()
                .push(self.build_source(config));
        }
        Ok(feeds)
    }
}

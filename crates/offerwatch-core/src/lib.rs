//! Core domain model for offerwatch: raw offers, comparison keys, fingerprints and cache entries.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marketplace an offer was scraped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pepper,
    Lzx,
    Otomoto,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Pepper, SourceKind::Lzx, SourceKind::Otomoto];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pepper => "pepper",
            SourceKind::Lzx => "lzx",
            SourceKind::Otomoto => "otomoto",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown offer source `{0}`")]
pub struct UnknownSourceKind(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| UnknownSourceKind(s.to_string()))
    }
}

/// Where an offer's image lives: a remote URL or bytes already in hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Url(String),
    Bytes(Vec<u8>),
}

/// One listing as produced by a scraping collaborator. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOffer {
    pub source: SourceKind,
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub image_ref: Option<ImageRef>,
    #[serde(default)]
    pub price_text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RawOffer {
    pub fn new(source: SourceKind, title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            source,
            title: title.into(),
            link: link.into(),
            image_ref: None,
            price_text: None,
            description: None,
        }
    }

    pub fn with_image(mut self, image_ref: ImageRef) -> Self {
        self.image_ref = Some(image_ref);
        self
    }

    pub fn with_price(mut self, price_text: impl Into<String>) -> Self {
        self.price_text = Some(price_text.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn image_url(&self) -> Option<&str> {
        match &self.image_ref {
            Some(ImageRef::Url(url)) => Some(url.as_str()),
            _ => None,
        }
    }
}

/// Canonical textual identity of an offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedKey {
    pub title_key: String,
    #[serde(default)]
    pub price_cents: Option<i64>,
}

impl NormalizedKey {
    /// Unknown prices never conflict; two known prices must be equal.
    pub fn price_compatible(&self, other: &NormalizedKey) -> bool {
        match (self.price_cents, other.price_cents) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    pub fn matches_exactly(&self, other: &NormalizedKey) -> bool {
        self.title_key == other.title_key && self.price_compatible(other)
    }
}

/// Fixed-width 256-bit perceptual hash (16x16 average hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerceptualHash {
    pub words: [u64; 4],
}

impl PerceptualHash {
    pub const BITS: u32 = 256;

    pub fn from_words(words: [u64; 4]) -> Self {
        Self { words }
    }

    /// Build from row-major bits; anything past `BITS` is ignored.
    pub fn from_bits(bits: impl IntoIterator<Item = bool>) -> Self {
        let mut words = [0u64; 4];
        for (index, bit) in bits.into_iter().take(Self::BITS as usize).enumerate() {
            if bit {
                words[index / 64] |= 1u64 << (index % 64);
            }
        }
        Self { words }
    }

    pub fn hamming(&self, other: &PerceptualHash) -> u32 {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Image identity of an offer. `has_image == false` means no usable image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fingerprint {
    #[serde(default)]
    pub perceptual_hash: Option<PerceptualHash>,
    #[serde(default)]
    pub has_image: bool,
}

impl Fingerprint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_hash(hash: PerceptualHash) -> Self {
        Self {
            perceptual_hash: Some(hash),
            has_image: true,
        }
    }

    /// Hamming distance when both sides carry a hash.
    pub fn distance(&self, other: &Fingerprint) -> Option<u32> {
        match (&self.perceptual_hash, &other.perceptual_hash) {
            (Some(a), Some(b)) if self.has_image && other.has_image => Some(a.hamming(b)),
            _ => None,
        }
    }
}

/// Durable record of one distinct real-world offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub key: NormalizedKey,
    #[serde(default)]
    pub fingerprint: Fingerprint,
    pub canonical_offer: RawOffer,
    pub first_seen: DateTime<Utc>,
    #[serde(default)]
    pub sources_seen: BTreeSet<SourceKind>,
    pub last_seen: DateTime<Utc>,
}

impl CacheEntry {
    /// Record another sighting. Only swaps the canonical offer when it lacks an image
    /// and the sighting brings one.
    pub fn absorb(
        &mut self,
        offer: &RawOffer,
        key: &NormalizedKey,
        fingerprint: &Fingerprint,
        seen_at: DateTime<Utc>,
    ) {
        self.sources_seen.insert(offer.source);
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
        if !self.fingerprint.has_image && fingerprint.has_image {
            self.canonical_offer = offer.clone();
            self.fingerprint = *fingerprint;
            if self.key.price_cents.is_none() {
                self.key.price_cents = key.price_cents;
            }
        }
    }

    /// Fold another entry for the same offer into this one.
    pub fn merge(&mut self, other: CacheEntry) {
        self.sources_seen.extend(other.sources_seen.iter().copied());
        if other.first_seen < self.first_seen {
            self.first_seen = other.first_seen;
        }
        if other.last_seen > self.last_seen {
            self.last_seen = other.last_seen;
        }
        if !self.fingerprint.has_image && other.fingerprint.has_image {
            self.canonical_offer = other.canonical_offer;
            self.fingerprint = other.fingerprint;
        }
        if self.key.price_cents.is_none() {
            self.key.price_cents = other.key.price_cents;
        }
    }
}

/// Output record handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifiedOffer {
    pub name: String,
    pub link: String,
    pub image: Option<String>,
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&RawOffer> for NotifiedOffer {
    fn from(offer: &RawOffer) -> Self {
        Self {
            name: offer.title.clone(),
            link: offer.link.clone(),
            image: offer.image_url().map(str::to_string),
            price: offer.price_text.clone(),
            description: offer.description.clone(),
        }
    }
}

//! Perceptual image fingerprints.
//!
//! The hash is a 16x16 average hash: the image is reduced to grayscale, resampled to
//! 16x16 and every cell brighter than the mean sets one bit. Re-encoding, resizing and
//! small overlays move only a handful of cells across the mean, so near-identical
//! photos land within a small Hamming distance while unrelated photos differ in
//! roughly half of the 256 bits.

use std::sync::Arc;
use std::time::Duration;

use image::imageops::FilterType;
use image::DynamicImage;
use offerwatch_core::{Fingerprint, ImageRef, PerceptualHash};
use offerwatch_storage::ImageFetcher;
use tracing::{debug, warn};

/// Side length of the sampling grid; `HASH_SIZE^2` equals `PerceptualHash::BITS`.
pub const HASH_SIZE: u32 = 16;

pub fn average_hash(image: &DynamicImage) -> PerceptualHash {
    let gray = image.to_luma8();
    let small = image::imageops::resize(&gray, HASH_SIZE, HASH_SIZE, FilterType::Lanczos3);
    let pixels: Vec<f64> = small.pixels().map(|p| f64::from(p.0[0])).collect();
    let mean = pixels.iter().sum::<f64>() / pixels.len().max(1) as f64;
    PerceptualHash::from_bits(pixels.iter().map(|p| *p > mean))
}

pub fn hash_image_bytes(bytes: &[u8]) -> Result<PerceptualHash, image::ImageError> {
    let image = image::load_from_memory(bytes)?;
    Ok(average_hash(&image))
}

/// Resolves image references through an injected fetcher and hashes them.
///
/// Never fails: fetch errors, timeouts, placeholders and undecodable bytes all yield
/// [`Fingerprint::none`].
#[derive(Clone)]
pub struct Fingerprinter {
    fetcher: Arc<dyn ImageFetcher>,
    fetch_timeout: Duration,
    placeholder_suffixes: Arc<[String]>,
}

impl Fingerprinter {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        fetch_timeout: Duration,
        placeholder_suffixes: Vec<String>,
    ) -> Self {
        let placeholder_suffixes: Vec<String> = placeholder_suffixes
            .into_iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        Self {
            fetcher,
            fetch_timeout,
            placeholder_suffixes: placeholder_suffixes.into(),
        }
    }

    pub fn is_placeholder(&self, url: &str) -> bool {
        let url = url.trim().to_ascii_lowercase();
        let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
        self.placeholder_suffixes
            .iter()
            .any(|suffix| path.ends_with(suffix.as_str()))
    }

    pub async fn fingerprint(&self, image_ref: Option<ImageRef>) -> Fingerprint {
        let Some(bytes) = self.resolve(image_ref).await else {
            return Fingerprint::none();
        };

        match tokio::task::spawn_blocking(move || hash_image_bytes(&bytes)).await {
            Ok(Ok(hash)) => Fingerprint::from_hash(hash),
            Ok(Err(err)) => {
                debug!(error = %err, "image not decodable; fingerprinting without image");
                Fingerprint::none()
            }
            Err(err) => {
                warn!(error = %err, "image hashing aborted; fingerprinting without image");
                Fingerprint::none()
            }
        }
    }

    async fn resolve(&self, image_ref: Option<ImageRef>) -> Option<Vec<u8>> {
        match image_ref? {
            ImageRef::Bytes(bytes) if bytes.is_empty() => None,
            ImageRef::Bytes(bytes) => Some(bytes),
            ImageRef::Url(url) => {
                if url.trim().is_empty() || self.is_placeholder(&url) {
                    debug!(url = %url, "placeholder image; fingerprinting without image");
                    return None;
                }
                match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch_image(&url)).await {
                    Ok(Ok(bytes)) if !bytes.is_empty() => Some(bytes),
                    Ok(Ok(_)) => {
                        debug!(url = %url, "image fetch returned no bytes");
                        None
                    }
                    Ok(Err(err)) => {
                        debug!(url = %url, error = %err, "image fetch failed");
                        None
                    }
                    Err(_) => {
                        debug!(url = %url, timeout = ?self.fetch_timeout, "image fetch timed out");
                        None
                    }
                }
            }
        }
    }
}

//! Offer identity decisions.
//!
//! Two offers are the same real-world offer when either
//! 1. their normalized titles are equal and their prices do not conflict, or
//! 2. both carry images within `hash_threshold` bits of each other, their titles are at
//!    least `title_similarity` alike (Jaro-Winkler) and their prices do not conflict.
//!
//! An unknown price never conflicts.

use std::cmp::Ordering;

use offerwatch_core::{CacheEntry, Fingerprint, NormalizedKey, PerceptualHash, RawOffer};
use offerwatch_storage::CacheState;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Largest Hamming distance (inclusive) at which two images count as the same photo.
    pub hash_threshold: u32,
    /// Smallest title similarity (inclusive) accepted for an image-driven match.
    pub title_similarity: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            hash_threshold: 25,
            title_similarity: 0.80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactKey,
    Perceptual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchScore {
    pub reason: MatchReason,
    /// `1 - similarity`, zero for exact title matches.
    pub text_distance: f64,
    pub hash_distance: Option<u32>,
}

impl MatchScore {
    pub fn combined(&self) -> f64 {
        let hash = self
            .hash_distance
            .map(|d| f64::from(d) / f64::from(PerceptualHash::BITS))
            .unwrap_or(0.0);
        self.text_distance + hash
    }

    fn rank(&self) -> u8 {
        match self.reason {
            MatchReason::ExactKey => 0,
            MatchReason::Perceptual => 1,
        }
    }
}

/// Ordering of two qualifying entries: exact before perceptual, then lower combined
/// distance, then earlier `first_seen`, then id.
pub fn compare_hits(a: (&MatchScore, &CacheEntry), b: (&MatchScore, &CacheEntry)) -> Ordering {
    a.0.rank()
        .cmp(&b.0.rank())
        .then_with(|| a.0.combined().total_cmp(&b.0.combined()))
        .then_with(|| a.1.first_seen.cmp(&b.1.first_seen))
        .then_with(|| a.1.id.cmp(&b.1.id))
}

/// One offer of a run with its derived identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub offer: RawOffer,
    pub key: NormalizedKey,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome<'a> {
    Matched {
        entry: &'a CacheEntry,
        score: MatchScore,
    },
    New,
}

#[derive(Debug, Clone, Default)]
pub struct DedupMatcher {
    config: MatchConfig,
}

impl DedupMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn compare(
        &self,
        a_key: &NormalizedKey,
        a_fp: &Fingerprint,
        b_key: &NormalizedKey,
        b_fp: &Fingerprint,
    ) -> Option<MatchScore> {
        if a_key.title_key.is_empty() || b_key.title_key.is_empty() {
            return None;
        }
        if !a_key.price_compatible(b_key) {
            return None;
        }

        let hash_distance = a_fp.distance(b_fp);
        if a_key.title_key == b_key.title_key {
            return Some(MatchScore {
                reason: MatchReason::ExactKey,
                text_distance: 0.0,
                hash_distance,
            });
        }

        let distance = hash_distance.filter(|d| *d <= self.config.hash_threshold)?;
        let similarity = jaro_winkler(&a_key.title_key, &b_key.title_key);
        if similarity < self.config.title_similarity {
            return None;
        }
        Some(MatchScore {
            reason: MatchReason::Perceptual,
            text_distance: 1.0 - similarity,
            hash_distance: Some(distance),
        })
    }

    pub fn compare_candidates(&self, a: &Candidate, b: &Candidate) -> Option<MatchScore> {
        self.compare(&a.key, &a.fingerprint, &b.key, &b.fingerprint)
    }

    pub fn match_entry(&self, candidate: &Candidate, entry: &CacheEntry) -> Option<MatchScore> {
        self.compare(&candidate.key, &candidate.fingerprint, &entry.key, &entry.fingerprint)
    }

    /// Every qualifying cache entry for `candidate`, best first.
    pub fn find_all<'a>(
        &self,
        candidate: &Candidate,
        cache: &'a CacheState,
    ) -> Vec<(MatchScore, &'a CacheEntry)> {
        let mut hits: Vec<_> = cache
            .entries()
            .filter_map(|entry| self.match_entry(candidate, entry).map(|score| (score, entry)))
            .collect();
        hits.sort_by(|a, b| compare_hits((&a.0, a.1), (&b.0, b.1)));
        hits
    }

    /// Best qualifying cache entry for `candidate`, or `New`.
    pub fn find_match<'a>(&self, candidate: &Candidate, cache: &'a CacheState) -> MatchOutcome<'a> {
        self.find_all(candidate, cache)
            .into_iter()
            .next()
            .map_or(MatchOutcome::New, |(score, entry)| MatchOutcome::Matched { entry, score })
    }
}

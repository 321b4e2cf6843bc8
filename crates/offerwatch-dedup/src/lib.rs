//! Offer deduplication: normalization, perceptual fingerprints, matching and the
//! incremental diff run that keeps a feed's cache current.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod fingerprint;
pub mod matcher;
pub mod normalize;

pub use cluster::{cluster_candidates, DisjointSet};
pub use config::{DedupConfig, WatchConfig};
pub use engine::{Classification, DiffEngine, MatchedBy, RunError, RunReport, Verdict};
pub use fingerprint::{average_hash, hash_image_bytes, Fingerprinter, HASH_SIZE};
pub use matcher::{Candidate, DedupMatcher, MatchConfig, MatchOutcome, MatchReason, MatchScore};
pub use normalize::{parse_price_cents, Normalizer, NormalizerConfig};

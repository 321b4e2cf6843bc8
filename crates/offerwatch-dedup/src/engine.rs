//! One incremental diff run: normalize, fingerprint, reconcile against the feed's cache,
//! persist once and hand back what was never seen before.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use offerwatch_core::{CacheEntry, Fingerprint, NotifiedOffer, RawOffer};
use offerwatch_storage::{CacheError, CacheState, CacheStore, FeedName, ImageFetcher, PersistedCache};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::cluster::cluster_candidates;
use crate::config::DedupConfig;
use crate::fingerprint::Fingerprinter;
use crate::matcher::{compare_hits, Candidate, DedupMatcher, MatchReason, MatchScore};
use crate::normalize::Normalizer;

#[derive(Debug, Error)]
pub enum RunError {
    /// The run completed but its cache could not be written. The new offers are still
    /// handed back so notification is not blocked.
    #[error("persisting cache for feed {feed} failed ({} new offers unrecorded): {source}", .new_offers.len())]
    Persist {
        feed: FeedName,
        new_offers: Vec<RawOffer>,
        #[source]
        source: CacheError,
    },
}

impl RunError {
    pub fn new_offers(&self) -> &[RawOffer] {
        match self {
            RunError::Persist { new_offers, .. } => new_offers,
        }
    }

    pub fn into_new_offers(self) -> Vec<RawOffer> {
        match self {
            RunError::Persist { new_offers, .. } => new_offers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// Duplicate of an earlier offer of the same run.
    InRun,
    ExactKey,
    Perceptual,
}

impl From<MatchReason> for MatchedBy {
    fn from(reason: MatchReason) -> Self {
        match reason {
            MatchReason::ExactKey => MatchedBy::ExactKey,
            MatchReason::Perceptual => MatchedBy::Perceptual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "by", rename_all = "snake_case")]
pub enum Verdict {
    New,
    Matched(MatchedBy),
}

/// Outcome for the input offer at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub index: usize,
    pub entry_id: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub feed: FeedName,
    pub run_at: DateTime<Utc>,
    pub offers_in: usize,
    pub classifications: Vec<Classification>,
    /// Canonical offers of entries created by this run, in first-seen order.
    pub new_offers: Vec<RawOffer>,
    pub evicted: usize,
    pub cache: PersistedCache,
}

impl RunReport {
    pub fn notified(&self) -> Vec<NotifiedOffer> {
        self.new_offers.iter().map(NotifiedOffer::from).collect()
    }

    pub fn matched(&self) -> usize {
        self.classifications
            .iter()
            .filter(|c| matches!(c.verdict, Verdict::Matched(_)))
            .count()
    }
}

struct Reconciled {
    classifications: Vec<Classification>,
    created: Vec<String>,
}

pub struct DiffEngine {
    config: DedupConfig,
    store: CacheStore,
    normalizer: Normalizer,
    fingerprinter: Fingerprinter,
    matcher: DedupMatcher,
}

impl DiffEngine {
    pub fn new(config: DedupConfig, store: CacheStore, fetcher: Arc<dyn ImageFetcher>) -> Self {
        let normalizer = Normalizer::new(&config.normalizer);
        let fingerprinter = Fingerprinter::new(
            fetcher,
            config.fetch_timeout,
            config.placeholder_image_suffixes.clone(),
        );
        let matcher = DedupMatcher::new(config.match_config());
        Self {
            config,
            store,
            normalizer,
            fingerprinter,
            matcher,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub async fn run(&self, offers: Vec<RawOffer>, feed: &FeedName) -> Result<RunReport, RunError> {
        self.run_at(offers, feed, Utc::now()).await
    }

    /// Run with an explicit clock. Dropping the returned future before it resolves
    /// leaves the stored cache untouched.
    pub async fn run_at(
        &self,
        offers: Vec<RawOffer>,
        feed: &FeedName,
        now: DateTime<Utc>,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("diff_run", %run_id, feed = %feed);
        self.run_inner(run_id, offers, feed, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        offers: Vec<RawOffer>,
        feed: &FeedName,
        now: DateTime<Utc>,
    ) -> Result<RunReport, RunError> {
        let mut state = self.store.load(feed).await;
        let cached_before = state.len();

        let fingerprints = self.fingerprint_all(&offers).await;
        let candidates: Vec<Candidate> = offers
            .into_iter()
            .zip(fingerprints)
            .map(|(offer, fingerprint)| Candidate {
                key: self.normalizer.normalize(&offer),
                offer,
                fingerprint,
            })
            .collect();

        let Reconciled {
            classifications,
            created,
        } = self.reconcile(&mut state, &candidates, now);

        let new_offers: Vec<RawOffer> = created
            .iter()
            .filter_map(|id| state.get(id))
            .map(|entry| entry.canonical_offer.clone())
            .collect();

        let evicted = match self.config.retention {
            Some(retention) => state.evict_older_than(now, retention),
            None => 0,
        };

        let cache = match self.store.persist(&state).await {
            Ok(cache) => cache,
            Err(source) => {
                warn!(error = %source, new = new_offers.len(), "cache persist failed");
                return Err(RunError::Persist {
                    feed: feed.clone(),
                    new_offers,
                    source,
                });
            }
        };

        info!(
            offers_in = candidates.len(),
            new = new_offers.len(),
            cached_before,
            cached_after = state.len(),
            evicted,
            "diff run complete"
        );

        Ok(RunReport {
            run_id,
            feed: feed.clone(),
            run_at: now,
            offers_in: candidates.len(),
            classifications,
            new_offers,
            evicted,
            cache,
        })
    }

    /// Fingerprint every offer on a bounded pool. Results are indexed by input position.
    ///
    /// A task that panics leaves its offer with `Fingerprint::none()`. That offer still goes
    /// through clustering and matching on its key alone, so an exact-key duplicate of a
    /// cached entry is matched as usual and never gets a second entry.
    async fn fingerprint_all(&self, offers: &[RawOffer]) -> Vec<Fingerprint> {
        let mut fingerprints = vec![Fingerprint::none(); offers.len()];
        let limit = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        for (index, offer) in offers.iter().enumerate() {
            let Some(image_ref) = offer.image_ref.clone() else {
                continue;
            };
            let fingerprinter = self.fingerprinter.clone();
            let limit = Arc::clone(&limit);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    (index, fingerprinter.fingerprint(Some(image_ref)).await)
                }
                .instrument(Span::current()),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, fingerprint)) => fingerprints[index] = fingerprint,
                Err(err) => warn!(error = %err, "fingerprint task failed; matching without image"),
            }
        }
        fingerprints
    }

    fn reconcile(&self, state: &mut CacheState, candidates: &[Candidate], now: DateTime<Utc>) -> Reconciled {
        let mut classifications: Vec<Option<Classification>> = vec![None; candidates.len()];
        let mut created: Vec<String> = Vec::new();

        for members in cluster_candidates(candidates, &self.matcher) {
            let hits: Vec<Vec<(String, MatchScore)>> = members
                .iter()
                .map(|&index| {
                    self.matcher
                        .find_all(&candidates[index], state)
                        .into_iter()
                        .map(|(score, entry)| (entry.id.clone(), score))
                        .collect()
                })
                .collect();

            let winner = best_hit(state, &hits);
            let entry_id = match winner {
                Some(winner_id) => {
                    let losers = self.losers_of(state, &winner_id, &hits);
                    for loser in &losers {
                        merge_into(state, &winner_id, loser);
                        created.retain(|id| id != loser);
                        for c in classifications.iter_mut().flatten() {
                            if &c.entry_id == loser {
                                c.entry_id = winner_id.clone();
                                if c.verdict == Verdict::New {
                                    c.verdict = Verdict::Matched(MatchedBy::InRun);
                                }
                            }
                        }
                    }
                    for (&index, member_hits) in members.iter().zip(&hits) {
                        let verdict = match member_hits.first() {
                            Some((_, score)) => Verdict::Matched(score.reason.into()),
                            None => Verdict::Matched(MatchedBy::InRun),
                        };
                        classifications[index] = Some(Classification {
                            index,
                            entry_id: winner_id.clone(),
                            verdict,
                        });
                    }
                    winner_id
                }
                None => {
                    let Some(&first) = members.first() else {
                        continue;
                    };
                    let rep = &candidates[first];
                    let id = entry_id_for(state, rep);
                    state.insert(CacheEntry {
                        id: id.clone(),
                        key: rep.key.clone(),
                        fingerprint: rep.fingerprint,
                        canonical_offer: rep.offer.clone(),
                        first_seen: now,
                        sources_seen: [rep.offer.source].into_iter().collect(),
                        last_seen: now,
                    });
                    created.push(id.clone());
                    for &index in &members {
                        let verdict = if index == first {
                            Verdict::New
                        } else {
                            Verdict::Matched(MatchedBy::InRun)
                        };
                        classifications[index] = Some(Classification {
                            index,
                            entry_id: id.clone(),
                            verdict,
                        });
                    }
                    id
                }
            };

            if let Some(entry) = state.get_mut(&entry_id) {
                for &index in &members {
                    let candidate = &candidates[index];
                    entry.absorb(&candidate.offer, &candidate.key, &candidate.fingerprint, now);
                }
            }
            debug!(entry = %entry_id, members = members.len(), "reconciled cluster");
        }

        Reconciled {
            classifications: classifications.into_iter().flatten().collect(),
            created,
        }
    }

    /// Entries folded into `winner`: every member's best hit, plus any further hit of a
    /// member that is itself a match for the winner. Hits that disagree with the winner
    /// (conflicting known prices, say) stay separate.
    fn losers_of(
        &self,
        state: &CacheState,
        winner: &str,
        hits: &[Vec<(String, MatchScore)>],
    ) -> BTreeSet<String> {
        let Some(survivor) = state.get(winner) else {
            return BTreeSet::new();
        };
        let mut losers = BTreeSet::new();
        for member_hits in hits {
            let mut ranked = member_hits.iter();
            if let Some((best, _)) = ranked.next() {
                losers.insert(best.clone());
            }
            for (id, _) in ranked {
                let agrees = state.get(id).is_some_and(|entry| {
                    self.matcher
                        .compare(&survivor.key, &survivor.fingerprint, &entry.key, &entry.fingerprint)
                        .is_some()
                });
                if agrees {
                    losers.insert(id.clone());
                }
            }
        }
        losers.remove(winner);
        losers
    }

    /// Run an eviction pass on the stored cache. Persists only when something was dropped.
    pub async fn evict(&self, feed: &FeedName, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let Some(retention) = self.config.retention else {
            info!(feed = %feed, "retention disabled; nothing to evict");
            return Ok(0);
        };
        let mut state = self.store.load(feed).await;
        let evicted = state.evict_older_than(now, retention);
        if evicted > 0 {
            self.store.persist(&state).await?;
        }
        Ok(evicted)
    }
}

fn best_hit(state: &CacheState, hits: &[Vec<(String, MatchScore)>]) -> Option<String> {
    hits.iter()
        .flatten()
        .filter_map(|(id, score)| state.get(id).map(|entry| (score, entry)))
        .min_by(|a, b| compare_hits(*a, *b))
        .map(|(_, entry)| entry.id.clone())
}

fn merge_into(state: &mut CacheState, winner: &str, loser: &str) {
    let Some(absorbed) = state.remove(loser) else {
        return;
    };
    match state.get_mut(winner) {
        Some(entry) => {
            debug!(winner, loser, "bridging merge of cache entries");
            entry.merge(absorbed);
        }
        None => {
            state.insert(absorbed);
        }
    }
}

/// SHA-256 over the creation key and link, salted on the rare collision.
fn entry_id_for(state: &CacheState, candidate: &Candidate) -> String {
    let price = candidate
        .key
        .price_cents
        .map(|p| p.to_string())
        .unwrap_or_default();
    let mut salt = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(candidate.key.title_key.as_bytes());
        hasher.update(b"\n");
        hasher.update(price.as_bytes());
        hasher.update(b"\n");
        hasher.update(candidate.offer.link.as_bytes());
        if salt > 0 {
            hasher.update(b"\n");
            hasher.update(salt.to_string().as_bytes());
        }
        let id = hex::encode(hasher.finalize());
        if state.get(&id).is_none() {
            return id;
        }
        salt += 1;
    }
}

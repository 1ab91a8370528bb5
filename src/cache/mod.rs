//! Content-addressed review cache with single-flight coalescing.
//!
//! Maps a request fingerprint to a sealed `DebateSession`. Entries are
//! read-only once stored and expire purely by elapsed time. The cache
//! enforces at-most-one concurrent computation per fingerprint: a request
//! for a fingerprint already being computed attaches to the in-flight slot
//! (a `watch` channel) and receives its eventual result instead of starting
//! a duplicate orchestration.
//!
//! The cache is an explicit service object passed into the engine by
//! reference; tests construct as many independent instances as they need.
//! FAILED sessions are delivered to coalesced waiters but never stored.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::review::{DebateSession, Fingerprint, SessionStatus};

/// Default entry lifetime.
const DEFAULT_TTL_SECS: u64 = 3600;

/// Default capacity bound.
const DEFAULT_MAX_ENTRIES: usize = 256;

/// Configuration for the review cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for stored sessions.
    pub ttl: Duration,
    /// Maximum number of stored sessions; the oldest entry is evicted when
    /// the bound is reached.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }
}

/// Cache statistics for monitoring and tests.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups answered from a stored entry.
    pub hits: u64,
    /// Lookups that started a computation.
    pub misses: u64,
    /// Lookups that attached to an in-flight computation.
    pub coalesced: u64,
    /// Sessions stored.
    pub stores: u64,
    /// Entries removed by TTL or capacity.
    pub evicted: u64,
}

/// A stored, sealed session.
struct ReadyEntry {
    session: Arc<DebateSession>,
    stored_at: Instant,
}

/// One slot per fingerprint: either a stored session or a computation in
/// flight that waiters can attach to.
enum Slot {
    Ready(ReadyEntry),
    InFlight(watch::Receiver<Option<Arc<DebateSession>>>),
}

/// What a lookup decided to do, resolved under the lock.
enum Lookup {
    Hit(Arc<DebateSession>),
    Wait(watch::Receiver<Option<Arc<DebateSession>>>),
    Compute(watch::Sender<Option<Arc<DebateSession>>>),
}

/// Content-addressed store of sealed debate sessions.
pub struct ReviewCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    stats: Mutex<CacheStats>,
    config: CacheConfig,
}

impl ReviewCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            config,
        }
    }

    /// A cache with the default TTL and capacity.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the session for `fingerprint`, computing it at most once.
    ///
    /// With `force_fresh`, the lookup (and coalescing) is skipped but the
    /// freshly computed session still replaces the stored entry.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        force_fresh: bool,
        compute: F,
    ) -> EngineResult<Arc<DebateSession>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DebateSession>,
    {
        if force_fresh {
            tracing::debug!(fingerprint = %fingerprint, "Cache bypassed (force fresh)");
            let session = Arc::new(compute().await);
            if session.status != SessionStatus::Failed {
                self.store(fingerprint, session.clone());
            }
            return Ok(session);
        }

        let lookup = self.lookup(fingerprint);
        match lookup {
            Lookup::Hit(session) => {
                self.stats.lock().expect("stats lock poisoned").hits += 1;
                tracing::debug!(fingerprint = %fingerprint, "Cache hit");
                Ok(session)
            }
            Lookup::Wait(rx) => {
                self.stats.lock().expect("stats lock poisoned").coalesced += 1;
                tracing::debug!(fingerprint = %fingerprint, "Coalescing onto in-flight review");
                wait_for_inflight(rx).await
            }
            Lookup::Compute(tx) => {
                self.stats.lock().expect("stats lock poisoned").misses += 1;
                let session = Arc::new(compute().await);

                // Publish to waiters before touching the slot map so nobody
                // observes an empty, closed channel.
                let _ = tx.send(Some(session.clone()));

                if session.status == SessionStatus::Failed {
                    // A failed run must not be replayed for the TTL window.
                    let mut slots = self.slots.lock().expect("cache lock poisoned");
                    if matches!(slots.get(fingerprint), Some(Slot::InFlight(_))) {
                        slots.remove(fingerprint);
                    }
                } else {
                    self.store(fingerprint, session.clone());
                }
                Ok(session)
            }
        }
    }

    /// Resolves a lookup under the lock: fresh hit, live in-flight slot, or
    /// a newly claimed computation. Expired entries and in-flight slots
    /// whose computation died are treated as vacant.
    fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        match slots.get(fingerprint) {
            Some(Slot::Ready(entry)) if entry.stored_at.elapsed() < self.config.ttl => {
                return Lookup::Hit(entry.session.clone());
            }
            Some(Slot::InFlight(rx)) => {
                let dead = rx.has_changed().is_err() && rx.borrow().is_none();
                if !dead {
                    return Lookup::Wait(rx.clone());
                }
            }
            _ => {}
        }

        let (tx, rx) = watch::channel(None);
        slots.insert(fingerprint.clone(), Slot::InFlight(rx));
        Lookup::Compute(tx)
    }

    /// Stores a sealed session, sweeping expired entries and evicting the
    /// oldest stored entry when the capacity bound is hit.
    fn store(&self, fingerprint: &Fingerprint, session: Arc<DebateSession>) {
        let mut slots = self.slots.lock().expect("cache lock poisoned");
        let mut evicted = 0u64;

        let expired: Vec<Fingerprint> = slots
            .iter()
            .filter(|(_, slot)| match slot {
                Slot::Ready(entry) => entry.stored_at.elapsed() >= self.config.ttl,
                Slot::InFlight(_) => false,
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            slots.remove(&key);
            evicted += 1;
        }

        // Capacity bounds stored sessions; replacing this key's own entry
        // (or its in-flight slot) does not grow the store.
        let replacing_ready = matches!(slots.get(fingerprint), Some(Slot::Ready(_)));
        let ready_count = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count();
        if !replacing_ready && ready_count >= self.config.max_entries {
            let oldest = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) => Some((key.clone(), entry.stored_at)),
                    Slot::InFlight(_) => None,
                })
                .min_by_key(|(_, stored_at)| *stored_at)
                .map(|(key, _)| key);
            if let Some(key) = oldest {
                slots.remove(&key);
                evicted += 1;
            }
        }

        slots.insert(
            fingerprint.clone(),
            Slot::Ready(ReadyEntry {
                session,
                stored_at: Instant::now(),
            }),
        );

        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.stores += 1;
        stats.evicted += evicted;
    }

    /// Whether a fresh entry exists for `fingerprint`.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let slots = self.slots.lock().expect("cache lock poisoned");
        matches!(
            slots.get(fingerprint),
            Some(Slot::Ready(entry)) if entry.stored_at.elapsed() < self.config.ttl
        )
    }

    /// Number of slots (stored and in-flight).
    pub fn len(&self) -> usize {
        self.slots.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Explicit teardown: drops every stored entry. Statistics survive.
    pub fn clear(&self) {
        self.slots.lock().expect("cache lock poisoned").clear();
    }
}

/// Waits on an in-flight slot until its session is published.
async fn wait_for_inflight(
    mut rx: watch::Receiver<Option<Arc<DebateSession>>>,
) -> EngineResult<Arc<DebateSession>> {
    loop {
        if let Some(session) = rx.borrow().clone() {
            return Ok(session);
        }
        if rx.changed().await.is_err() {
            // Sender dropped; one last look in case the value landed first.
            return rx.borrow().clone().ok_or(EngineError::InFlightFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{ReviewMode, Round};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn fingerprint(tag: &str) -> Fingerprint {
        Fingerprint::compute(tag, "", &["security".into()], ReviewMode::Quick)
    }

    fn session(fingerprint: Fingerprint, status: SessionStatus) -> DebateSession {
        DebateSession {
            id: Uuid::new_v4(),
            fingerprint,
            source: "code".into(),
            context: String::new(),
            personas: vec!["security".into()],
            mode: ReviewMode::Quick,
            rounds: vec![Round {
                number: 1,
                reviews: Vec::new(),
            }],
            votes: Vec::new(),
            consensus: None,
            status,
            failure: None,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn second_lookup_is_a_hit_with_no_recompute() {
        let cache = ReviewCache::with_defaults();
        let fp = fingerprint("a");
        let computes = AtomicUsize::new(0);

        let first = cache
            .get_or_compute(&fp, false, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("computes");

        let second = cache
            .get_or_compute(&fp, false, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("cached");

        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stores, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_lookups_coalesce_into_one_computation() {
        let cache = Arc::new(ReviewCache::with_defaults());
        let fp = fingerprint("a");
        let computes = Arc::new(AtomicUsize::new(0));

        let run = |cache: Arc<ReviewCache>, fp: Fingerprint, computes: Arc<AtomicUsize>| async move {
            cache
                .get_or_compute(&fp, false, || async {
                    computes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    session(fp.clone(), SessionStatus::Complete)
                })
                .await
                .expect("session")
        };

        let (a, b, c) = tokio::join!(
            run(cache.clone(), fp.clone(), computes.clone()),
            run(cache.clone(), fp.clone(), computes.clone()),
            run(cache.clone(), fp.clone(), computes.clone()),
        );

        assert_eq!(computes.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_ttl() {
        let cache = ReviewCache::new(CacheConfig::new(Duration::from_secs(60)));
        let fp = fingerprint("a");
        let computes = AtomicUsize::new(0);

        let compute = || async {
            computes.fetch_add(1, Ordering::SeqCst);
            session(fp.clone(), SessionStatus::Complete)
        };

        cache.get_or_compute(&fp, false, compute).await.expect("first");
        assert!(cache.contains(&fp));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!cache.contains(&fp));

        let compute = || async {
            computes.fetch_add(1, Ordering::SeqCst);
            session(fp.clone(), SessionStatus::Complete)
        };
        cache.get_or_compute(&fp, false, compute).await.expect("recompute");
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_sessions_are_returned_but_never_stored() {
        let cache = ReviewCache::with_defaults();
        let fp = fingerprint("a");
        let computes = AtomicUsize::new(0);

        let result = cache
            .get_or_compute(&fp, false, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                session(fp.clone(), SessionStatus::Failed)
            })
            .await
            .expect("failed session still returned");
        assert_eq!(result.status, SessionStatus::Failed);
        assert!(!cache.contains(&fp));

        cache
            .get_or_compute(&fp, false, || async {
                computes.fetch_add(1, Ordering::SeqCst);
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("recomputes after failure");
        assert_eq!(computes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_fresh_skips_lookup_but_updates_the_entry() {
        let cache = ReviewCache::with_defaults();
        let fp = fingerprint("a");

        let first = cache
            .get_or_compute(&fp, false, || async {
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("first");

        let fresh = cache
            .get_or_compute(&fp, true, || async {
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("fresh");
        assert!(!Arc::ptr_eq(&first, &fresh));

        // The forced result replaced the stored entry.
        let cached = cache
            .get_or_compute(&fp, false, || async {
                panic!("must not recompute");
            })
            .await
            .expect("cached");
        assert!(Arc::ptr_eq(&fresh, &cached));
    }

    #[tokio::test]
    async fn capacity_bound_evicts_the_oldest_entry() {
        let cache = ReviewCache::new(CacheConfig::default().with_max_entries(2));

        for tag in ["a", "b", "c"] {
            let fp = fingerprint(tag);
            cache
                .get_or_compute(&fp, false, || async {
                    session(fp.clone(), SessionStatus::Complete)
                })
                .await
                .expect("stored");
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&fingerprint("a")));
        assert!(cache.contains(&fingerprint("c")));
        assert_eq!(cache.stats().evicted, 1);
    }

    #[tokio::test]
    async fn clear_drops_entries_but_keeps_stats() {
        let cache = ReviewCache::with_defaults();
        let fp = fingerprint("a");
        cache
            .get_or_compute(&fp, false, || async {
                session(fp.clone(), SessionStatus::Complete)
            })
            .await
            .expect("stored");

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().stores, 1);
    }

    #[tokio::test]
    async fn partial_sessions_are_cached() {
        let cache = ReviewCache::with_defaults();
        let fp = fingerprint("a");
        cache
            .get_or_compute(&fp, false, || async {
                session(fp.clone(), SessionStatus::Partial)
            })
            .await
            .expect("stored");
        assert!(cache.contains(&fp));
    }
}

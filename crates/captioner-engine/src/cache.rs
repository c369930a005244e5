//! In-memory result cache with a single-flight gate.
//!
//! Completed entries live in a map keyed by fingerprint. Computations in
//! progress live in a separate flight map holding one `watch` slot per
//! fingerprint: the first caller to [`ResultCache::reserve`] gets a
//! [`Lease`] and does the work, everyone else gets a [`Waiter`] on the same
//! slot. A slot is removed the moment its result is published, or when the
//! lease is dropped without publishing.

use crate::error::PipelineError;
use captioner_core::{CacheEntry, Fingerprint};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::watch;

type Slot = Option<Result<CacheEntry, PipelineError>>;

/// Two different results were produced for one fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cache consistency violated for {fingerprint}: conflicting entry")]
pub struct CacheConsistencyError {
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    flights: Mutex<HashMap<Fingerprint, watch::Receiver<Slot>>>,
}

/// Outcome of [`ResultCache::reserve`].
#[derive(Debug)]
pub enum Reservation {
    /// The caller owns the computation for this fingerprint.
    Leader(Lease),
    /// Another caller is already computing it.
    InFlight(Waiter),
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the cache from persisted entries. The first entry per fingerprint wins.
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut map = HashMap::new();
        for entry in entries {
            map.entry(entry.fingerprint).or_insert(entry);
        }
        Self {
            entries: RwLock::new(map),
            flights: Mutex::default(),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.read_entries().get(fingerprint).cloned()
    }

    /// Would `entry` be accepted by [`put`](Self::put)?
    pub fn check(&self, entry: &CacheEntry) -> Result<(), CacheConsistencyError> {
        Self::admit(&self.read_entries(), entry)
    }

    /// Insert `entry`. Inserting the same content twice is a no-op.
    pub fn put(&self, entry: CacheEntry) -> Result<(), CacheConsistencyError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Self::admit(&entries, &entry)?;
        entries.entry(entry.fingerprint).or_insert(entry);
        Ok(())
    }

    /// Claim the computation for `fingerprint`, or join the one in progress.
    pub fn reserve(self: &Arc<Self>, fingerprint: Fingerprint) -> Reservation {
        let mut flights = self.lock_flights();
        if let Some(rx) = flights.get(&fingerprint) {
            return Reservation::InFlight(Waiter { rx: rx.clone() });
        }

        let (tx, rx) = watch::channel(None);
        flights.insert(fingerprint, rx);
        Reservation::Leader(Lease {
            fingerprint,
            tx: Some(tx),
            cache: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Fingerprints currently being computed.
    pub fn in_flight(&self) -> usize {
        self.lock_flights().len()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.read_entries().values().cloned().collect()
    }

    fn admit(
        entries: &HashMap<Fingerprint, CacheEntry>,
        entry: &CacheEntry,
    ) -> Result<(), CacheConsistencyError> {
        let conflict = !entry.is_coherent()
            || entries
                .get(&entry.fingerprint)
                .is_some_and(|existing| !existing.same_content(entry));
        if conflict {
            return Err(CacheConsistencyError {
                fingerprint: entry.fingerprint,
            });
        }
        Ok(())
    }

    fn release(&self, fingerprint: &Fingerprint) {
        self.lock_flights().remove(fingerprint);
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_flights(&self) -> MutexGuard<'_, HashMap<Fingerprint, watch::Receiver<Slot>>> {
        self.flights.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive right to compute one fingerprint.
///
/// Dropping a lease without calling [`complete`](Self::complete) frees the
/// slot and wakes every waiter with [`PipelineError::Aborted`].
#[derive(Debug)]
pub struct Lease {
    fingerprint: Fingerprint,
    tx: Option<watch::Sender<Slot>>,
    cache: Arc<ResultCache>,
}

impl Lease {
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Publish the result to all waiters and free the slot.
    pub fn complete(mut self, result: Result<CacheEntry, PipelineError>) {
        self.cache.release(&self.fingerprint);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(fingerprint = %self.fingerprint, "lease dropped without a result");
            self.cache.release(&self.fingerprint);
        }
    }
}

/// Handle on another caller's computation.
#[derive(Debug)]
pub struct Waiter {
    rx: watch::Receiver<Slot>,
}

impl Waiter {
    /// Wait for the leader's result. Dropping the future abandons only this wait.
    pub async fn wait(mut self) -> Result<CacheEntry, PipelineError> {
        let published = match self.rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        published.unwrap_or(Err(PipelineError::Aborted))
    }
}

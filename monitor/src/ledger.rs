//! Per-server bookkeeping for a fleet-wide rollout
//!
//! Entries exist only while a rollout is in progress. Every counter is atomic
//! so the parallel parts of a sweep can touch the ledger without locking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Marks "never announced"
const NEVER: i64 = i64::MIN;

#[derive(Debug)]
pub struct UpdateResult {
    attempts: AtomicU32,
    /// Unix seconds of the last player warning
    last_announce: AtomicI64,
}

impl Default for UpdateResult {
    fn default() -> Self {
        Self {
            attempts: AtomicU32::new(0),
            last_announce: AtomicI64::new(NEVER),
        }
    }
}

impl UpdateResult {
    /// Returns the new attempt count
    pub fn increment_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_announce(&self) -> Option<DateTime<Utc>> {
        match self.last_announce.load(Ordering::SeqCst) {
            NEVER => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    /// Claims the right to warn players if the last warning is older than `throttle`
    ///
    /// The timestamp is swapped in atomically, so of several concurrent callers
    /// at most one gets `true`.
    pub fn try_claim_announce(&self, now: DateTime<Utc>, throttle: Duration) -> bool {
        let now_secs = now.timestamp();
        let throttle_secs = i64::try_from(throttle.as_secs()).unwrap_or(i64::MAX);
        let previous = self.last_announce.load(Ordering::SeqCst);

        if previous != NEVER && now_secs.saturating_sub(previous) < throttle_secs {
            return false;
        }
        self.last_announce
            .compare_exchange(previous, now_secs, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Default)]
pub struct UpdateLedger {
    results: DashMap<SocketAddr, Arc<UpdateResult>>,
    /// Set between the first entry of a rollout and the next `clear`
    active: AtomicBool,
}

impl UpdateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute_if_absent(&self, address: SocketAddr) -> Arc<UpdateResult> {
        Arc::clone(self.results.entry(address).or_default().value())
    }

    /// True for exactly one caller per rollout
    pub fn begin_rollout(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Addresses whose attempt count reached `threshold`, sorted
    pub fn get_slow_updates(&self, threshold: u32) -> Vec<SocketAddr> {
        let mut slow: Vec<SocketAddr> = self
            .results
            .iter()
            .filter(|entry| entry.value().attempts() >= threshold)
            .map(|entry| *entry.key())
            .collect();
        slow.sort();
        slow
    }

    /// Attempt counts at this instant
    pub fn duplicate(&self) -> HashMap<SocketAddr, u32> {
        self.results
            .iter()
            .map(|entry| (*entry.key(), entry.value().attempts()))
            .collect()
    }

    pub fn attempts(&self, address: &SocketAddr) -> Option<u32> {
        self.results.get(address).map(|entry| entry.value().attempts())
    }

    pub fn clear(&self) {
        self.results.clear();
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

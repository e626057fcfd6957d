use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackoffConfig;

/// Unique identifier for one acquisition of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LeaseState {
    /// A worker is processing the key.
    Held,
    /// Processing finished; the key stays taken until it expires.
    Completed,
}

/// Lease on a deduplication key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyLease {
    pub key: String,
    pub lease_id: LeaseId,
    pub state: LeaseState,
    pub expires_at: DateTime<Utc>,
}

impl KeyLease {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            lease_id: LeaseId::new(),
            state: LeaseState::Held,
            expires_at: expiry(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

pub(crate) fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// "Run once per key" primitive backing event deduplication.
///
/// `try_acquire` succeeds only when the key is free or its previous lease
/// has expired. A completed key stays taken for `ttl`, so redelivery of
/// the same event inside that window is skipped. `release` frees a key
/// whose processing failed so a retry can take it again.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LeaseId>>;

    async fn complete(&self, key: &str, lease_id: LeaseId, ttl: Duration) -> anyhow::Result<()>;

    async fn release(&self, key: &str, lease_id: LeaseId) -> anyhow::Result<()>;

    /// Drop expired entries; returns how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<u64>;
}

/// Acquisitions between sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 256;

/// Process-local lease store.
///
/// Expired entries are swept every `purge_interval` acquisitions, so the
/// table stays bounded by the keys seen within one lease ttl.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, KeyLease>>,
    acquisitions: AtomicU64,
    purge_interval: u64,
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            acquisitions: AtomicU64::new(0),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    pub fn with_purge_interval(mut self, interval: u64) -> Self {
        self.purge_interval = interval.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(leases: &mut HashMap<String, KeyLease>) -> u64 {
    let before = leases.len();
    leases.retain(|_, lease| !lease.is_expired());
    (before - leases.len()) as u64
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LeaseId>> {
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|lease| !lease.is_expired()) {
            return Ok(None);
        }
        let lease = KeyLease::new(key, ttl);
        let lease_id = lease.lease_id;
        leases.insert(key.to_string(), lease);

        let count = self.acquisitions.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.purge_interval == 0 {
            let purged = sweep(&mut leases);
            if purged > 0 {
                tracing::debug!(purged, remaining = leases.len(), "expired event leases swept");
            }
        }
        Ok(Some(lease_id))
    }

    async fn complete(&self, key: &str, lease_id: LeaseId, ttl: Duration) -> anyhow::Result<()> {
        let mut leases = self.leases.lock();
        match leases.get_mut(key) {
            Some(lease) if lease.lease_id == lease_id => {
                lease.state = LeaseState::Completed;
                lease.expires_at = expiry(ttl);
                Ok(())
            }
            _ => Err(not_held(key, lease_id)),
        }
    }

    async fn release(&self, key: &str, lease_id: LeaseId) -> anyhow::Result<()> {
        let mut leases = self.leases.lock();
        if !leases.get(key).is_some_and(|lease| lease.lease_id == lease_id) {
            return Err(not_held(key, lease_id));
        }
        leases.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> anyhow::Result<u64> {
        Ok(sweep(&mut self.leases.lock()))
    }
}

pub(crate) fn not_held(key: &str, lease_id: LeaseId) -> anyhow::Error {
    anyhow::anyhow!("lease {lease_id} for {key} is no longer held")
}

/// Exponential backoff delay for the `attempt`-th consecutive failure.
///
/// Formula: delay = min(base_delay * 2^(attempt-1), max_delay)
pub fn compute_backoff_delay(attempt: u32, config: &BackoffConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = attempt.saturating_sub(1).min(62) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(config.max_delay_ms as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Whether a task that has been tried `attempts` times should be dropped.
pub fn should_give_up(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}

//! Connection counters
//!
//! Plain atomics updated from connection tasks. An external collector reads
//! [`StatsSnapshot`] through the control endpoint or the logs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::RejectReason;

pub struct ServerStats {
    started_at: DateTime<Utc>,
    accepted: AtomicU64,
    active: AtomicU64,
    rejected: [AtomicU64; RejectReason::ALL.len()],
    /// Routed connections per backend address
    routed: DashMap<String, u64>,
    bytes_to_backend: AtomicU64,
    bytes_to_client: AtomicU64,
    forcibly_closed: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub accepted: u64,
    pub active: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub routed: BTreeMap<String, u64>,
    pub bytes_to_backend: u64,
    pub bytes_to_client: u64,
    pub forcibly_closed: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            accepted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            routed: DashMap::new(),
            bytes_to_backend: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            forcibly_closed: AtomicU64::new(0),
        }
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reject(&self, reason: RejectReason) {
        self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self, backend: &str) {
        *self.routed.entry(backend.to_string()).or_insert(0) += 1;
    }

    pub fn add_bytes_to_backend(&self, bytes: u64) {
        self.bytes_to_backend.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_to_client(&self, bytes: u64) {
        self.bytes_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_forced_close(&self) {
        self.forcibly_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a connection as active until the guard is dropped
    pub fn track_active(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            stats: self.clone(),
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected[reason.index()].load(Ordering::Relaxed)
    }

    pub fn routed(&self, backend: &str) -> u64 {
        self.routed.get(backend).map(|count| *count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            accepted: self.accepted(),
            active: self.active(),
            rejected: RejectReason::ALL
                .iter()
                .map(|reason| (reason.as_str(), self.rejected(*reason)))
                .collect(),
            routed: self
                .routed
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            forcibly_closed: self.forcibly_closed.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active gauge on drop
pub struct ActiveGuard {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

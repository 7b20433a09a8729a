//! Backend health registry
//!
//! Written by health-check tasks, read by every connection. Backends that
//! were never checked count as healthy.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;

/// Last known state of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub consecutive_failures: u32,
}

/// Concurrent map of backend address -> health
#[derive(Debug, Default)]
pub struct BackendHealth {
    states: DashMap<String, HealthState>,
}

impl BackendHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self, address: &str) -> bool {
        self.states
            .get(address)
            .map(|state| state.healthy)
            .unwrap_or(true)
    }

    /// Record a check result. Returns the new status if it changed.
    pub fn record(&self, address: &str, healthy: bool) -> Option<bool> {
        let now = Utc::now();
        let mut entry = self
            .states
            .entry(address.to_string())
            .or_insert_with(|| HealthState {
                healthy: true,
                last_checked: now,
                consecutive_failures: 0,
            });

        let changed = entry.healthy != healthy;
        entry.healthy = healthy;
        entry.last_checked = now;
        entry.consecutive_failures = if healthy {
            0
        } else {
            entry.consecutive_failures.saturating_add(1)
        };

        changed.then_some(healthy)
    }

    pub fn get(&self, address: &str) -> Option<HealthState> {
        self.states.get(address).map(|state| state.value().clone())
    }

    /// Drop state for backends no longer checked
    pub fn retain(&self, addresses: &HashSet<String>) {
        self.states.retain(|address, _| addresses.contains(address));
    }

    pub fn snapshot(&self) -> Vec<(String, HealthState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_is_healthy() {
        let health = BackendHealth::new();
        assert!(health.is_healthy("127.0.0.1:9001"));
        assert!(health.get("127.0.0.1:9001").is_none());
    }

    #[test]
    fn test_transitions() {
        let health = BackendHealth::new();

        assert_eq!(health.record("127.0.0.1:9001", true), None);
        assert_eq!(health.record("127.0.0.1:9001", false), Some(false));
        assert_eq!(health.record("127.0.0.1:9001", false), None);
        assert!(!health.is_healthy("127.0.0.1:9001"));
        assert_eq!(
            health.get("127.0.0.1:9001").unwrap().consecutive_failures,
            2
        );

        assert_eq!(health.record("127.0.0.1:9001", true), Some(true));
        assert_eq!(
            health.get("127.0.0.1:9001").unwrap().consecutive_failures,
            0
        );
    }

    #[test]
    fn test_retain() {
        let health = BackendHealth::new();
        health.record("127.0.0.1:9001", false);
        health.record("127.0.0.1:9002", false);

        let keep: HashSet<String> = ["127.0.0.1:9002".to_string()].into_iter().collect();
        health.retain(&keep);

        assert!(health.is_healthy("127.0.0.1:9001"));
        assert!(!health.is_healthy("127.0.0.1:9002"));
        assert_eq!(health.snapshot().len(), 1);
    }
}

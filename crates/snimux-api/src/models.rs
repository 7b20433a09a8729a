//! Response bodies for the control endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snimux_router::{Backend, BackendHealth, ProxyProtocol, RoutePattern};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Connections currently being inspected or proxied
    pub active_connections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    Exact,
    Wildcard,
    Default,
}

/// One entry of the active route table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Hostname, `*.domain`, or `default`
    pub pattern: String,
    pub kind: RouteKind,
    pub backend: String,
    pub proxy_protocol: ProxyProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check_interval_secs: Option<u64>,
    /// False only after a failed health check
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl RouteInfo {
    pub fn new(pattern: &RoutePattern, backend: &Backend, health: &BackendHealth) -> Self {
        let kind = match pattern {
            RoutePattern::Exact(_) => RouteKind::Exact,
            RoutePattern::Wildcard(_) => RouteKind::Wildcard,
        };
        Self::build(pattern.to_string(), kind, backend, health)
    }

    pub fn default_route(backend: &Backend, health: &BackendHealth) -> Self {
        Self::build("default".to_string(), RouteKind::Default, backend, health)
    }

    fn build(pattern: String, kind: RouteKind, backend: &Backend, health: &BackendHealth) -> Self {
        let state = health.get(&backend.address);
        Self {
            pattern,
            kind,
            backend: backend.address.clone(),
            proxy_protocol: backend.proxy_protocol,
            health_check_interval_secs: backend.health_check_interval.map(|i| i.as_secs()),
            healthy: state.as_ref().map(|s| s.healthy).unwrap_or(true),
            last_checked: state.as_ref().map(|s| s.last_checked),
            consecutive_failures: state.map(|s| s.consecutive_failures).unwrap_or(0),
        }
    }
}

/// Active route table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteList {
    pub routes: Vec<RouteInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<RouteInfo>,
}

/// Result of a successful reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadResponse {
    /// Routes in the new table
    pub routes: usize,
    /// Changed settings that only apply after a restart
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart_required: Vec<String>,
}

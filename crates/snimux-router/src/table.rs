//! Immutable route table
//!
//! A `RouteTable` is built once and never mutated. Reloads build a fresh
//! table and swap it in through [`crate::SharedRouteTable`].
//!
//! Lookup priority:
//! 1. Exact hostname match
//! 2. Wildcard match on the immediate parent domain
//! 3. Not found (the caller decides whether a default backend applies)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::wildcard::{parent_domain, WildcardError, WildcardPattern};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Route table construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("Invalid wildcard pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: WildcardError,
    },

    #[error("Invalid hostname: '{0}'")]
    InvalidHostname(String),

    #[error("Duplicate route pattern: {0}")]
    DuplicatePattern(String),

    #[error("Invalid backend address '{address}': {reason}")]
    InvalidBackend {
        address: String,
        reason: &'static str,
    },
}

/// Normalize a DNS hostname: lowercase, no trailing dot, LDH labels only.
///
/// Underscores are tolerated since some internal names use them.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let trimmed = raw.strip_suffix('.').unwrap_or(raw);
    if trimmed.is_empty() || trimmed.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    let valid = trimmed.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });

    valid.then(|| trimmed.to_ascii_lowercase())
}

/// PROXY protocol header sent to a backend before the client's bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Off,
    /// Human-readable `PROXY TCP4 ...` line (HAProxy `send-proxy`)
    V1,
    /// Binary header (HAProxy `send-proxy-v2`)
    V2,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyProtocol::Off => "off",
            ProxyProtocol::V1 => "v1",
            ProxyProtocol::V2 => "v2",
        })
    }
}

/// A backend TCP listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// `host:port` to dial
    pub address: String,
    pub proxy_protocol: ProxyProtocol,
    /// Periodic TCP dial check; `None` means the backend is always eligible
    pub health_check_interval: Option<Duration>,
}

impl Backend {
    /// Create a backend, validating the `host:port` form
    pub fn new(address: impl Into<String>) -> Result<Self, RouteTableError> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self {
            address,
            proxy_protocol: ProxyProtocol::Off,
            health_check_interval: None,
        })
    }

    pub fn with_proxy_protocol(mut self, proxy_protocol: ProxyProtocol) -> Self {
        self.proxy_protocol = proxy_protocol;
        self
    }

    pub fn with_health_check(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }
}

fn validate_address(address: &str) -> Result<(), RouteTableError> {
    let invalid = |reason| RouteTableError::InvalidBackend {
        address: address.to_string(),
        reason,
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("empty host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 hosts must be bracketed"));
    }
    match port.parse::<u16>() {
        Ok(0) => Err(invalid("port must be non-zero")),
        Ok(_) => Ok(()),
        Err(_) => Err(invalid("invalid port")),
    }
}

/// A parsed match pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutePattern {
    Exact(String),
    Wildcard(WildcardPattern),
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteTableError> {
        if WildcardPattern::is_wildcard_pattern(pattern) || pattern.contains('*') {
            return WildcardPattern::parse(pattern)
                .map(RoutePattern::Wildcard)
                .map_err(|source| RouteTableError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                });
        }

        normalize_hostname(pattern)
            .map(RoutePattern::Exact)
            .ok_or_else(|| RouteTableError::InvalidHostname(pattern.to_string()))
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutePattern::Exact(host) => f.write_str(host),
            RoutePattern::Wildcard(pattern) => write!(f, "{}", pattern),
        }
    }
}

/// How a backend was selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Wildcard,
    Default,
}

/// A successful lookup
#[derive(Debug, Clone)]
pub struct RouteHit {
    pub backend: Arc<Backend>,
    pub kind: MatchKind,
    /// The pattern that matched, or `default`
    pub pattern: String,
}

/// Snapshot of all routes
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
    /// Routes in configuration order
    routes: Vec<(RoutePattern, Arc<Backend>)>,
    exact: HashMap<String, Arc<Backend>>,
    /// Keyed by the wildcard's base domain
    wildcard: HashMap<String, Arc<Backend>>,
    default_backend: Option<Arc<Backend>>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }

    /// Lookup a hostname: exact match first, then the parent wildcard
    pub fn lookup(&self, hostname: &str) -> Option<RouteHit> {
        let host = hostname.strip_suffix('.').unwrap_or(hostname);
        let host = host.to_ascii_lowercase();

        if let Some(backend) = self.exact.get(&host) {
            return Some(RouteHit {
                backend: backend.clone(),
                kind: MatchKind::Exact,
                pattern: host,
            });
        }

        let parent = parent_domain(&host)?;
        self.wildcard.get(parent).map(|backend| RouteHit {
            backend: backend.clone(),
            kind: MatchKind::Wildcard,
            pattern: format!("*.{}", parent),
        })
    }

    /// Backend for connections without SNI or without a matching route
    pub fn default_route(&self) -> Option<RouteHit> {
        self.default_backend.as_ref().map(|backend| RouteHit {
            backend: backend.clone(),
            kind: MatchKind::Default,
            pattern: "default".to_string(),
        })
    }

    pub fn default_backend(&self) -> Option<&Arc<Backend>> {
        self.default_backend.as_ref()
    }

    /// Routes in configuration order
    pub fn routes(&self) -> impl Iterator<Item = (&RoutePattern, &Arc<Backend>)> {
        self.routes.iter().map(|(pattern, backend)| (pattern, backend))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Distinct backends by address, including the default backend.
    ///
    /// When several routes share an address, the shortest health check
    /// interval among them wins.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        let mut by_address: Vec<Arc<Backend>> = Vec::new();
        let all = self
            .routes
            .iter()
            .map(|(_, backend)| backend)
            .chain(self.default_backend.iter());

        for backend in all {
            match by_address.iter_mut().find(|b| b.address == backend.address) {
                Some(existing) => {
                    let shorter = match (existing.health_check_interval, backend.health_check_interval) {
                        (None, Some(_)) => true,
                        (Some(current), Some(candidate)) => candidate < current,
                        _ => false,
                    };
                    if shorter {
                        *existing = backend.clone();
                    }
                }
                None => by_address.push(backend.clone()),
            }
        }

        by_address
    }
}

/// Builder validating patterns and rejecting duplicates
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    table: RouteTable,
}

impl RouteTableBuilder {
    pub fn route(mut self, pattern: &str, backend: Backend) -> Result<Self, RouteTableError> {
        let pattern = RoutePattern::parse(pattern)?;
        let backend = Arc::new(backend);

        let previous = match &pattern {
            RoutePattern::Exact(host) => self.table.exact.insert(host.clone(), backend.clone()),
            RoutePattern::Wildcard(wildcard) => self
                .table
                .wildcard
                .insert(wildcard.base_domain().to_string(), backend.clone()),
        };
        if previous.is_some() {
            return Err(RouteTableError::DuplicatePattern(pattern.to_string()));
        }

        self.table.routes.push((pattern, backend));
        Ok(self)
    }

    pub fn default_backend(mut self, backend: Backend) -> Self {
        self.table.default_backend = Some(Arc::new(backend));
        self
    }

    pub fn build(self) -> RouteTable {
        self.table
    }
}

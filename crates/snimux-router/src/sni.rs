//! TLS SNI-based backend selection

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::health::BackendHealth;
use crate::shared::SharedRouteTable;
use crate::table::{RouteHit, RouteTable};

/// Why no backend was selected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteMiss {
    #[error("ClientHello carries no SNI")]
    NoSni,

    #[error("No route found for SNI: {0}")]
    RouteNotFound(String),

    #[error("Backend {address} for SNI {sni} is marked unhealthy")]
    BackendUnhealthy { sni: String, address: String },
}

/// SNI router: active route table plus backend health
pub struct SniRouter {
    table: SharedRouteTable,
    health: Arc<BackendHealth>,
}

impl SniRouter {
    pub fn new(table: RouteTable) -> Self {
        Self::with_health(table, Arc::new(BackendHealth::new()))
    }

    pub fn with_health(table: RouteTable, health: Arc<BackendHealth>) -> Self {
        Self {
            table: SharedRouteTable::new(table),
            health,
        }
    }

    /// Select a backend for a (normalized) SNI hostname.
    ///
    /// Falls back to the default backend, if configured, when there is no
    /// SNI or no matching route. Unhealthy backends are never selected.
    pub fn select(&self, sni: Option<&str>) -> Result<RouteHit, RouteMiss> {
        let table = self.table.load();

        let Some(sni) = sni else {
            trace!("No SNI presented, trying default backend");
            return self.healthy_default(&table).ok_or(RouteMiss::NoSni);
        };

        match table.lookup(sni) {
            Some(hit) if self.health.is_healthy(&hit.backend.address) => {
                trace!("SNI {} matched {} -> {}", sni, hit.pattern, hit.backend.address);
                Ok(hit)
            }
            Some(hit) => {
                debug!(
                    "SNI {} matched {} but backend {} is unhealthy",
                    sni, hit.pattern, hit.backend.address
                );
                Err(RouteMiss::BackendUnhealthy {
                    sni: sni.to_string(),
                    address: hit.backend.address.clone(),
                })
            }
            None => self
                .healthy_default(&table)
                .ok_or_else(|| RouteMiss::RouteNotFound(sni.to_string())),
        }
    }

    fn healthy_default(&self, table: &RouteTable) -> Option<RouteHit> {
        table
            .default_route()
            .filter(|hit| self.health.is_healthy(&hit.backend.address))
    }

    /// Atomically replace the route table, returning the previous one
    pub fn reload(&self, table: RouteTable) -> Arc<RouteTable> {
        self.table.store(table)
    }

    /// Current route table snapshot
    pub fn table(&self) -> Arc<RouteTable> {
        self.table.load()
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Backend, MatchKind};

    fn router() -> SniRouter {
        let table = RouteTable::builder()
            .route("api.example.com", Backend::new("127.0.0.1:9001").unwrap())
            .unwrap()
            .route("*.cdn.example.com", Backend::new("127.0.0.1:9002").unwrap())
            .unwrap()
            .build();
        SniRouter::new(table)
    }

    #[test]
    fn test_select() {
        let router = router();
        assert_eq!(
            router.select(Some("api.example.com")).unwrap().backend.address,
            "127.0.0.1:9001"
        );
        assert_eq!(
            router.select(Some("x.cdn.example.com")).unwrap().backend.address,
            "127.0.0.1:9002"
        );
        assert_eq!(
            router.select(Some("other.tld")).unwrap_err(),
            RouteMiss::RouteNotFound("other.tld".to_string())
        );
        assert_eq!(router.select(None).unwrap_err(), RouteMiss::NoSni);
    }

    #[test]
    fn test_unhealthy_backend_is_skipped() {
        let router = router();
        router.health().record("127.0.0.1:9001", false);

        assert!(matches!(
            router.select(Some("api.example.com")),
            Err(RouteMiss::BackendUnhealthy { .. })
        ));
        // Other routes are unaffected
        assert!(router.select(Some("x.cdn.example.com")).is_ok());

        router.health().record("127.0.0.1:9001", true);
        assert!(router.select(Some("api.example.com")).is_ok());
    }

    #[test]
    fn test_default_backend() {
        let table = RouteTable::builder()
            .route("api.example.com", Backend::new("127.0.0.1:9001").unwrap())
            .unwrap()
            .default_backend(Backend::new("127.0.0.1:8443").unwrap())
            .build();
        let router = SniRouter::new(table);

        let hit = router.select(Some("unknown.example.org")).unwrap();
        assert_eq!(hit.kind, MatchKind::Default);
        let hit = router.select(None).unwrap();
        assert_eq!(hit.backend.address, "127.0.0.1:8443");

        router.health().record("127.0.0.1:8443", false);
        assert_eq!(router.select(None).unwrap_err(), RouteMiss::NoSni);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let router = router();
        let build = || {
            RouteTable::builder()
                .route("web.example.com", Backend::new("127.0.0.1:9010").unwrap())
                .unwrap()
                .build()
        };

        router.reload(build());
        let once = router.table();
        router.reload(build());
        let twice = router.table();

        assert_eq!(*once, *twice);
        for sni in ["web.example.com", "api.example.com", "x.cdn.example.com"] {
            assert_eq!(
                router.select(Some(sni)).map(|hit| hit.backend.address.clone()),
                SniRouter::new(build())
                    .select(Some(sni))
                    .map(|hit| hit.backend.address.clone())
            );
        }
    }
}

//! Periodic TCP health checks
//!
//! One task per backend with a configured interval. Each probe is a plain
//! TCP connect; the result is recorded in the shared [`BackendHealth`] the
//! router consults before selecting a backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snimux_router::{BackendHealth, RouteTable};

struct CheckTask {
    interval: Duration,
    cancel: CancellationToken,
}

pub struct HealthChecker {
    health: Arc<BackendHealth>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
    /// backend address -> running check
    tasks: Mutex<HashMap<String, CheckTask>>,
}

impl HealthChecker {
    pub fn new(health: Arc<BackendHealth>, connect_timeout: Duration) -> Self {
        Self {
            health,
            connect_timeout,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start, restart or stop check tasks so they match the backends in `table`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn reconcile(&self, table: &RouteTable) {
        let wanted: HashMap<String, Duration> = table
            .backends()
            .into_iter()
            .filter_map(|backend| {
                backend
                    .health_check_interval
                    .map(|interval| (backend.address.clone(), interval))
            })
            .collect();

        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("Health check registry poisoned, skipping reconcile");
            return;
        };

        tasks.retain(|address, task| {
            let keep = wanted.get(address) == Some(&task.interval);
            if !keep {
                debug!("Stopping health checks for {}", address);
                task.cancel.cancel();
            }
            keep
        });

        for (address, interval) in &wanted {
            if tasks.contains_key(address) {
                continue;
            }
            debug!("Checking {} every {:?}", address, interval);
            let cancel = self.shutdown.child_token();
            tokio::spawn(run_checks(
                address.clone(),
                *interval,
                self.connect_timeout,
                self.health.clone(),
                cancel.clone(),
            ));
            tasks.insert(
                address.clone(),
                CheckTask {
                    interval: *interval,
                    cancel,
                },
            );
        }

        // Backends without checks are always eligible
        let checked: HashSet<String> = wanted.into_keys().collect();
        self.health.retain(&checked);
    }

    /// Addresses currently being checked, sorted
    pub fn checked_backends(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .tasks
            .lock()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default();
        addresses.sort();
        addresses
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.clear();
        }
    }

    pub fn health(&self) -> &Arc<BackendHealth> {
        &self.health
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_checks(
    address: String,
    interval: Duration,
    connect_timeout: Duration,
    health: Arc<BackendHealth>,
    cancel: CancellationToken,
) {
    loop {
        let healthy = tokio::select! {
            _ = cancel.cancelled() => return,
            healthy = probe(&address, connect_timeout) => healthy,
        };

        match health.record(&address, healthy) {
            Some(false) => warn!("Backend {} failed its health check, marking unhealthy", address),
            Some(true) => info!("Backend {} is healthy again", address),
            None => debug!("Health check for {}: healthy={}", address, healthy),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// A single TCP connect attempt
pub async fn probe(address: &str, connect_timeout: Duration) -> bool {
    matches!(
        timeout(connect_timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}

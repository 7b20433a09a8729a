//! TCP listener with SNI-based passthrough routing
//!
//! Each accepted connection has its ClientHello buffered, a backend chosen
//! from the SNI hostname, and the raw stream spliced to that backend. No TLS
//! termination is performed, so encryption stays end-to-end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use snimux_router::{RouteTable, SniRouter};

use crate::error::{ConnectionError, RejectReason, ServerError};
use crate::health::HealthChecker;
use crate::inspect::{read_client_hello, Inspected, DEFAULT_MAX_CLIENT_HELLO};
use crate::proxy_protocol;
use crate::splice::splice;
use crate::stats::ServerStats;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SniServerConfig {
    pub bind_addr: SocketAddr,
    /// Deadline for a complete ClientHello
    pub inspect_timeout: Duration,
    pub connect_timeout: Duration,
    /// Close a session after this long without traffic in either direction
    pub idle_timeout: Duration,
    /// Connections above this are closed right after accept
    pub max_connections: usize,
    pub max_client_hello: usize,
}

impl Default for SniServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            inspect_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1024,
            max_client_hello: DEFAULT_MAX_CLIENT_HELLO,
        }
    }
}

pub struct SniServer {
    config: SniServerConfig,
    router: Arc<SniRouter>,
    stats: Arc<ServerStats>,
}

impl SniServer {
    /// Create a new server routing with `table`
    pub fn new(config: SniServerConfig, table: RouteTable) -> Self {
        Self {
            config,
            router: Arc::new(SniRouter::new(table)),
            stats: Arc::new(ServerStats::new()),
        }
    }

    pub fn router(&self) -> Arc<SniRouter> {
        self.router.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Bind the listener and start accepting connections in the background
    pub async fn bind(self) -> Result<ServerHandle, ServerError> {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ServerError::BindError {
                address: bind_addr.ip().to_string(),
                port: bind_addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let health_checker = HealthChecker::new(
            self.router.health().clone(),
            self.config.connect_timeout,
        );
        health_checker.reconcile(&self.router.table());

        let shared = Arc::new(Shared {
            limit: Arc::new(Semaphore::new(self.config.max_connections)),
            config: self.config,
            router: self.router,
            stats: self.stats,
            health_checker,
            forced: AtomicUsize::new(0),
        });

        let handle = ServerHandle {
            local_addr,
            shared: shared.clone(),
            accepting: CancellationToken::new(),
            sessions: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };

        info!(
            "SNI router listening on {} ({} routes, SNI passthrough, no TLS termination)",
            local_addr,
            shared.router.table().len()
        );

        handle.tracker.spawn(accept_loop(
            listener,
            shared,
            handle.accepting.clone(),
            handle.sessions.clone(),
            handle.tracker.clone(),
        ));

        Ok(handle)
    }
}

/// State shared by the accept loop and every connection task
struct Shared {
    config: SniServerConfig,
    router: Arc<SniRouter>,
    stats: Arc<ServerStats>,
    health_checker: HealthChecker,
    limit: Arc<Semaphore>,
    /// Connections closed by a drain deadline
    forced: AtomicUsize,
}

/// Control over a running server
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accepting: CancellationToken,
    sessions: CancellationToken,
    tracker: TaskTracker,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(&self) -> Arc<SniRouter> {
        self.shared.router.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }

    /// Swap in a new route table. In-flight sessions keep their backend.
    pub fn reload(&self, table: RouteTable) {
        let routes = table.len();
        self.shared.router.reload(table);
        self.shared
            .health_checker
            .reconcile(&self.shared.router.table());
        info!("Route table reloaded ({} routes)", routes);
    }

    /// Stop accepting, wait up to `drain` for sessions to finish, then close
    /// the rest. Returns how many connections were closed forcibly.
    pub async fn stop(&self, drain: Duration) -> usize {
        self.accepting.cancel();
        self.tracker.close();
        self.shared.health_checker.shutdown();

        info!(
            "Draining {} active connections (up to {:?})",
            self.shared.stats.active(),
            drain
        );

        if timeout(drain, self.tracker.wait()).await.is_err() {
            warn!("Drain deadline reached, closing remaining connections");
            self.sessions.cancel();
            self.tracker.wait().await;
        }

        let forced = self.shared.forced.load(Ordering::Relaxed);
        info!("SNI router stopped ({} connections closed forcibly)", forced);
        forced
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    accepting: CancellationToken,
    sessions: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = accepting.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        shared.stats.record_accept();

        let Ok(permit) = shared.limit.clone().try_acquire_owned() else {
            warn!(
                "Connection limit of {} reached, rejecting {}",
                shared.config.max_connections, peer_addr
            );
            shared.stats.record_reject(RejectReason::ConnectionLimit);
            drop(socket);
            continue;
        };

        debug!("Accepted connection from {}", peer_addr);
        let shared = shared.clone();
        let sessions = sessions.clone();
        tracker.spawn(async move {
            let _permit = permit;
            shared.serve(socket, peer_addr, sessions).await;
        });
    }

    debug!("Accept loop stopped, listener closed");
}

impl Shared {
    async fn serve(&self, socket: TcpStream, peer_addr: SocketAddr, sessions: CancellationToken) {
        let _active = self.stats.track_active();

        let result = tokio::select! {
            result = self.forward(socket, peer_addr) => result,
            _ = sessions.cancelled() => {
                debug!("Closing connection from {} at drain deadline", peer_addr);
                self.forced.fetch_add(1, Ordering::Relaxed);
                self.stats.record_forced_close();
                return;
            }
        };

        if let Err(e) = result {
            match e.reject_reason() {
                Some(reason) => {
                    self.stats.record_reject(reason);
                    debug!("Rejected connection from {} ({}): {}", peer_addr, reason, e);
                }
                None => debug!("Connection from {} ended with error: {}", peer_addr, e),
            }
        }
    }

    async fn forward(&self, mut client: TcpStream, peer_addr: SocketAddr) -> Result<(), ConnectionError> {
        let local_addr = client.local_addr()?;

        let Inspected { sni, buffered } = read_client_hello(
            &mut client,
            self.config.inspect_timeout,
            self.config.max_client_hello,
        )
        .await?;

        let route = self.router.select(sni.as_deref())?;
        let address = route.backend.address.clone();

        let mut backend = self.connect(&address).await?;

        // The PROXY header, then the ClientHello, precede any spliced byte
        let unavailable = |e: std::io::Error| ConnectionError::BackendUnavailable {
            address: address.clone(),
            reason: e.to_string(),
        };
        if let Some(header) = proxy_protocol::encode(route.backend.proxy_protocol, peer_addr, local_addr) {
            backend.write_all(&header).await.map_err(unavailable)?;
        }
        backend.write_all(&buffered).await.map_err(unavailable)?;

        self.stats.record_routed(&address);
        self.stats.add_bytes_to_backend(buffered.len() as u64);

        info!(
            "Routing {} (SNI {}) via {} to {}",
            peer_addr,
            sni.as_deref().unwrap_or("-"),
            route.pattern,
            address
        );

        let started = chrono::Utc::now();
        let result = splice(client, backend, self.config.idle_timeout, &self.stats).await;
        let duration_ms = (chrono::Utc::now() - started).num_milliseconds();

        match result {
            Ok(totals) => debug!(
                "Connection from {} to {} closed ({}ms, ↑{}B ↓{}B)",
                peer_addr,
                address,
                duration_ms,
                totals.to_backend + buffered.len() as u64,
                totals.to_client
            ),
            Err(e) => debug!(
                "Connection from {} to {} aborted after {}ms: {}",
                peer_addr, address, duration_ms, e
            ),
        }

        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, ConnectionError> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnectionError::BackendUnavailable {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ConnectionError::BackendUnavailable {
                    address: address.to_string(),
                    reason: format!("connect timed out after {:?}", self.config.connect_timeout),
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", address, e);
        }
        Ok(stream)
    }
}

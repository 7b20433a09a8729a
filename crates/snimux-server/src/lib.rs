//! SNI passthrough server
//!
//! Accepts raw TCP connections, peeks the TLS ClientHello for the SNI
//! hostname, and splices the untouched byte stream to the selected backend.
//! No TLS termination is performed.

pub mod error;
pub mod health;
pub mod inspect;
pub mod proxy_protocol;
pub mod server;
pub mod splice;
pub mod stats;

pub use error::{ConnectionError, RejectReason, ServerError};
pub use health::HealthChecker;
pub use inspect::DEFAULT_MAX_CLIENT_HELLO;
pub use server::{ServerHandle, SniServer, SniServerConfig};
pub use stats::{ServerStats, StatsSnapshot};

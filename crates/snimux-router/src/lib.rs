//! Routing logic for SNI passthrough
//!
//! Parses the TLS ClientHello far enough to read the Server Name Indication,
//! and maps the hostname onto a backend through an immutable route table.
//! Supports wildcard domain patterns (e.g., `*.example.com`) with fallback matching.

pub mod client_hello;
pub mod health;
pub mod shared;
pub mod sni;
pub mod table;
pub mod wildcard;

pub use client_hello::{extract_sni, probe_client_hello, ClientHelloError, HelloProbe, MAX_RECORD_LEN};
pub use health::{BackendHealth, HealthState};
pub use shared::SharedRouteTable;
pub use sni::{RouteMiss, SniRouter};
pub use table::{
    normalize_hostname, Backend, MatchKind, ProxyProtocol, RouteHit, RoutePattern, RouteTable,
    RouteTableBuilder, RouteTableError,
};
pub use wildcard::{parent_domain, WildcardError, WildcardPattern};

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use snimux_router::{ClientHelloError, RouteMiss};

/// Fatal server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 need root or CAP_NET_BIND_SERVICE\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Per-connection failures. These end one connection, never the server.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("No complete ClientHello within {0:?}")]
    InspectionTimeout(std::time::Duration),

    #[error("Malformed ClientHello: {0}")]
    MalformedClientHello(ClientHelloError),

    #[error("ClientHello exceeds the {limit} byte inspection buffer")]
    HandshakeTooLarge { limit: usize },

    #[error(transparent)]
    NoRoute(#[from] RouteMiss),

    #[error("Backend {address} unavailable: {reason}")]
    BackendUnavailable { address: String, reason: String },

    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClientHelloError> for ConnectionError {
    fn from(error: ClientHelloError) -> Self {
        match error {
            ClientHelloError::TooLarge { limit, .. } => ConnectionError::HandshakeTooLarge { limit },
            other => ConnectionError::MalformedClientHello(other),
        }
    }
}

impl ConnectionError {
    /// Metrics label, `None` for errors after the connection was routed
    pub fn reject_reason(&self) -> Option<RejectReason> {
        Some(match self {
            ConnectionError::InspectionTimeout(_) => RejectReason::InspectionTimeout,
            ConnectionError::MalformedClientHello(_) => RejectReason::MalformedClientHello,
            ConnectionError::HandshakeTooLarge { .. } => RejectReason::HandshakeTooLarge,
            ConnectionError::NoRoute(RouteMiss::NoSni) => RejectReason::NoSni,
            ConnectionError::NoRoute(_) => RejectReason::RouteNotFound,
            ConnectionError::BackendUnavailable { .. } => RejectReason::BackendUnavailable,
            ConnectionError::ConnectionLimit(_) => RejectReason::ConnectionLimit,
            ConnectionError::Io(_) => return None,
        })
    }
}

/// Why a connection was closed without being proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InspectionTimeout,
    MalformedClientHello,
    HandshakeTooLarge,
    NoSni,
    RouteNotFound,
    BackendUnavailable,
    ConnectionLimit,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::InspectionTimeout,
        RejectReason::MalformedClientHello,
        RejectReason::HandshakeTooLarge,
        RejectReason::NoSni,
        RejectReason::RouteNotFound,
        RejectReason::BackendUnavailable,
        RejectReason::ConnectionLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InspectionTimeout => "inspection_timeout",
            RejectReason::MalformedClientHello => "malformed_client_hello",
            RejectReason::HandshakeTooLarge => "handshake_too_large",
            RejectReason::NoSni => "no_sni",
            RejectReason::RouteNotFound => "route_not_found",
            RejectReason::BackendUnavailable => "backend_unavailable",
            RejectReason::ConnectionLimit => "connection_limit",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Resolved settings

use snimux_router::RouteTable;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::layer::{BackendEntry, RouteEntry, SettingsLayer};
use crate::merge::merge;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:443";
pub const DEFAULT_INSPECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
/// Upper bound for every timeout setting
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fully resolved router settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub inspect_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_connections: usize,
    pub default_backend: Option<BackendEntry>,
    pub routes: Vec<RouteEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            inspect_timeout: DEFAULT_INSPECT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            default_backend: None,
            routes: Vec::new(),
        }
    }
}

impl Settings {
    /// Resolve layers in order (later layers win) on top of the defaults
    pub fn resolve<'a>(layers: impl IntoIterator<Item = &'a SettingsLayer>) -> Result<Self, ConfigError> {
        let settings = layers
            .into_iter()
            .fold(Settings::default(), |settings, layer| merge(&settings, layer, false));
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges and that the routes form a valid table
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A zero drain timeout means close everything immediately
        let timeouts = [
            ("inspect_timeout_secs", self.inspect_timeout, false),
            ("connect_timeout_secs", self.connect_timeout, false),
            ("idle_timeout_secs", self.idle_timeout, false),
            ("drain_timeout_secs", self.drain_timeout, true),
        ];
        for (field, value, zero_ok) in timeouts {
            if value.is_zero() && !zero_ok {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero",
                });
            }
            if value > MAX_TIMEOUT {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must not exceed 604800 seconds (7 days)",
                });
            }
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: "must be greater than zero",
            });
        }

        self.route_table().map(|_| ())
    }

    /// Build the immutable route table these settings describe
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut builder = RouteTable::builder();

        for (index, entry) in self.routes.iter().enumerate() {
            let route_error = |source| ConfigError::Route {
                index,
                pattern: entry.pattern.clone(),
                source,
            };
            let backend = entry.to_backend().map_err(route_error)?;
            builder = builder.route(&entry.pattern, backend).map_err(route_error)?;
        }

        if let Some(default) = &self.default_backend {
            let backend = default.to_backend().map_err(ConfigError::DefaultBackend)?;
            builder = builder.default_backend(backend);
        }

        Ok(builder.build())
    }

    /// Settings that differ from `other` and only take effect after a restart
    pub fn restart_required(&self, other: &Settings) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.listen != other.listen {
            fields.push("listen");
        }
        if self.max_connections != other.max_connections {
            fields.push("max_connections");
        }
        if self.inspect_timeout != other.inspect_timeout {
            fields.push("inspect_timeout_secs");
        }
        if self.connect_timeout != other.connect_timeout {
            fields.push("connect_timeout_secs");
        }
        if self.idle_timeout != other.idle_timeout {
            fields.push("idle_timeout_secs");
        }
        fields
    }
}

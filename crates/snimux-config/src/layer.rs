//! Config file format
//!
//! Every field is optional: a layer only carries what was explicitly set.

use serde::{Deserialize, Deserializer, Serialize};
use snimux_router::{Backend, ProxyProtocol, RouteTableError};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;

/// One set of explicitly given settings (a config file, or CLI overrides)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,

    /// Deadline for receiving a complete ClientHello
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Close a proxied session after this long without traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Backend for connections without SNI or without a matching route.
    /// `Some(None)` is an explicit `off`, which clears it on reload.
    #[serde(
        default,
        deserialize_with = "default_backend_or_off",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_backend: Option<Option<BackendEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteEntry>>,
}

/// A single route definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    /// Exact hostname or `*.domain.tld`
    #[serde(rename = "match")]
    pub pattern: String,

    /// Backend `host:port`
    pub backend: String,

    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,

    /// 0 or absent disables health checks for this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_secs: Option<u64>,
}

impl RouteEntry {
    pub fn new(pattern: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            backend: backend.into(),
            proxy_protocol: ProxyProtocol::Off,
            health_check_interval_secs: None,
        }
    }

    pub fn to_backend(&self) -> Result<Backend, RouteTableError> {
        build_backend(
            &self.backend,
            self.proxy_protocol,
            self.health_check_interval_secs,
        )
    }
}

/// Default backend definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendEntry {
    pub address: String,

    #[serde(default)]
    pub proxy_protocol: ProxyProtocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_secs: Option<u64>,
}

impl BackendEntry {
    pub fn to_backend(&self) -> Result<Backend, RouteTableError> {
        build_backend(
            &self.address,
            self.proxy_protocol,
            self.health_check_interval_secs,
        )
    }
}

fn build_backend(
    address: &str,
    proxy_protocol: ProxyProtocol,
    health_check_interval_secs: Option<u64>,
) -> Result<Backend, RouteTableError> {
    let backend = Backend::new(address)?.with_proxy_protocol(proxy_protocol);
    Ok(match health_check_interval_secs {
        Some(secs) if secs > 0 => backend.with_health_check(Duration::from_secs(secs)),
        _ => backend,
    })
}

/// Accepts a backend entry, or `off` (or an empty value) to disable it
fn default_backend_or_off<'de, D>(deserializer: D) -> Result<Option<Option<BackendEntry>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(rename_all = "lowercase")]
    enum Off {
        Off,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Setting {
        Off(Off),
        Backend(BackendEntry),
    }

    Ok(Some(match Option::<Setting>::deserialize(deserializer)? {
        Some(Setting::Backend(entry)) => Some(entry),
        Some(Setting::Off(Off::Off)) | None => None,
    }))
}

impl SettingsLayer {
    /// Load a layer from a file, picking the format from the extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        debug!("Loading config file {:?}", path);
        match extension.as_deref() {
            Some("yml") | Some("yaml") => Self::parse_yaml(&content),
            Some("json") => Self::parse_json(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn parse_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Starter config written by `snimux init`
    pub fn template() -> String {
        r#"# snimux configuration
# All fields are optional; CLI flags override values set here.

listen: "0.0.0.0:443"
inspect_timeout_secs: 5
connect_timeout_secs: 5
idle_timeout_secs: 300
drain_timeout_secs: 30
max_connections: 1024

# Connections without SNI or without a matching route go here.
# Leave unset to reject them. A reload keeps the previous default backend
# when this key is missing; set `default_backend: off` to remove it.
# default_backend:
#   address: "127.0.0.1:8443"

routes:
  - match: "api.example.com"
    backend: "127.0.0.1:9001"

  - match: "*.cdn.example.com"
    backend: "127.0.0.1:9002"
    proxy_protocol: v1
    health_check_interval_secs: 30
"#
        .to_string()
    }
}

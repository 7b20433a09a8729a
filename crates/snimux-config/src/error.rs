use snimux_router::RouteTableError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format {0:?} (expected .yml, .yaml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("Route #{index} ({pattern}): {source}")]
    Route {
        index: usize,
        pattern: String,
        #[source]
        source: RouteTableError,
    },

    #[error("Default backend: {0}")]
    DefaultBackend(#[source] RouteTableError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

//! Configuration for the SNI router
//!
//! A config file (YAML or JSON) and CLI flags are both [`SettingsLayer`]s:
//! sets of explicitly given values. Layers are folded onto the running
//! [`Settings`] with the pure [`merge`] function, on startup and on reload.

pub mod error;
pub mod layer;
pub mod merge;
pub mod settings;

pub use error::ConfigError;
pub use layer::{BackendEntry, RouteEntry, SettingsLayer};
pub use merge::merge;
pub use settings::{Settings, MAX_TIMEOUT};

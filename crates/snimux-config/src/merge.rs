//! Settings merge
//!
//! `merge(old, new, force)`:
//! - values present in `new` always win
//! - values absent from `new` keep their `old` value
//! - with `force`, absent values fall back to defaults instead

use std::time::Duration;

use crate::layer::SettingsLayer;
use crate::settings::Settings;

pub fn merge(old: &Settings, new: &SettingsLayer, force: bool) -> Settings {
    let base = if force {
        Settings::default()
    } else {
        old.clone()
    };

    let secs = |value: Option<u64>, fallback: Duration| value.map(Duration::from_secs).unwrap_or(fallback);

    Settings {
        listen: new.listen.unwrap_or(base.listen),
        inspect_timeout: secs(new.inspect_timeout_secs, base.inspect_timeout),
        connect_timeout: secs(new.connect_timeout_secs, base.connect_timeout),
        idle_timeout: secs(new.idle_timeout_secs, base.idle_timeout),
        drain_timeout: secs(new.drain_timeout_secs, base.drain_timeout),
        max_connections: new.max_connections.unwrap_or(base.max_connections),
        default_backend: match &new.default_backend {
            Some(setting) => setting.clone(),
            None => base.default_backend,
        },
        routes: new.routes.clone().unwrap_or(base.routes),
    }
}

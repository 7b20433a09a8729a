//! Config reloads, triggered by SIGHUP or the control endpoint

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use snimux_api::{ConfigReloader, ReloadError, ReloadResponse};
use snimux_config::{merge, Settings, SettingsLayer};
use snimux_server::ServerHandle;

pub struct FileReloader {
    path: Option<PathBuf>,
    /// CLI flags, re-applied over every reloaded file
    overrides: SettingsLayer,
    /// Reset settings missing from the file to defaults instead of keeping them
    force: bool,
    /// Settings the listener was started with
    started_with: Settings,
    current: Mutex<Settings>,
    server: Arc<ServerHandle>,
}

impl FileReloader {
    pub fn new(
        path: Option<PathBuf>,
        overrides: SettingsLayer,
        force: bool,
        settings: Settings,
        server: Arc<ServerHandle>,
    ) -> Self {
        Self {
            path,
            overrides,
            force,
            started_with: settings.clone(),
            current: Mutex::new(settings),
            server,
        }
    }

    pub async fn drain_timeout(&self) -> Duration {
        self.current.lock().await.drain_timeout
    }
}

#[async_trait]
impl ConfigReloader for FileReloader {
    async fn reload(&self) -> Result<ReloadResponse, ReloadError> {
        let path = self.path.as_ref().ok_or(ReloadError::NotConfigured)?;
        let rejected = |e: snimux_config::ConfigError| ReloadError::Rejected(e.to_string());

        let file = SettingsLayer::load(path).map_err(rejected)?;

        let mut current = self.current.lock().await;
        let next = merge(&merge(&current, &file, self.force), &self.overrides, false);
        next.validate().map_err(rejected)?;
        let table = next.route_table().map_err(rejected)?;

        let restart_required: Vec<String> = next
            .restart_required(&self.started_with)
            .into_iter()
            .map(String::from)
            .collect();
        if !restart_required.is_empty() {
            warn!(
                "Changed settings only take effect after a restart: {}",
                restart_required.join(", ")
            );
        }

        let routes = table.len();
        self.server.reload(table);
        *current = next;

        info!("Reloaded {:?}", path);
        Ok(ReloadResponse {
            routes,
            restart_required,
        })
    }
}

//! snimux - SNI passthrough router
//!
//! Listens for TLS connections, reads the SNI hostname from the ClientHello
//! and forwards the untouched stream to the matching backend.

mod reload;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use snimux_api::{ApiServer, ApiState, ConfigReloader};
use snimux_config::{BackendEntry, RouteEntry, Settings, SettingsLayer};
use snimux_server::{SniServer, SniServerConfig, DEFAULT_MAX_CLIENT_HELLO};

use reload::FileReloader;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("SNIMUX_COMMIT"),
    ", built ",
    env!("SNIMUX_BUILD_DATE"),
    ")"
);

/// snimux - route TLS connections to backends by SNI, without terminating TLS
#[derive(Parser, Debug)]
#[command(name = "snimux")]
#[command(about = "Route TLS connections to backends by SNI hostname")]
#[command(version = VERSION)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, global = true, env = "SNIMUX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a config file and print the resulting route table
    Check {
        /// Config file (.yaml, .yml or .json)
        config: PathBuf,
    },

    /// Write a starter config file
    Init {
        #[arg(default_value = "snimux.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Config file (.yaml, .yml or .json). Reloaded on SIGHUP.
    #[arg(short, long, env = "SNIMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Address to accept TLS connections on
    #[arg(long, env = "SNIMUX_LISTEN")]
    listen: Option<SocketAddr>,

    /// Seconds to wait for a complete ClientHello
    #[arg(long, value_name = "SECS")]
    inspect_timeout: Option<u64>,

    /// Seconds to wait when dialing a backend
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u64>,

    /// Close sessions idle for this many seconds
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Seconds to let sessions finish on shutdown
    #[arg(long, value_name = "SECS")]
    drain_timeout: Option<u64>,

    /// Connections above this limit are closed immediately
    #[arg(long, env = "SNIMUX_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Route as PATTERN=HOST:PORT, e.g. '*.example.com=127.0.0.1:9002'.
    /// Repeatable; replaces the routes from the config file.
    #[arg(long = "route", value_name = "PATTERN=BACKEND")]
    routes: Vec<String>,

    /// Backend for connections without SNI or without a matching route
    #[arg(long, value_name = "HOST:PORT")]
    default_backend: Option<String>,

    /// Serve the control endpoint (health, stats, routes, reload) here
    #[arg(long, env = "SNIMUX_API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// On reload, reset settings missing from the file to their defaults
    #[arg(long)]
    reset_on_reload: bool,
}

impl RunArgs {
    /// The settings given explicitly on the command line
    fn overrides(&self) -> Result<SettingsLayer> {
        let routes = if self.routes.is_empty() {
            None
        } else {
            Some(
                self.routes
                    .iter()
                    .map(|route| parse_route(route))
                    .collect::<Result<Vec<_>>>()?,
            )
        };

        Ok(SettingsLayer {
            listen: self.listen,
            inspect_timeout_secs: self.inspect_timeout,
            connect_timeout_secs: self.connect_timeout,
            idle_timeout_secs: self.idle_timeout,
            drain_timeout_secs: self.drain_timeout,
            max_connections: self.max_connections,
            default_backend: self.default_backend.as_ref().map(|address| {
                Some(BackendEntry {
                    address: address.clone(),
                    proxy_protocol: Default::default(),
                    health_check_interval_secs: None,
                })
            }),
            routes,
        })
    }
}

/// Parse `PATTERN=HOST:PORT`
fn parse_route(route: &str) -> Result<RouteEntry> {
    match route.split_once('=') {
        Some((pattern, backend)) if !pattern.is_empty() && !backend.is_empty() => {
            Ok(RouteEntry::new(pattern.trim(), backend.trim()))
        }
        _ => bail!("Invalid --route '{}': expected PATTERN=HOST:PORT", route),
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_layer(path: Option<&Path>) -> Result<SettingsLayer> {
    match path {
        Some(path) => SettingsLayer::load(path)
            .with_context(|| format!("Failed to load config file {:?}", path)),
        None => Ok(SettingsLayer::default()),
    }
}

fn check(path: &Path) -> Result<()> {
    let layer = load_layer(Some(path))?;
    let settings = Settings::resolve([&layer]).context("Invalid configuration")?;
    let table = settings.route_table()?;

    println!("✅ {:?} is valid", path);
    println!("  listen:          {}", settings.listen);
    println!("  max connections: {}", settings.max_connections);
    for (pattern, backend) in table.routes() {
        println!(
            "  {:<32} -> {} (proxy protocol: {})",
            pattern.to_string(),
            backend.address,
            backend.proxy_protocol
        );
    }
    if let Some(backend) = table.default_backend() {
        println!("  {:<32} -> {}", "(default)", backend.address);
    }
    Ok(())
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    std::fs::write(path, SettingsLayer::template())
        .with_context(|| format!("Failed to write {:?}", path))?;
    println!("✅ Wrote {:?}", path);
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let overrides = args.overrides()?;
    let file = load_layer(args.config.as_deref())?;
    let settings = Settings::resolve([&file, &overrides]).context("Invalid configuration")?;
    let table = settings.route_table()?;

    if table.is_empty() && table.default_backend().is_none() {
        warn!("No routes configured, every connection will be rejected");
    }

    info!("snimux {} starting", VERSION);

    let config = SniServerConfig {
        bind_addr: settings.listen,
        inspect_timeout: settings.inspect_timeout,
        connect_timeout: settings.connect_timeout,
        idle_timeout: settings.idle_timeout,
        max_connections: settings.max_connections,
        max_client_hello: DEFAULT_MAX_CLIENT_HELLO,
    };
    let server = Arc::new(SniServer::new(config, table).bind().await?);

    let reloader = Arc::new(FileReloader::new(
        args.config.clone(),
        overrides,
        args.reset_on_reload,
        settings,
        server.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);

    if let Some(api_addr) = args.api_addr {
        let api = ApiServer::new(
            api_addr,
            ApiState {
                router: server.router(),
                stats: server.stats(),
                reloader: Some(reloader.clone()),
            },
        );
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            };
            if let Err(e) = api.start(shutdown).await {
                warn!("Control endpoint stopped: {:#}", e);
            }
        });
    }

    #[cfg(unix)]
    spawn_sighup_reloader(reloader.clone(), stop_rx)?;

    wait_for_shutdown().await?;

    let drain = reloader.drain_timeout().await;
    let forced = server.stop(drain).await;
    let _ = stop_tx.send(true);

    if forced > 0 {
        warn!("{} connections were still open after {:?}", forced, drain);
    }
    info!("snimux stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_sighup_reloader(reloader: Arc<FileReloader>, mut stop_rx: watch::Receiver<bool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.wait_for(|stopped| *stopped) => return,
                received = sighup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }

            info!("Received SIGHUP, reloading configuration");
            match reloader.reload().await {
                Ok(summary) => info!("Configuration reloaded ({} routes)", summary.routes),
                Err(e) => warn!("Reload rejected, keeping current configuration: {}", e),
            }
        }
    });
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Some(Commands::Check { config }) => check(&config),
        Some(Commands::Init { path, force }) => init(&path, force),
        None => run(cli.run).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_route() {
        let route = parse_route("*.cdn.example.com=127.0.0.1:9002").unwrap();
        assert_eq!(route.pattern, "*.cdn.example.com");
        assert_eq!(route.backend, "127.0.0.1:9002");

        assert!(parse_route("api.example.com").is_err());
        assert!(parse_route("=127.0.0.1:9001").is_err());
        assert!(parse_route("api.example.com=").is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let cli = Cli::parse_from([
            "snimux",
            "--listen",
            "127.0.0.1:8443",
            "--route",
            "api.example.com=127.0.0.1:9001",
            "--max-connections",
            "10",
        ]);
        let overrides = cli.run.overrides().unwrap();

        let file = SettingsLayer::parse_yaml(
            r#"
listen: "0.0.0.0:443"
idle_timeout_secs: 60
routes:
  - match: "old.example.com"
    backend: "127.0.0.1:1"
"#,
        )
        .unwrap();

        let settings = Settings::resolve([&file, &overrides]).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:8443".parse().unwrap());
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.idle_timeout, std::time::Duration::from_secs(60));
        assert_eq!(settings.routes.len(), 1);
        assert_eq!(settings.routes[0].pattern, "api.example.com");
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::parse_from(["snimux", "check", "snimux.yaml"]);
        assert!(matches!(cli.command, Some(Commands::Check { .. })));

        let cli = Cli::parse_from(["snimux", "init"]);
        match cli.command {
            Some(Commands::Init { path, force }) => {
                assert_eq!(path, PathBuf::from("snimux.yaml"));
                assert!(!force);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

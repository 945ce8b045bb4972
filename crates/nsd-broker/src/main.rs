//! nsd-broker — the network service discovery broker daemon.
//!
//! # Usage
//!
//! ```bash
//! nsd-broker                    # Start the broker
//! nsd-broker --socket /tmp/x    # Listen on a specific Unix socket
//! nsd-broker --config path      # Use a specific config file
//! ```
//!
//! # Architecture
//!
//! The daemon spawns two concurrent tasks plus the calling task's runtime:
//! 1. The event loop (`eventloop::run`) — the sole writer of broker state.
//! 2. The connector IPC accept loop (`ipc_server::IpcServer`) on a Unix
//!    socket, one handler task per connection.
//!
//! Both backends' engine callbacks and the daemon-cleanup timer feed the
//! event loop over unbounded channels; nothing outside `eventloop::Broker`
//! ever touches broker state directly.

mod backends;
mod eventloop;
mod ids;
mod ipc_server;
mod lifecycle;
mod registry;
mod txindex;

use anyhow::{Context, Result};
use backends::iface::NetdevInterfaceResolver;
use backends::legacy::MdnsLegacyEngine;
use backends::managed::MdnsManagedEngine;
use backends::{BackendRouter, LoggingSocketProvider};
use clap::Parser;
use ipc_server::IpcServer;
use nsd_core::config::BrokerConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// nsd-broker — mDNS/DNS-SD multiplexing daemon.
#[derive(Parser, Debug)]
#[command(name = "nsd-broker", about = "Network service discovery broker daemon")]
struct Cli {
    /// Path to the Unix socket connectors dial into.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable the managed mDNS backend for discovery/resolve operations,
    /// overriding the config file for this run.
    #[arg(long)]
    managed_discovery: bool,

    /// Enable the managed mDNS backend for register operations, overriding
    /// the config file for this run.
    #[arg(long)]
    managed_advertiser: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => BrokerConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match BrokerConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("no config file found, using defaults");
            BrokerConfig::default()
        }
    };

    if cli.managed_discovery {
        config.managed_discovery_enabled = true;
    }
    if cli.managed_advertiser {
        config.managed_advertiser_enabled = true;
    }

    let socket_path = cli.socket.unwrap_or_else(BrokerConfig::default_socket_path);

    // -----------------------------------------------------------------
    // Wire the two mDNS backends. The legacy engine lazily starts its
    // `ServiceDaemon` on first use (spec §4.7); the managed engine's
    // daemon is live for the broker's whole lifetime.
    // -----------------------------------------------------------------
    let (legacy_tx, legacy_rx) = mpsc::unbounded_channel();
    let legacy_engine = Box::new(MdnsLegacyEngine::new(legacy_tx, config.network_interface.clone()));

    let (managed_tx, managed_rx) = mpsc::unbounded_channel();
    let managed_engine = MdnsManagedEngine::new(managed_tx, config.network_interface.as_deref())
        .context("failed to start managed mDNS daemon")?;
    let managed_engine = std::sync::Arc::new(std::sync::Mutex::new(managed_engine));

    let managed_discovery = Box::new(ArcManagedEngine(managed_engine.clone()));
    let managed_advertiser = Box::new(ArcManagedEngine(managed_engine));

    let router = BackendRouter::new(config.managed_discovery_enabled, config.managed_advertiser_enabled);

    let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();

    let broker = eventloop::Broker::new(
        legacy_engine,
        managed_discovery,
        managed_advertiser,
        Box::new(LoggingSocketProvider),
        Box::new(NetdevInterfaceResolver),
        router,
        Duration::from_millis(config.cleanup_delay_ms),
        config.max_requests_per_client,
        cleanup_tx,
    );

    let (messages_tx, messages_rx) = mpsc::unbounded_channel();

    let ipc_server = IpcServer::bind(&socket_path)
        .await
        .context("failed to start IPC server")?;
    info!(path = %socket_path.display(), "IPC server started");

    let accept_messages = messages_tx.clone();
    tokio::spawn(async move {
        ipc_server.accept_loop(accept_messages).await;
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let event_loop = tokio::spawn(eventloop::run(
        broker,
        messages_rx,
        legacy_rx,
        managed_rx,
        cleanup_rx,
        shutdown_rx,
    ));

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
        }
    });

    info!("broker is running");
    let _ = event_loop.await;
    info!("broker stopped");
    Ok(())
}

/// Shares one [`MdnsManagedEngine`] between the discovery and advertiser
/// roles (spec §4.5 treats them as separate collaborators, but both are
/// realized here by the same underlying `mdns-sd` daemon instance).
struct ArcManagedEngine(std::sync::Arc<std::sync::Mutex<MdnsManagedEngine>>);

impl backends::ManagedDiscoveryManager for ArcManagedEngine {
    fn register_listener(
        &mut self,
        global_id: nsd_core::types::TransactionId,
        service_type: &str,
        network: Option<nsd_core::types::NetworkHandle>,
        resolve_instance_name: Option<&str>,
    ) -> Result<(), nsd_core::error::NsdError> {
        self.0
            .lock()
            .map_err(|_| nsd_core::error::NsdError::Internal)?
            .register_listener(global_id, service_type, network, resolve_instance_name)
    }

    fn unregister_listener(&mut self, global_id: nsd_core::types::TransactionId) {
        if let Ok(mut engine) = self.0.lock() {
            engine.unregister_listener(global_id);
        }
    }
}

impl backends::ManagedAdvertiser for ArcManagedEngine {
    fn add_service(
        &mut self,
        global_id: nsd_core::types::TransactionId,
        info: &nsd_core::types::ServiceInfo,
    ) -> Result<(), nsd_core::error::NsdError> {
        self.0
            .lock()
            .map_err(|_| nsd_core::error::NsdError::Internal)?
            .add_service(global_id, info)
    }

    fn remove_service(&mut self, global_id: nsd_core::types::TransactionId) {
        if let Ok(mut engine) = self.0.lock() {
            engine.remove_service(global_id);
        }
    }
}

/// Initializes the tracing subscriber: stderr always, plus an optional log
/// file under the platform data directory. The `NSD_BROKER_LOG` env var
/// controls the level (default `info`).
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("NSD_BROKER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = BrokerConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("broker.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

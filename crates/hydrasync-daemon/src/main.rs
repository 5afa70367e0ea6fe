//! HydraSync Daemon - Background synchronization service
//!
//! This binary runs as a user service and handles:
//! - Two-way synchronization between the sync root and a store directory
//! - Placeholder state for files whose content stays in the store
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! The daemon wires the folder-backed remote store and the directory
//! materializer into a `SyncEngine`, connects a `FileWatcher` on the sync
//! root, and waits. Shutdown is driven by a `CancellationToken` that is
//! triggered on receipt of SIGTERM or SIGINT.

mod dir_materializer;
mod folder_store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hydrasync_core::config::{expand_home, Config};
use hydrasync_core::domain::PinState;
use hydrasync_sync::watcher::FileWatcher;
use hydrasync_sync::{SyncEngine, SyncState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::dir_materializer::DirMaterializer;
use crate::folder_store::FolderRemoteStore;

#[derive(Debug, Parser)]
#[command(name = "hydrasyncd", version, about = "HydraSync background synchronization daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for per-item sync state (default: the user data dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Create placeholders only; leave content in the store
    #[arg(long)]
    on_demand: bool,
}

/// Load the configuration and reject it if validation finds problems
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()),
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let listed: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("invalid configuration: {}", listed.join("; "));
    }
    Ok(config)
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Lock owner recorded in the store for this process
fn lock_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "hydrasync".to_string());
    format!("{user}:{}", std::process::id())
}

// ============================================================================
// DaemonService
// ============================================================================

/// Main daemon service that orchestrates synchronization
struct DaemonService {
    engine: SyncEngine,
    local_root: PathBuf,
    /// Token for signalling graceful shutdown to all async tasks
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the store and the sync root and builds the engine
    fn new(
        mut config: Config,
        state_dir: PathBuf,
        default_pin: PinState,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let store_dir = expand_home(&config.remote.store_dir);
        let store = Arc::new(
            FolderRemoteStore::new(&store_dir, lock_owner())?
                .with_lock_ttl(config.locking.lock_timeout()),
        );
        if config.sync.remote_root.is_none() {
            config.sync.remote_root = Some(store.root_locator()?.to_string());
        }

        let mapper = config.path_mapper().context("Invalid sync roots")?;
        let local_root = mapper.local_root().as_path().to_path_buf();
        let materializer = Arc::new(
            DirMaterializer::new(&state_dir, mapper, store.clone())?.with_default_pin(default_pin),
        );

        info!(
            store = %store.root().display(),
            local_root = %local_root.display(),
            state_dir = %state_dir.display(),
            pin = ?default_pin,
            "Daemon service created"
        );
        let engine = SyncEngine::new(&config, store, materializer)?;

        Ok(Self {
            engine,
            local_root,
            shutdown,
        })
    }

    /// Runs until shutdown is requested or the engine disables itself
    async fn run(&self) -> Result<()> {
        let (mut watcher, events) = FileWatcher::new()?;
        watcher.watch(&self.local_root)?;
        self.engine.set_local_events(events);

        let mut states = self.engine.subscribe_state();
        self.engine.start_sync().await?;
        info!("Synchronization started");

        let outcome = tokio::select! {
            () = self.shutdown.cancelled() => {
                info!("Shutdown signal received, stopping sync");
                Ok(())
            }
            true = async { states.wait_for(|s| *s == SyncState::Disabled).await.is_ok() } => {
                warn!("Sync engine disabled itself");
                Err(anyhow::anyhow!("sync engine stopped after a process-wide failure"))
            }
        };

        self.engine.stop_sync().await;
        drop(watcher);
        outcome
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    info!("HydraSync daemon starting (hydrasyncd)");

    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hydrasync"),
    };
    let default_pin = if cli.on_demand {
        PinState::Unspecified
    } else {
        PinState::Pinned
    };

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, state_dir, default_pin, shutdown_token)?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("HydraSync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "HydraSync daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================

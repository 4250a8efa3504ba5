//! mailsift - milter daemon entry point

use anyhow::{bail, Context, Result};
use mailsift_common::config::{Config, LoggingConfig};
use mailsift_common::ConfigHandle;
use mailsift_core::{make_callbacks, Filter, Metrics, ModuleRegistry};
use mailsift_storage::{create_store, StoreQueue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Where the milter listens
enum ListenAddr {
    Inet(String),
    Unix(PathBuf),
}

impl ListenAddr {
    fn parse(spec: &str) -> Result<Self> {
        if let Some(addr) = spec.strip_prefix("inet:") {
            Ok(ListenAddr::Inet(addr.to_string()))
        } else if let Some(path) = spec.strip_prefix("unix:") {
            Ok(ListenAddr::Unix(PathBuf::from(path)))
        } else {
            bail!("unsupported listen address {:?}, expected inet:host:port or unix:/path", spec)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = Config::locate()?;
    let config = Arc::new(ConfigHandle::load(config_path.clone())?);
    let current = config.current();

    // Initialize logging
    init_logging(&current.logging);

    info!(
        config = %config_path.display(),
        hostname = %current.server.hostname,
        "Starting mailsift milter..."
    );

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);

    // Initialize record store
    let store = create_store(&current.storage)?;
    let queue = Arc::new(StoreQueue::spawn(store, current.storage.queue_size));

    // Initialize modules
    let modules = Arc::new(ModuleRegistry::from_config(&current)?);
    modules.init_all().await?;
    info!(
        modules = ?modules.enabled().iter().map(|m| m.name().to_string()).collect::<Vec<_>>(),
        ipc = ?modules.ipc_channels(),
        "Modules initialized"
    );

    let filter = Arc::new(Filter::new(
        config.clone(),
        modules.clone(),
        queue.clone(),
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Start session pruner
    let pruner = filter.sessions().spawn_pruner(
        Duration::from_secs(current.milter.prune_interval_secs.max(1)),
        shutdown.clone(),
    );

    // Watch signals
    let signals = {
        let config = config.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_signals(config, shutdown.clone()).await {
                error!("Signal handling failed: {:#}", e);
                shutdown.cancel();
            }
        })
    };

    // Serve until shutdown
    let listen = ListenAddr::parse(&current.milter.listen)?;
    let callbacks = make_callbacks(filter.clone());
    let stop = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };

    let served = match listen {
        ListenAddr::Inet(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            info!("Listening on inet:{}", addr);
            indymilter::run(listener, callbacks, Default::default(), stop).await
        }
        ListenAddr::Unix(path) => {
            if path.exists() {
                warn!(path = %path.display(), "Removing stale milter socket");
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            info!("Listening on unix:{}", path.display());
            let served = indymilter::run(listener, callbacks, Default::default(), stop).await;
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "Failed to remove milter socket: {}", e);
            }
            served
        }
    };
    if let Err(e) = served {
        error!("Milter server error: {}", e);
    }

    info!("Shutting down");

    // Cleanup
    shutdown.cancel();
    signals.abort();
    if let Err(e) = pruner.await {
        warn!("Session pruner ended abnormally: {}", e);
    }

    modules.stop_all().await;
    queue.shutdown().await;

    info!(live_sessions = filter.sessions().len().await, "Final metrics:\n{}", metrics.render());
    info!("mailsift shutdown complete");

    Ok(())
}

/// Stop on SIGINT or SIGTERM, reload configuration on SIGHUP
async fn watch_signals(config: Arc<ConfigHandle>, shutdown: CancellationToken) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = hangup.recv() => {
                // New sessions pick up the reloaded snapshot; modules keep their startup settings
                match config.reload() {
                    Ok(()) => info!("Configuration reloaded on SIGHUP"),
                    Err(e) => error!("Configuration reload failed, keeping previous: {}", e),
                }
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }

    shutdown.cancel();
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

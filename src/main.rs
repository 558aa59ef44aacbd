use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use kashmir::config::Config;
use kashmir::Registry;

const CACHE_DIR: &str = "cache";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    info!(port = config.port, cache_mb = config.cache_size_mb, "starting proxy");

    std::fs::create_dir_all(CACHE_DIR)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(CACHE_DIR, perms)?;
    }

    let registry = Registry::new(std::path::PathBuf::from(CACHE_DIR), config.max_size_bytes());

    // First SIGINT/SIGTERM requests a graceful shutdown; a second one forces
    // immediate exit, mirroring main.c's `running`/`force_shutdown` pair. A
    // watch channel (rather than Notify) is used here because it remembers
    // the last value a receiver has seen even across a tokio::select! that
    // cancels a prior `changed()` wait — the equivalent of the source's
    // durable `volatile sig_atomic_t running` flag.
    let (graceful_tx, graceful_rx) = watch::channel(false);
    spawn_signal_handler(graceful_tx);

    let gc_shutdown = Arc::new(Notify::new());
    let evictor_handle = tokio::spawn(kashmir::evictor::run(registry.clone(), gc_shutdown.clone()));

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");

    kashmir::server::accept_loop(listener, registry.clone(), config.max_clients, graceful_rx).await;

    info!("shutting down gracefully");
    gc_shutdown.notify_waiters();
    kashmir::server::wait_for_active_connections(SHUTDOWN_GRACE).await;
    let _ = evictor_handle.await;
    for entry in registry.shutdown() {
        let _ = tokio::fs::remove_file(&entry.cache_file_path).await;
    }
    info!("shutdown complete");

    Ok(())
}

/// One long-lived task owns both shutdown-signal listeners so a second
/// SIGINT/SIGTERM is observed as a second event rather than racing a fresh
/// `ctrl_c()` registration against the first.
fn spawn_signal_handler(graceful_shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = graceful_shutdown.send(true);
        wait_for_shutdown_signal().await;
        warn!("second shutdown signal received, forcing exit");
        std::process::exit(1);
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! The accept loop: binds connections to the handler, enforces the client
//! limit, and tracks in-flight connections for graceful shutdown. Factored
//! out of `main` so the same loop that runs in production can be driven
//! directly from tests against an ephemeral port.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::handler;
use crate::registry::Registry;

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

struct ConnectionGuard;

impl ConnectionGuard {
    fn enter() -> Self {
        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Acquire)
}

/// Accepts connections until `shutdown` observes a `true` value, spawning one
/// handler task per connection. Connections past `max_clients` are accepted
/// and immediately dropped, since tokio's listener API does not expose the
/// raw OS backlog the source configures directly via `listen()`.
pub async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    max_clients: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        if ACTIVE_CONNECTIONS.load(Ordering::Acquire) >= max_clients {
                            drop(stream);
                            continue;
                        }
                        let _ = stream.set_nodelay(true);
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            let _guard = ConnectionGuard::enter();
                            handler::handle_connection(stream, registry).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

/// Polls `active_connections()` down to zero, giving up after `grace`.
pub async fn wait_for_active_connections(grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while active_connections() > 0 {
        if tokio::time::Instant::now() >= deadline {
            warn!("timed out waiting for in-flight connections, proceeding with shutdown");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

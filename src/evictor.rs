//! Background reclaimer. Wakes every `GC_INTERVAL`, and while the registry
//! is over 90% of its configured max size, evicts the least-recently-used
//! `Complete`, unpinned entry until back under budget or no eligible victim
//! remains.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::registry::Registry;

pub const GC_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until `shutdown` is notified. Exits promptly on shutdown the same
/// way the source's `gc_thread_func` checks `running`/`force_shutdown` at
/// every wake: via `tokio::select!` racing the sleep against the shutdown
/// signal instead of polling a flag.
pub async fn run(registry: Arc<Registry>, shutdown: Arc<tokio::sync::Notify>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(GC_INTERVAL) => {}
            _ = shutdown.notified() => {
                info!("evictor shutting down");
                return;
            }
        }

        loop {
            match registry.evict_one_if_over_budget() {
                Some(entry) => {
                    if let Err(e) = tokio::fs::remove_file(&entry.cache_file_path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            debug!(error = %e, path = ?entry.cache_file_path, "failed to remove cache file");
                        }
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn evicts_down_to_budget() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().to_path_buf(), 1_000_000);

        for i in 0..5 {
            let url = format!("http://x/{i}");
            let entry = registry.find_or_create_pin(&url);
            let bytes = vec![0u8; 200_000];
            entry.write_chunk_to_disk(&bytes).await;
            let added = entry.append_chunk(bytes);
            registry.account_bytes(added);
            entry.mark_complete().await;
            registry.release(&entry);
        }

        assert!(registry.total_size() >= 900_000);

        let mut evicted = 0;
        while registry.evict_one_if_over_budget().is_some() {
            evicted += 1;
        }
        assert!(evicted > 0);
        assert!(registry.total_size() < (registry.max_size() * 9) / 10);
    }
}

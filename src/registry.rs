use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::entry::{Entry, State};
use crate::hash::cache_file_name;

struct RegistryInner {
    entries: HashMap<String, Arc<Entry>>,
    total_size: usize,
}

/// URL -> [`Entry`] map, total-size accounting, and LRU bookkeeping.
///
/// Lock order: registry mutex is always acquired before any entry's own
/// mutex, and is never held across blocking/async I/O.
pub struct Registry {
    cache_dir: PathBuf,
    max_size: usize,
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(cache_dir: PathBuf, max_size: usize) -> Arc<Registry> {
        Arc::new(Registry {
            cache_dir,
            max_size,
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                total_size: 0,
            }),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Atomic lookup-or-insert. If an entry exists, pins and touches it. If
    /// not, constructs a fresh `Loading` entry with one pin already held,
    /// inserts it, and returns it.
    pub fn find_or_create_pin(&self, url: &str) -> Arc<Entry> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get(url) {
            entry.pin();
            debug!(url, "cache hit, pinned existing entry");
            return entry.clone();
        }

        let path = self.cache_dir.join(cache_file_name(url));
        let entry = Entry::new(url.to_string(), path);
        inner.entries.insert(url.to_string(), entry.clone());
        info!(url, "cache miss, created new entry");
        entry
    }

    pub fn release(&self, entry: &Arc<Entry>) {
        entry.unpin();
    }

    /// Adds `delta` bytes to the registry-wide total. Called by the fetcher
    /// after `Entry::append_chunk`, under the registry mutex, honoring the
    /// registry-before-entry lock order (the entry mutex has already been
    /// released by the time this runs).
    pub fn account_bytes(&self, delta: usize) {
        self.inner.lock().total_size += delta;
    }

    /// Finds the least-recently-accessed `Complete`, unpinned entry, if any.
    /// Scans under the registry mutex only; per-entry state reads use each
    /// entry's own (lock-free or briefly-locked) accessors, matching the
    /// source's tail-to-head LRU scan (here a full scan, since a hash map
    /// has no intrinsic order — externally-observable eviction order is
    /// identical: the entry with the smallest `last_accessed` among eligible
    /// ones).
    fn find_eviction_candidate(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|e| e.ref_count() == 0 && e.state() == State::Complete)
            .min_by_key(|e| e.last_accessed_secs())
            .map(|e| e.url.clone())
    }

    /// Evicts at most one entry if total size is over 90% of max, returning
    /// the freed entry (for deleting its on-disk mirror) if one was found.
    pub fn evict_one_if_over_budget(&self) -> Option<Arc<Entry>> {
        if self.total_size() < (self.max_size * 9) / 10 {
            return None;
        }
        let victim_url = self.find_eviction_candidate()?;
        // Re-check eligibility at removal time: the entry could have been
        // re-pinned between the scan and the unlink.
        let mut inner = self.inner.lock();
        let still_eligible = inner
            .entries
            .get(&victim_url)
            .map(|e| e.ref_count() == 0 && e.state() == State::Complete)
            .unwrap_or(false);
        if !still_eligible {
            return None;
        }
        let entry = inner.entries.remove(&victim_url)?;
        inner.total_size = inner.total_size.saturating_sub(entry.total_size());
        drop(inner);
        info!(url = %victim_url, "evicting entry");
        Some(entry)
    }

    /// Frees every entry unconditionally, ignoring refcounts. Callers must
    /// have quiesced all handlers/fetchers first.
    pub fn shutdown(&self) -> Vec<Arc<Entry>> {
        let mut inner = self.inner.lock();
        let entries: Vec<Arc<Entry>> = inner.entries.drain().map(|(_, e)| e).collect();
        inner.total_size = 0;
        entries
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::sync::Notify;

/// Lifecycle state of a cache entry. Progresses `Loading -> {Complete, Error}`
/// and never leaves a terminal state once reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Loading,
    Complete,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Error)
    }
}

/// Mutation-guarded fields of an [`Entry`]. Everything here is append-only or
/// set-at-most-once, as required by the entry invariants.
struct EntryInner {
    state: State,
    status_code: u16,
    headers: Option<Arc<[u8]>>,
    chunks: Vec<Arc<[u8]>>,
    total_size: usize,
    fetcher_active: bool,
    original_request: Option<Arc<[u8]>>,
    cache_fd: Option<File>,
}

/// One cached resource, keyed by URL. Uniquely owned by the [`Registry`];
/// handlers hold non-owning pins via [`Entry::pin`]/[`Entry::unpin`].
///
/// [`Registry`]: crate::registry::Registry
pub struct Entry {
    pub url: String,
    pub cache_file_path: PathBuf,
    ref_count: AtomicUsize,
    last_accessed_secs: AtomicU64,
    notify: Notify,
    inner: Mutex<EntryInner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Entry {
    /// Creates a fresh entry in `Loading` state with one pin already held by
    /// the caller (mirrors `find_or_create_cache_entry`'s `ref_count = 1` on
    /// first creation).
    pub fn new(url: String, cache_file_path: PathBuf) -> Arc<Entry> {
        Arc::new(Entry {
            url,
            cache_file_path,
            ref_count: AtomicUsize::new(1),
            last_accessed_secs: AtomicU64::new(now_secs()),
            notify: Notify::new(),
            inner: Mutex::new(EntryInner {
                state: State::Loading,
                status_code: 0,
                headers: None,
                chunks: Vec::new(),
                total_size: 0,
                fetcher_active: false,
                original_request: None,
                cache_fd: None,
            }),
        })
    }

    pub fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub fn unpin(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of entry with zero ref_count");
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_accessed_secs.store(now_secs(), Ordering::Release);
    }

    pub fn last_accessed_secs(&self) -> u64 {
        self.last_accessed_secs.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    pub fn status_code(&self) -> u16 {
        self.inner.lock().status_code
    }

    /// Atomic "fetcher ignition" check-and-set (spec §4.4 step 4): if the
    /// entry is `Loading` and no fetcher is active, claims the single
    /// fetcher-active token and stores `request` as `original_request` if
    /// unset, returning `true`. Otherwise returns `false` and does nothing.
    pub fn try_ignite_fetcher(&self, request: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Loading && !inner.fetcher_active {
            inner.fetcher_active = true;
            if inner.original_request.is_none() {
                inner.original_request = Some(Arc::from(request));
            }
            true
        } else {
            false
        }
    }

    pub fn original_request(&self) -> Option<Arc<[u8]>> {
        self.inner.lock().original_request.clone()
    }

    /// Fetcher-only: publishes the header block and status code. Pre:
    /// `headers` unset and state is `Loading`.
    pub fn publish_headers(&self, status_code: u16, headers: Vec<u8>) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.headers.is_none());
        debug_assert_eq!(inner.state, State::Loading);
        inner.status_code = status_code;
        inner.headers = Some(Arc::from(headers.into_boxed_slice()));
        self.notify.notify_waiters();
    }

    pub fn headers(&self) -> Option<Arc<[u8]>> {
        self.inner.lock().headers.clone()
    }

    /// Fetcher-only: opens the on-disk mirror for write if not already open.
    pub async fn ensure_cache_file_open(&self) {
        let needs_open = self.inner.lock().cache_fd.is_none();
        if !needs_open {
            return;
        }
        if let Ok(file) = File::create(&self.cache_file_path).await {
            let mut inner = self.inner.lock();
            if inner.cache_fd.is_none() {
                inner.cache_fd = Some(file);
            }
        }
    }

    /// Fetcher-only: appends an owned chunk to the body, updating counters
    /// and notifying consumers. Returns the number of bytes added so the
    /// caller can add it to the registry-wide total under the registry
    /// mutex, per the spec's lock-order requirement (registry mutex
    /// acquired *before* the entry mutex, never the reverse).
    pub fn append_chunk(&self, data: Vec<u8>) -> usize {
        let chunk: Arc<[u8]> = Arc::from(data.into_boxed_slice());
        let added = chunk.len();
        let mut inner = self.inner.lock();
        inner.chunks.push(chunk);
        inner.total_size += added;
        self.notify.notify_waiters();
        added
    }

    /// Writes `data` to the on-disk mirror if a file is open for this entry.
    /// Performed outside both the registry and entry mutexes.
    pub async fn write_chunk_to_disk(&self, data: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.ensure_cache_file_open().await;
        // Take the file out momentarily to avoid holding the sync mutex
        // across an await point.
        let mut file = {
            let mut inner = self.inner.lock();
            inner.cache_fd.take()
        };
        if let Some(f) = file.as_mut() {
            let _ = f.write_all(data).await;
        }
        let mut inner = self.inner.lock();
        if inner.cache_fd.is_none() {
            inner.cache_fd = file;
        }
    }

    /// Snapshot of chunks beyond `from_index`, plus the current state. Used
    /// by the streaming loop to copy references out before releasing the
    /// lock for the actual send.
    pub fn chunks_since(&self, from_index: usize) -> (Vec<Arc<[u8]>>, State) {
        let inner = self.inner.lock();
        let new_chunks = if from_index < inner.chunks.len() {
            inner.chunks[from_index..].to_vec()
        } else {
            Vec::new()
        };
        (new_chunks, inner.state)
    }

    pub fn num_chunks(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    /// Fetcher-only: closes the on-disk mirror, marks the entry complete,
    /// clears the fetcher-active token, and wakes all waiters.
    pub async fn mark_complete(&self) {
        let file = {
            let mut inner = self.inner.lock();
            inner.cache_fd.take()
        };
        drop(file); // closes the fd on drop, outside the lock
        let mut inner = self.inner.lock();
        inner.state = State::Complete;
        inner.fetcher_active = false;
        self.notify.notify_waiters();
    }

    /// Fetcher-only: marks the entry as failed, clears the fetcher-active
    /// token, and wakes all waiters. Terminal; never transitions further.
    pub async fn mark_error(&self) {
        let file = {
            let mut inner = self.inner.lock();
            inner.cache_fd.take()
        };
        drop(file);
        let mut inner = self.inner.lock();
        inner.state = State::Error;
        inner.fetcher_active = false;
        self.notify.notify_waiters();
    }

    /// Registers interest in the next `notify_waiters` call (new chunk,
    /// headers published, or terminal-state transition). Per `Notify`'s
    /// contract, the returned future starts listening as soon as it is
    /// created, *not* on first poll, so the correct race-free pattern is:
    ///
    /// ```ignore
    /// let notified = entry.notified();
    /// if predicate_already_true() { return; }
    /// notified.await;
    /// ```
    ///
    /// i.e. always create the future *before* re-checking the predicate it
    /// guards, never after — this is the "loop on predicate" discipline the
    /// spec requires for tolerating spurious or missed wakeups.
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

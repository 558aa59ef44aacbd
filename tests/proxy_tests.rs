//! End-to-end scenarios driven against a real proxy instance bound to an
//! ephemeral port, with small stub upstream servers standing in for the
//! origin. Mirrors the teacher's testing idiom of exercising the running
//! server over real `TcpStream`s rather than calling internals directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use kashmir::Registry;

/// Starts a proxy against a fresh temp cache dir and returns its address, the
/// registry backing it (for asserting eviction/size state), and a shutdown
/// handle. The accept loop runs on a background task for the test's duration.
async fn start_proxy(max_size_bytes: usize) -> (SocketAddr, Arc<Registry>, TempDir, watch::Sender<bool>) {
    let dir = TempDir::new().unwrap();
    let registry = Registry::new(dir.path().to_path_buf(), max_size_bytes);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);

    let reg = registry.clone();
    tokio::spawn(async move {
        kashmir::server::accept_loop(listener, reg, 1000, rx).await;
    });

    (addr, registry, dir, tx)
}

/// A minimal upstream that accepts `expected_connections` connections, each
/// time writing a fixed response and counting how many connections it saw.
/// Returns the shared counter so tests can assert on coalescing.
fn spawn_stub_upstream(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_stub_upstream_with_delay(response, None)
}

/// Same as `spawn_stub_upstream`, but after writing `prefix` it waits on
/// `resume` before writing the rest of the response — used to hold a fetch
/// mid-stream so a second client can join as a late reader.
fn spawn_stub_upstream_with_delay(
    response: &'static [u8],
    split_and_gate: Option<(usize, tokio::sync::oneshot::Receiver<()>)>,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    tokio::spawn(async move {
        let listener = TcpListener::from_std(std_listener).unwrap();
        let mut gate = split_and_gate;
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            counter_clone.fetch_add(1, Ordering::AcqRel);
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;

            if let Some((split, resume)) = gate.take() {
                let _ = stream.write_all(&response[..split]).await;
                let _ = resume.await;
                let _ = stream.write_all(&response[split..]).await;
            } else {
                let _ = stream.write_all(response).await;
            }
        }
    });

    (addr, counter)
}

async fn send_get(addr: SocketAddr, target: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;
    let req = format!("GET {target} HTTP/1.0\r\nHost: x\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

const STUB_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 11\r\n\r\nhello world";

#[tokio::test]
async fn coalesced_fetch_shares_one_upstream_connection() {
    let (upstream_addr, hits) = spawn_stub_upstream(STUB_RESPONSE);
    let (proxy_addr, _registry, _dir, _shutdown) = start_proxy(10 * 1024 * 1024).await;
    let target = format!("http://{upstream_addr}/shared");

    let a = tokio::spawn(send_get(proxy_addr, &target.clone()));
    let b = tokio::spawn(send_get(proxy_addr, &target));

    let (ra, rb) = tokio::join!(a, b);
    let ra = ra.unwrap().unwrap();
    let rb = rb.unwrap().unwrap();

    assert_eq!(ra, STUB_RESPONSE);
    assert_eq!(rb, STUB_RESPONSE);
    assert_eq!(hits.load(Ordering::Acquire), 1, "expected exactly one upstream connection");
}

#[tokio::test]
async fn late_joiner_receives_full_response() {
    let (resume_tx, resume_rx) = tokio::sync::oneshot::channel();
    // 45 bytes covers the full header block (39 bytes) plus "hello ", so the
    // gate holds back only the tail of the body, after headers are already
    // flowing to the first client.
    let (upstream_addr, hits) =
        spawn_stub_upstream_with_delay(STUB_RESPONSE, Some((45, resume_rx)));
    let (proxy_addr, _registry, _dir, _shutdown) = start_proxy(10 * 1024 * 1024).await;
    let target = format!("http://{upstream_addr}/late");

    let target_a = target.clone();
    let first = tokio::spawn(async move { send_get(proxy_addr, &target_a).await });
    // give the first request time to ignite the fetcher and receive the
    // header+partial-body fragment before the second client joins.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let target_b = target.clone();
    let second = tokio::spawn(async move { send_get(proxy_addr, &target_b).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = resume_tx.send(());

    let (ra, rb) = tokio::join!(first, second);
    let ra = ra.unwrap().unwrap();
    let rb = rb.unwrap().unwrap();

    assert_eq!(ra, STUB_RESPONSE);
    assert_eq!(rb, STUB_RESPONSE, "late joiner must see the full response, including bytes sent before it connected");
    assert_eq!(hits.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn post_completion_hit_makes_no_new_upstream_connection() {
    let (upstream_addr, hits) = spawn_stub_upstream(STUB_RESPONSE);
    let (proxy_addr, _registry, _dir, _shutdown) = start_proxy(10 * 1024 * 1024).await;
    let target = format!("http://{upstream_addr}/cached");

    let first = send_get(proxy_addr, &target).await.unwrap();
    assert_eq!(first, STUB_RESPONSE);
    assert_eq!(hits.load(Ordering::Acquire), 1);

    // give the fetcher a moment to reach Complete and release its fd.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = send_get(proxy_addr, &target).await.unwrap();
    assert_eq!(second, STUB_RESPONSE);
    assert_eq!(hits.load(Ordering::Acquire), 1, "a completed entry must be served without a new upstream fetch");
}

#[tokio::test]
async fn non_get_request_is_rejected_without_creating_an_entry() {
    let (proxy_addr, registry, _dir, _shutdown) = start_proxy(10 * 1024 * 1024).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(b"POST http://example.invalid/x HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();

    assert_eq!(out, b"HTTP/1.0 501 Not Implemented\r\n\r\n");
    assert_eq!(registry.len(), 0, "a rejected non-GET request must not create a cache entry");
}

#[tokio::test]
async fn unreachable_upstream_closes_connection_without_response_bytes() {
    // Bind then immediately drop the listener: the port is very likely free
    // afterward and nothing answers there, so the connect attempt fails.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (proxy_addr, registry, _dir, _shutdown) = start_proxy(10 * 1024 * 1024).await;
    let target = format!("http://{dead_addr}/nope");

    let response = send_get(proxy_addr, &target).await.unwrap();
    assert!(response.is_empty(), "client must get no bytes when the upstream fetch errors out");

    let entry = registry.find_or_create_pin(&target);
    assert_eq!(entry.state(), kashmir::State::Error);
    registry.release(&entry);
}

#[tokio::test]
async fn eviction_reclaims_space_under_pressure() {
    // 1 MiB budget, ten 200 KiB bodies fetched one at a time: well over
    // budget unless the evictor reclaims completed, unpinned entries.
    let (upstream_addr, _hits) = spawn_large_body_upstream(200 * 1024);
    let (proxy_addr, registry, _dir, _shutdown) = start_proxy(1024 * 1024).await;

    for i in 0..10 {
        let target = format!("http://{upstream_addr}/item{i}");
        let response = send_get(proxy_addr, &target).await.unwrap();
        let header_end = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i + 4)
            .unwrap();
        assert_eq!(response.len() - header_end, 200 * 1024);
    }

    // let the background evictor (GC_INTERVAL = 5s) catch up, or drive it
    // directly via the registry since GC_INTERVAL is longer than a test
    // should sleep for.
    let mut reclaimed = false;
    for _ in 0..20 {
        if registry.total_size() < registry.max_size() {
            reclaimed = true;
            break;
        }
        if registry.evict_one_if_over_budget().is_none() {
            break;
        }
        reclaimed = true;
    }

    assert!(reclaimed, "evictor must reclaim space once the registry is over budget");
    assert!(registry.total_size() <= registry.max_size());
}

/// An upstream whose response body is `body_len` bytes of filler, with a
/// correct Content-Length header; a fresh connection is accepted for every
/// request so each of the ten fetches in the eviction test gets its own.
fn spawn_large_body_upstream(body_len: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let counter_clone = counter.clone();

    tokio::spawn(async move {
        let listener = TcpListener::from_std(std_listener).unwrap();
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            counter_clone.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let header = format!("HTTP/1.0 200 OK\r\nContent-Length: {body_len}\r\n\r\n");
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&vec![b'x'; body_len]).await;
            });
        }
    });

    (addr, counter)
}

//! The client handler: parses one request, pins an entry, ignites a fetcher
//! if needed, and streams the entry out incrementally as bytes arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::entry::State;
use crate::fetcher;
use crate::registry::Registry;

const MAX_REQUEST_SIZE: usize = 16384;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const RESP_501: &[u8] = b"HTTP/1.0 501 Not Implemented\r\n\r\n";

/// Reads bytes from `stream` up to and including the first `\r\n\r\n`,
/// bounded by `MAX_REQUEST_SIZE`, stopping early on peer close. Scans
/// bytewise, never assuming the whole buffer is valid UTF-8 before the
/// request line is isolated (spec Open Question 4).
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() >= MAX_REQUEST_SIZE {
            break;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

/// Parses method, request-target, and version from the first line of a raw
/// request buffer. Returns `None` on a malformed first line.
fn parse_request_line(buf: &[u8]) -> Option<(&[u8], &str, &str)> {
    let line_end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    let line = &buf[..line_end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let target = std::str::from_utf8(target).ok()?;
    let version = std::str::from_utf8(version).ok()?;
    if method.is_empty() || target.is_empty() || version.is_empty() {
        return None;
    }
    Some((method, target, version))
}

async fn write_all_ignore_broken_pipe(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(data).await
}

#[instrument(skip(stream, registry))]
pub async fn handle_connection(mut stream: TcpStream, registry: Arc<Registry>) {
    let result = timeout(CONNECTION_TIMEOUT, handle_connection_inner(&mut stream, &registry)).await;
    if result.is_err() {
        debug!("connection handling timed out");
    }
}

async fn handle_connection_inner(stream: &mut TcpStream, registry: &Arc<Registry>) {
    let raw_request = match read_request(stream).await {
        Ok(buf) => buf,
        Err(_) => return,
    };
    if raw_request.is_empty() {
        return;
    }

    let (method, target, _version) = match parse_request_line(&raw_request) {
        Some(parts) => parts,
        None => return, // malformed first line: close silently
    };

    if method != b"GET" {
        let _ = write_all_ignore_broken_pipe(stream, RESP_501).await;
        return;
    }

    let entry = registry.find_or_create_pin(target);

    if entry.try_ignite_fetcher(&raw_request) {
        tokio::spawn(fetcher::run_fetch(entry.clone(), registry.clone()));
    }

    if let Err(e) = stream_entry_to_client(stream, &entry).await {
        warn!(error = %e, "error streaming entry to client");
    }

    registry.release(&entry);
}

async fn stream_entry_to_client(
    stream: &mut TcpStream,
    entry: &Arc<crate::entry::Entry>,
) -> std::io::Result<()> {
    // Wait until headers are published or the entry reaches a terminal
    // state. An entry that goes terminal with no headers ever published
    // (upstream closed before the status line completed) is treated the
    // same as an error: close without sending data.
    loop {
        let notified = entry.notified();
        let headers = entry.headers();
        let state = entry.state();
        if headers.is_some() || state.is_terminal() {
            break;
        }
        notified.await;
    }

    let headers = match entry.headers() {
        Some(h) => h,
        None => return Ok(()), // terminal with no headers: nothing to send
    };

    stream.write_all(&headers).await?;

    let mut chunks_sent = 0usize;
    loop {
        let notified = entry.notified();
        let (new_chunks, state) = entry.chunks_since(chunks_sent);
        for chunk in &new_chunks {
            stream.write_all(chunk).await?;
            chunks_sent += 1;
        }

        if state.is_terminal() && chunks_sent >= entry.num_chunks() {
            break;
        }
        if state.is_terminal() {
            // A last chunk may have landed between the snapshot above and
            // this check; loop once more to drain it without waiting.
            continue;
        }
        notified.await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let (m, t, v) = parse_request_line(b"GET http://x/ HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(m, b"GET");
        assert_eq!(t, "http://x/");
        assert_eq!(v, "HTTP/1.0");
    }

    #[test]
    fn rejects_extra_tokens() {
        assert!(parse_request_line(b"GET http://x/ HTTP/1.0 extra\r\n").is_none());
    }

    #[test]
    fn rejects_missing_tokens() {
        assert!(parse_request_line(b"GET http://x/\r\n").is_none());
    }

    #[test]
    fn post_is_parsed_but_not_get() {
        let (m, _, _) = parse_request_line(b"POST http://x/ HTTP/1.0\r\n").unwrap();
        assert_eq!(m, b"POST");
    }
}

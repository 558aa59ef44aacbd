//! The fetcher: the single producer that drives an [`Entry`] from `Loading`
//! to a terminal state by talking to the upstream origin. Runs once per
//! entry (enforced by `Entry::try_ignite_fetcher`) and never re-enters the
//! registry — it works solely through the entry's own interface.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::entry::Entry;
use crate::error::FetchError;
use crate::registry::Registry;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 8192;
const INITIAL_HEADER_BUFFER: usize = 16384;

/// Parses `http://host[:port]/path` into its parts. `https://` is
/// unsupported and reported as [`FetchError::UnsupportedScheme`].
pub fn parse_url(url: &str) -> Result<(String, u16, String), FetchError> {
    if url.starts_with("https://") {
        return Err(FetchError::UnsupportedScheme(url.to_string()));
    }
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| FetchError::MalformedUrl(url.to_string()))?;
    if rest.is_empty() {
        return Err(FetchError::MalformedUrl(url.to_string()));
    }

    let slash_pos = rest.find('/');
    let authority = match slash_pos {
        Some(i) => &rest[..i],
        None => rest,
    };
    let path = match slash_pos {
        Some(i) => rest[i..].to_string(),
        None => "/".to_string(),
    };

    let (host, port) = match authority.rfind(':') {
        Some(i) => {
            let host = &authority[..i];
            let port: u16 = authority[i + 1..]
                .parse()
                .map_err(|_| FetchError::MalformedUrl(url.to_string()))?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), 80),
    };

    if host.is_empty() {
        return Err(FetchError::MalformedUrl(url.to_string()));
    }

    Ok((host, port, path))
}

/// Scans `buf` bytewise for the first `\r\n\r\n`, returning the index just
/// past it. Scans the raw bytes, never a lossily-decoded string, so an
/// embedded NUL or non-UTF-8 body fragment pulled in early can't derail
/// detection (spec Open Question 4).
fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Extracts the integer status code: the second whitespace-separated token
/// of the status line (the first line of `headers`).
fn extract_status_code(headers: &[u8]) -> u16 {
    let first_line_end = headers.iter().position(|&b| b == b'\n').unwrap_or(headers.len());
    let first_line = &headers[..first_line_end];
    let text = String::from_utf8_lossy(first_line);
    text.split_whitespace()
        .nth(1)
        .and_then(|tok| tok.parse::<u16>().ok())
        .unwrap_or(0)
}

/// Drives `entry` from `Loading` to `Complete` or `Error`. Spawned once per
/// entry by the client handler under `try_ignite_fetcher`'s guarantee.
#[instrument(skip(entry, registry), fields(url = %entry.url))]
pub async fn run_fetch(entry: Arc<Entry>, registry: Arc<Registry>) {
    if let Err(e) = run_fetch_inner(&entry, &registry).await {
        warn!(error = %e, "fetch failed");
        entry.mark_error().await;
    }
}

async fn run_fetch_inner(entry: &Arc<Entry>, registry: &Arc<Registry>) -> Result<(), FetchError> {
    let (host, port, _path) = parse_url(&entry.url)?;

    let request = entry
        .original_request()
        .ok_or_else(|| FetchError::MalformedUrl(entry.url.clone()))?;

    let mut stream = timeout(UPSTREAM_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(|source| FetchError::Connect { host: host.clone(), port, source })?;

    timeout(UPSTREAM_TIMEOUT, stream.write_all(&request))
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Write)?;

    let mut header_buf = Vec::with_capacity(INITIAL_HEADER_BUFFER);
    let mut read_buf = vec![0u8; CHUNK_SIZE];
    let header_end = loop {
        let n = timeout(UPSTREAM_TIMEOUT, stream.read(&mut read_buf))
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Read)?;
        if n == 0 {
            // Upstream closed before completing the header block. Mirrors
            // the source's `download_thread`, which always calls
            // `download_complete` on EOF regardless of header state: the
            // entry reaches `Complete` with `headers` left unset. The
            // handler treats "terminal with no headers" the same as an
            // error (closes without sending data).
            entry.mark_complete().await;
            return Ok(());
        }
        header_buf.extend_from_slice(&read_buf[..n]);
        if let Some(end) = find_header_terminator(&header_buf) {
            break end;
        }
    };

    let status_code = extract_status_code(&header_buf[..header_end]);
    let headers = header_buf[..header_end].to_vec();
    entry.publish_headers(status_code, headers);

    // Bytes beyond the header terminator are body, regardless of status
    // code (spec Open Question 1: the source's off-by-one on non-200
    // responses is a bug, not a behavior to preserve).
    if header_end < header_buf.len() {
        let first_body_fragment = header_buf[header_end..].to_vec();
        append_and_account(entry, registry, first_body_fragment).await;
    }

    loop {
        let n = match timeout(UPSTREAM_TIMEOUT, stream.read(&mut read_buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(FetchError::Read(e)),
            Err(_) => return Err(FetchError::Timeout),
        };
        if n == 0 {
            break;
        }
        append_and_account(entry, registry, read_buf[..n].to_vec()).await;
    }

    entry.mark_complete().await;
    info!("fetch complete");
    Ok(())
}

/// Appends to the in-memory chunk list and broadcasts *before* touching disk,
/// so a chunk becomes visible to streaming clients the instant it's appended
/// rather than after a write(2) call completes. Disk persistence runs last,
/// outside both the entry and registry mutexes.
async fn append_and_account(entry: &Arc<Entry>, registry: &Arc<Registry>, data: Vec<u8>) {
    let disk_copy = data.clone();
    let added = entry.append_chunk(data);
    registry.account_bytes(added);
    entry.write_chunk_to_disk(&disk_copy).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_path() {
        assert_eq!(
            parse_url("http://example.com:8080/a/b").unwrap(),
            ("example.com".to_string(), 8080, "/a/b".to_string())
        );
    }

    #[test]
    fn defaults_to_port_80() {
        assert_eq!(
            parse_url("http://example.com/").unwrap(),
            ("example.com".to_string(), 80, "/".to_string())
        );
    }

    #[test]
    fn defaults_to_root_path() {
        assert_eq!(
            parse_url("http://example.com").unwrap(),
            ("example.com".to_string(), 80, "/".to_string())
        );
    }

    #[test]
    fn https_is_rejected() {
        assert!(matches!(
            parse_url("https://example.com/"),
            Err(FetchError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn missing_scheme_is_malformed() {
        assert!(matches!(parse_url("example.com/"), Err(FetchError::MalformedUrl(_))));
    }

    #[test]
    fn header_terminator_scan_finds_crlfcrlf() {
        let buf = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let end = find_header_terminator(buf).unwrap();
        assert_eq!(&buf[end..], b"hello");
    }

    #[test]
    fn header_terminator_scan_is_bytewise_safe_around_nuls() {
        let mut buf = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        buf.extend_from_slice(&[0u8, 1, 2, 3]);
        let end = find_header_terminator(&buf).unwrap();
        assert_eq!(end, 20);
    }

    #[test]
    fn status_code_extraction() {
        assert_eq!(extract_status_code(b"HTTP/1.0 404 Not Found\r\n"), 404);
        assert_eq!(extract_status_code(b"HTTP/1.1 200 OK\r\n"), 200);
        assert_eq!(extract_status_code(b"garbage"), 0);
    }
}

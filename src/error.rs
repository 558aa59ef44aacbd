use thiserror::Error;

/// Errors raised while parsing CLI arguments.
#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    #[error("invalid cache size: {0}")]
    InvalidCacheSize(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
}

/// Errors raised while a fetcher drives an entry from LOADING to a terminal
/// state. Every variant maps to `mark_error` in the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported scheme in url: {0}")]
    UnsupportedScheme(String),
    #[error("malformed url: {0}")]
    MalformedUrl(String),
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("write to upstream failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("read from upstream failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("timed out waiting on upstream")]
    Timeout,
}

use clap::Parser;

use crate::error::ArgsError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CACHE_SIZE_MB: u64 = 100;
pub const MAX_CLIENTS: usize = 1000;

/// A forward HTTP caching proxy with coalesced, streamed fetches.
///
/// Accepts `prog`, `prog PORT`, and `prog PORT CACHE_MB` as positional
/// shorthand for `-p`/`-c`, matching the shape of the original proxy's
/// argument parser.
#[derive(Parser, Debug)]
#[command(name = "kashmir", about, long_about = None)]
struct Cli {
    /// Listen port
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Cache size in MB
    #[arg(short = 'c', long = "cache")]
    cache: Option<u64>,

    /// Positional PORT [CACHE_MB]
    #[arg(value_name = "PORT")]
    pos_port: Option<String>,

    #[arg(value_name = "CACHE_MB")]
    pos_cache: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_size_mb: u64,
    pub max_clients: usize,
}

impl Config {
    pub fn max_size_bytes(&self) -> usize {
        self.cache_size_mb as usize * 1024 * 1024
    }

    /// Parses configuration from `std::env::args_os()`, applying the same
    /// positional/flag shorthand the original implementation accepted.
    pub fn from_args() -> Result<Self, ArgsError> {
        Self::from_iter(std::env::args_os())
    }

    fn from_iter<I, T>(args: I) -> Result<Self, ArgsError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ArgsError::UnknownOption(e.to_string()))?;

        let mut port = DEFAULT_PORT;
        let mut cache_size_mb = DEFAULT_CACHE_SIZE_MB;

        if let Some(p) = cli.port {
            if p == 0 {
                return Err(ArgsError::InvalidPort(p.to_string()));
            }
            port = p;
        } else if let Some(pos) = &cli.pos_port {
            port = pos
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(|| ArgsError::InvalidPort(pos.clone()))?;
        }

        if let Some(c) = cli.cache {
            if c == 0 {
                return Err(ArgsError::InvalidCacheSize(c.to_string()));
            }
            cache_size_mb = c;
        } else if let Some(pos) = &cli.pos_cache {
            cache_size_mb = pos
                .parse::<u64>()
                .ok()
                .filter(|c| *c > 0)
                .ok_or_else(|| ArgsError::InvalidCacheSize(pos.clone()))?;
        }

        Ok(Config {
            port,
            cache_size_mb,
            max_clients: MAX_CLIENTS,
        })
    }
}

use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tidepool_core::{ChunkPartitioner, Domain, DEFAULT_MAX_CHAT_LEN};

use crate::session::SessionConfig;

#[derive(Debug, Parser)]
#[command(
    name = "tidepool-server",
    author,
    version,
    about = "Authoritative server for one shared grid of toggleable cells"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "TIDEPOOL_LISTEN_ADDR", default_value = "0.0.0.0:3001")]
    pub listen_addr: String,

    /// Total number of cells in the grid.
    #[arg(long, env = "TIDEPOOL_DOMAIN_SIZE", default_value_t = 100_000_000)]
    pub domain_size: u64,

    /// Cells per chunk served by `request-checkbox-chunk`.
    #[arg(long, env = "TIDEPOOL_CHUNK_SIZE", default_value_t = 1_000_000)]
    pub chunk_size: u64,

    /// Longest chat message accepted, in characters.
    #[arg(long, env = "TIDEPOOL_MAX_CHAT_LEN", default_value_t = DEFAULT_MAX_CHAT_LEN)]
    pub max_chat_len: usize,

    /// Domains up to this size ship their full index list with `initial-state`.
    #[arg(long, env = "TIDEPOOL_INLINE_SNAPSHOT_LIMIT", default_value_t = 100_000)]
    pub inline_snapshot_limit: u64,

    /// Outbound frames buffered per connection before it is evicted.
    #[arg(long, env = "TIDEPOOL_PER_CONNECTION_BUFFER", default_value_t = 256)]
    pub per_connection_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub partitioner: ChunkPartitioner,
    pub max_chat_len: usize,
    pub inline_snapshot_limit: u64,
    pub session: SessionConfig,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// In-process configuration, mostly for tests.
    pub fn new(domain_size: u64, chunk_size: u64) -> Result<Self> {
        let domain = Domain::new(domain_size).context("invalid domain size")?;
        let partitioner = ChunkPartitioner::new(domain, chunk_size).context("invalid chunk size")?;
        Ok(Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            partitioner,
            max_chat_len: DEFAULT_MAX_CHAT_LEN,
            inline_snapshot_limit: 0,
            session: SessionConfig::default(),
            shutdown_grace: Duration::ZERO,
        })
    }

    pub fn domain(&self) -> Domain {
        self.partitioner.domain()
    }

    pub fn ships_inline_snapshot(&self) -> bool {
        self.domain().size() <= self.inline_snapshot_limit
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.per_connection_buffer == 0 {
            anyhow::bail!("per-connection buffer must be greater than zero");
        }
        let mut config = ServerConfig::new(cli.domain_size, cli.chunk_size)?;
        config.listen_addr = listen_addr;
        config.max_chat_len = cli.max_chat_len;
        config.inline_snapshot_limit = cli.inline_snapshot_limit;
        config.session = SessionConfig {
            per_connection_buffer: cli.per_connection_buffer,
        };
        config.shutdown_grace = Duration::from_secs(cli.shutdown_grace_secs);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["tidepool-server"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults_describe_the_large_grid() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.domain().size(), 100_000_000);
        assert_eq!(config.partitioner.chunk_size(), 1_000_000);
        assert_eq!(config.max_chat_len, 100);
        assert!(!config.ships_inline_snapshot());
    }

    #[test_timeout::timeout]
    fn small_domains_ship_inline() {
        let config = parse(&["--domain-size", "5000"]).unwrap();
        assert!(config.ships_inline_snapshot());
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--domain-size", "0"]).is_err());
        assert!(parse(&["--chunk-size", "0"]).is_err());
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--per-connection-buffer", "0"]).is_err());
    }
}

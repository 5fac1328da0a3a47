use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;
use tidepool_core::DEFAULT_MAX_CHAT_LEN;

use crate::{
    layout::GridMetrics,
    logging::{LogConfig, LogLevel},
    reactor::ClientConfig,
    viewport::ViewportConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "tidepool",
    author,
    version,
    about = "Terminal viewer for the tidepool shared grid"
)]
pub struct Cli {
    /// WebSocket endpoint of the server.
    #[arg(long, env = "TIDEPOOL_URL", default_value = "ws://127.0.0.1:3001/ws")]
    pub url: String,

    /// Grid size assumed until the server reports its own.
    #[arg(long, env = "TIDEPOOL_DOMAIN_SIZE", default_value_t = 100_000_000)]
    pub domain_size: u64,

    /// Cells per chunk; must match the server.
    #[arg(long, env = "TIDEPOOL_CHUNK_SIZE", default_value_t = 1_000_000)]
    pub chunk_size: u64,

    /// Longest chat message sent, in characters.
    #[arg(long, env = "TIDEPOOL_MAX_CHAT_LEN", default_value_t = DEFAULT_MAX_CHAT_LEN)]
    pub max_chat_len: usize,

    /// Cells created per frame.
    #[arg(long, default_value_t = 100)]
    pub render_batch: usize,

    /// Rows kept rendered above and below the screen.
    #[arg(long, default_value_t = 1)]
    pub viewport_buffer: u64,

    /// Frame period in milliseconds.
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    /// Append logs to this file; without it logs are discarded.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub url: String,
    pub client: ClientConfig,
    pub frame: Duration,
    pub log: LogConfig,
}

impl TryFrom<Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if !(cli.url.starts_with("ws://") || cli.url.starts_with("wss://")) {
            bail!("server url must start with ws:// or wss://: {}", cli.url);
        }
        if cli.domain_size == 0 {
            bail!("domain size must be greater than zero");
        }
        if cli.chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if cli.render_batch == 0 {
            bail!("render batch must be greater than zero");
        }
        let metrics = GridMetrics::terminal();
        Ok(Self {
            url: cli.url,
            client: ClientConfig {
                expected_domain_size: cli.domain_size,
                chunk_size: cli.chunk_size,
                render_batch: cli.render_batch,
                viewport: ViewportConfig {
                    row_height: metrics.row_height,
                    buffer_rows: cli.viewport_buffer,
                },
                metrics,
                max_chat_len: cli.max_chat_len,
            },
            frame: Duration::from_millis(cli.frame_ms.max(1)),
            log: LogConfig {
                level: cli.log_level,
                file: cli.log_file,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<AppConfig> {
        let mut argv = vec!["tidepool"];
        argv.extend_from_slice(args);
        AppConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test_timeout::timeout]
    fn defaults_point_at_a_local_server() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.url, "ws://127.0.0.1:3001/ws");
        assert_eq!(config.client.chunk_size, 1_000_000);
        assert_eq!(config.client.render_batch, 100);
        assert_eq!(config.client.viewport.buffer_rows, 1);
        assert_eq!(config.frame, Duration::from_millis(16));
        assert_eq!(config.log.level, LogLevel::Warn);
        assert!(config.log.file.is_none());
    }

    #[test_timeout::timeout]
    fn rejects_unusable_values() {
        assert!(parse(&["--url", "http://example.com"]).is_err());
        assert!(parse(&["--chunk-size", "0"]).is_err());
        assert!(parse(&["--render-batch", "0"]).is_err());
        assert!(parse(&["--log-level", "loud"]).is_err());
    }
}

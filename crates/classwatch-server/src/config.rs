//! Command-line and environment configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ingest::IngestConfig;

/// Live classroom session hub.
#[derive(Debug, Clone, Parser)]
#[command(name = "classwatch", version, about)]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "CLASSWATCH_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// HTTP / WebSocket port
    #[arg(long, env = "CLASSWATCH_PORT", default_value_t = 3927)]
    pub port: u16,

    /// SQLite database file (default: platform data directory)
    #[arg(long = "db", env = "CLASSWATCH_DB")]
    pub db_path: Option<PathBuf>,

    /// Accepted bearer tokens as `token=user,token=user`
    #[arg(long, env = "CLASSWATCH_TOKENS", default_value = "", hide_env_values = true)]
    pub tokens: String,

    /// Seconds between liveness probes
    #[arg(long, env = "CLASSWATCH_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Trailing delay before session counters are written
    #[arg(long, env = "CLASSWATCH_FLUSH_DELAY_MS", default_value_t = 2000)]
    pub flush_delay_ms: u64,

    /// Base URL of the analysis engine; polling and report merge are off without it
    #[arg(long, env = "CLASSWATCH_ENGINE_URL")]
    pub engine_url: Option<String>,

    /// Upper bound on any single engine call
    #[arg(long, env = "CLASSWATCH_ENGINE_TIMEOUT_MS", default_value_t = 3000)]
    pub engine_timeout_ms: u64,

    /// Seconds between engine metric polls
    #[arg(long, env = "CLASSWATCH_ENGINE_POLL_SECS", default_value_t = 5)]
    pub engine_poll_secs: u64,

    /// Default timeline bucket width
    #[arg(long, env = "CLASSWATCH_TIMELINE_INTERVAL_MS", default_value_t = classwatch_core::DEFAULT_TIMELINE_INTERVAL_MS)]
    pub timeline_interval_ms: i64,

    /// Emit logs as JSON lines
    #[arg(long, env = "CLASSWATCH_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms.max(1))
    }

    pub fn engine_poll_interval(&self) -> Duration {
        Duration::from_secs(self.engine_poll_secs.max(1))
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            flush_delay: Duration::from_millis(self.flush_delay_ms),
            engine_timeout: self.engine_timeout(),
            timeline_interval_ms: self.timeline_interval_ms.max(1),
        }
    }
}

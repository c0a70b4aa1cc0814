use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::heartbeat;

const DEFAULT_PORT: u16 = 3001;

/// Real-time notification server
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::Parser))]
#[cfg_attr(
    feature = "cli",
    command(name = "finreview-realtime", version, about = "Real-time notification server")
)]
pub struct Config {
    /// Address to listen on
    #[cfg_attr(
        feature = "cli",
        arg(long, env = "FINREVIEW_BIND", default_value = "0.0.0.0:3001")
    )]
    pub bind: SocketAddr,

    /// Seconds between heartbeat broadcasts
    #[cfg_attr(
        feature = "cli",
        arg(
            long = "heartbeat-interval-secs",
            env = "FINREVIEW_HEARTBEAT_SECS",
            default_value_t = 30,
            value_parser = clap::value_parser!(u64).range(1..)
        )
    )]
    pub heartbeat_interval_secs: u64,

    /// Enable structured JSON logging
    #[cfg_attr(feature = "cli", arg(long, env = "FINREVIEW_JSON_LOGS"))]
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            heartbeat_interval_secs: heartbeat::DEFAULT_INTERVAL.as_secs(),
            json_logs: false,
        }
    }
}

impl Config {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

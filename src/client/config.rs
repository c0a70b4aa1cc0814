#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;

use crate::SOCKET_PATH;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_STREAM_CAPACITY: usize = 1024;

/// Configuration for the reconnecting socket client.
///
/// ```
/// use finreview_realtime::client::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .user_id("analyst-17")
///     .reconnect(ReconnectConfig::builder().max_attempts(10).build())
///     .build();
/// assert_eq!(config.socket_path, "/ws");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Retry policy applied after the transport closes
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Path the endpoint is derived with by [`super::Client::from_origin`]
    #[builder(into, default = SOCKET_PATH.to_owned())]
    pub socket_path: String,
    /// Identity token attached to outbound chat and analysis frames
    #[builder(into)]
    pub user_id: Option<String>,
    /// Capacity of the broadcast channel backing [`super::Client::stream`]
    #[builder(default = DEFAULT_STREAM_CAPACITY)]
    pub stream_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Bounded, fixed-interval reconnection.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ReconnectConfig {
    /// Schedule a new attempt after an unrequested close
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Attempts allowed within one disconnection episode
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
    /// Delay before each attempt
    #[builder(default = DEFAULT_RETRY_INTERVAL)]
    pub interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectConfig {
    /// A policy that never schedules a retry.
    #[must_use]
    pub fn disabled() -> Self {
        Self::builder().auto_reconnect(false).build()
    }
}

impl From<&ReconnectConfig> for Constant {
    fn from(config: &ReconnectConfig) -> Self {
        Constant::new(config.interval)
    }
}

//! Periodic liveness broadcast.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::hub::Hub;
use crate::types::Frame;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Spawn the emitter for `hub`. It stops when `token` is cancelled or the hub is dropped.
pub(crate) fn spawn(
    runtime: &Handle,
    hub: Weak<Hub>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(run(hub, period.max(MIN_INTERVAL), token))
}

async fn run(hub: Weak<Hub>, period: Duration, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                let delivered = hub.broadcast(&Frame::heartbeat());

                #[cfg(feature = "tracing")]
                tracing::debug!(delivered, "heartbeat sent");
                #[cfg(not(feature = "tracing"))]
                let _ = delivered;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("heartbeat stopped");
}

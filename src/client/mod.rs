//! Reconnecting socket client.
//!
//! A [`Client`] is a cheap-to-clone handle to one background driver task. The driver owns
//! the single transport, the retry timer and inbound dispatch; handles send it commands
//! and read shared state.
//!
//! # Example
//!
//! ```rust, no_run
//! use finreview_realtime::client::{Client, config::Config};
//! use finreview_realtime::types::{Frame, frame_type};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder().user_id("analyst-17").build();
//!     let client = Client::from_origin("https://app.finreview.app", config)?;
//!
//!     let _updates = client.subscribe(frame_type::ANALYSIS_UPDATE, |frame: &Frame| {
//!         println!("analysis progress: {frame:?}");
//!     });
//!
//!     client.connect();
//!     client.send_chat("Reviewed the Q3 balance sheet");
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod registry;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use url::Url;

use self::config::Config;
use self::connection::{
    CloseEvent, Command, ConnectRequest, ConnectionStatus, Driver, Shared,
};
pub use self::error::WsError;
use self::registry::{Subscription, TopicRegistry};
use crate::Result;
use crate::error::{Error, Kind};
use crate::types::Frame;

/// Handle to a reconnecting socket connection.
///
/// Clones share one transport, one topic registry and one set of lifecycle listeners.
/// Dropping the last clone stops the driver and moves the status to
/// [`ConnectionStatus::Closed`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Client {
    /// Create a client for a `ws://` or `wss://` endpoint. No transport is opened until
    /// [`Client::connect`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(endpoint: Url, config: Config) -> Result<Self> {
        endpoint::validate(&endpoint)?;
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Validation, e))?;

        let shared = Arc::new(Shared::new(endpoint, config));
        let (commands, command_rx) = mpsc::unbounded_channel();
        runtime.spawn(Driver::new(Arc::clone(&shared), command_rx).run());

        Ok(Self {
            inner: Arc::new(ClientInner { shared, commands }),
        })
    }

    /// Create a client for the page served from `origin`, see [`endpoint::from_origin`].
    pub fn from_origin(origin: &str, config: Config) -> Result<Self> {
        let endpoint = endpoint::from_origin(origin, &config.socket_path)?;
        Self::new(endpoint, config)
    }

    /// Open the transport. Does nothing while one is open or opening.
    ///
    /// A pending retry is cancelled and replaced by an immediate attempt. During a
    /// [`Client::disconnect`] close handshake the request is held and the transport is
    /// reopened once the close completes.
    pub fn connect(&self) {
        match self.inner.shared.begin_connect() {
            ConnectRequest::Started => {
                _ = self.inner.commands.send(Command::Connect);
            }
            ConnectRequest::Deferred => {
                #[cfg(feature = "tracing")]
                tracing::debug!("connect deferred until close completes");
            }
            ConnectRequest::Ignored => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    status = %self.status(),
                    "connect ignored, socket already active"
                );
            }
        }
    }

    /// Cancel any pending retry, close the transport if present and reset the attempt
    /// counter. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Disconnect(ack)).is_err() {
            return;
        }
        _ = done.await;
    }

    /// Transmit `frame` if the transport is open. Never queues.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.status().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                frame_type = %frame.frame_type(),
                "not connected, frame dropped"
            );
            return false;
        }

        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "failed to encode frame");
                #[cfg(not(feature = "tracing"))]
                let _: &Error = &e;
                return false;
            }
        };

        self.inner.commands.send(Command::Send(text)).is_ok()
    }

    /// Send a `ping` stamped with the current time.
    ///
    /// The matching `pong` updates [`Client::round_trip`].
    pub fn send_ping(&self) -> bool {
        let ping = Frame::ping();
        if let Some(timestamp) = ping.timestamp() {
            self.inner.shared.record_ping(timestamp);
        }
        self.send(&ping)
    }

    pub fn send_chat<S: Into<String>>(&self, message: S) -> bool {
        self.send(&Frame::chat(self.inner.shared.config.user_id.clone(), message))
    }

    pub fn send_analysis_update<A: Into<String>, S: Into<String>>(
        &self,
        analysis_id: A,
        status: S,
    ) -> bool {
        self.send(&Frame::analysis_update(
            self.inner.shared.config.user_id.clone(),
            analysis_id,
            status,
        ))
    }

    /// Call `handler` for every inbound frame whose `type` equals `msg_type`, until the
    /// returned guard is dropped.
    pub fn subscribe<T, F>(&self, msg_type: T, handler: F) -> Subscription
    where
        T: Into<String>,
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner.shared.registry.subscribe(msg_type, handler)
    }

    /// Inbound frames of one type as a stream.
    ///
    /// A consumer that falls behind by more than the configured stream capacity receives
    /// a [`WsError::Lagged`] item, after which the stream ends.
    pub fn stream(&self, msg_type: &str) -> impl Stream<Item = Result<Frame>> + use<> {
        let mut rx = self.inner.shared.frames.subscribe();
        let target = msg_type.to_owned();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if frame.frame_type() == target {
                            yield frame;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("frame stream lagged, missed {n} frames");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    /// Call `listener` each time a transport opens.
    pub fn on_open<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Url) + Send + Sync + 'static,
    {
        self.inner.shared.on_open.add(listener)
    }

    /// Call `listener` each time a transport closes or an attempt fails.
    pub fn on_close<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        self.inner.shared.on_close.add(listener)
    }

    /// Call `listener` for each transport error. A close notification follows.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.shared.on_error.add(listener)
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.shared.status()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.shared.status.subscribe()
    }

    /// Retries scheduled in the current disconnection episode.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.shared.attempts.load(Ordering::SeqCst)
    }

    /// The most recent inbound frame that parsed successfully.
    #[must_use]
    pub fn last_frame(&self) -> Option<Frame> {
        self.inner.shared.telemetry().last_frame.clone()
    }

    /// Time between the last `ping` sent and the `pong` that followed it.
    #[must_use]
    pub fn round_trip(&self) -> Option<Duration> {
        self.inner.shared.telemetry().round_trip
    }

    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.shared.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.shared.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.inner.shared.registry
    }
}

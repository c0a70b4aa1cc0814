//! Live connection set and message dispatch.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::heartbeat;
use crate::Result;
use crate::error::{Error, Kind};
use crate::types::{AnalysisUpdate, Chat, Frame, now_millis};

/// Greeting text carried by the `info` frame sent on admission.
pub const GREETING: &str = "Connected to FinReview real-time server";

/// Outbound queue of one connection, drained by its writer task.
pub type Outbound = mpsc::UnboundedReceiver<Utf8Bytes>;

/// Identity of one admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What [`Hub::dispatch`] did with an inbound frame.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A reply was queued for the sender only
    Replied,
    /// The frame was rebroadcast; holds the number of connections reached
    Broadcast(usize),
    /// Valid frame of a type clients are not expected to send
    Ignored,
    /// The frame could not be parsed and was dropped
    Malformed,
}

/// Hub health as reported by the diagnostics endpoint.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub initialized: bool,
    pub active_connections: usize,
}

/// Tracks every open connection and fans frames out to them.
///
/// Shared as `Arc<Hub>` between the socket handlers, the heartbeat task and the
/// diagnostics route.
pub struct Hub {
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<Utf8Bytes>>,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<CancellationToken>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(heartbeat::DEFAULT_INTERVAL)
    }
}

impl Hub {
    #[must_use]
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        }
    }

    /// Start the heartbeat emitter. Returns `false` if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        let runtime = Handle::try_current().map_err(|e| Error::with_source(Kind::Validation, e))?;
        let mut slot = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!("hub already started");
            return Ok(false);
        }

        let token = CancellationToken::new();
        heartbeat::spawn(
            &runtime,
            Arc::downgrade(self),
            self.heartbeat_interval,
            token.clone(),
        );
        *slot = Some(token);

        #[cfg(feature = "tracing")]
        tracing::info!(interval = ?self.heartbeat_interval, "hub started");
        Ok(true)
    }

    /// Stop the heartbeat emitter. Open connections are left untouched.
    pub fn stop(&self) -> bool {
        let token = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match token {
            Some(token) => {
                token.cancel();
                #[cfg(feature = "tracing")]
                tracing::info!("hub stopped");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Add a connection to the live set and queue its `info` greeting.
    pub fn admit(&self) -> (ConnectionId, Outbound) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        match Frame::info(GREETING).to_json() {
            Ok(greeting) => {
                _ = tx.send(greeting.into());
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(connection_id = %id, error = %e, "failed to encode greeting");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        self.connections.insert(id, tx);

        #[cfg(feature = "tracing")]
        tracing::info!(
            connection_id = %id,
            active = self.connections.len(),
            "connection admitted"
        );

        (id, rx)
    }

    /// Remove a connection from the live set. Returns `false` if it was not there.
    pub fn evict(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();

        #[cfg(feature = "tracing")]
        if removed {
            tracing::info!(
                connection_id = %id,
                active = self.connections.len(),
                "connection evicted"
            );
        }

        removed
    }

    /// Remove every connection. Their writers close the sockets once the queues drain.
    pub fn evict_all(&self) -> usize {
        let evicted = self.connections.len();
        self.connections.clear();

        #[cfg(feature = "tracing")]
        tracing::info!(evicted, "all connections evicted");

        evicted
    }

    /// Route one inbound text frame from connection `id`.
    ///
    /// `ping` is answered to the sender only; `chat` and `analysis_update` are
    /// rebroadcast to every open connection, sender included, stamped with the hub's
    /// clock. Anything else is logged and ignored. No error frame is ever sent back.
    pub fn dispatch(&self, id: ConnectionId, text: &str) -> Dispatch {
        let frame = match Frame::parse(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(connection_id = %id, error = %e, "dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return Dispatch::Malformed;
            }
        };

        match frame {
            Frame::Ping(_) => {
                self.send_to(id, &Frame::pong());
                Dispatch::Replied
            }
            Frame::Chat(chat) => {
                let relay = Chat {
                    user_id: chat.user_id,
                    message: chat.message,
                    timestamp: Some(now_millis()),
                };
                Dispatch::Broadcast(self.broadcast(&Frame::Chat(relay)))
            }
            Frame::AnalysisUpdate(update) => {
                let relay = AnalysisUpdate {
                    analysis_id: update.analysis_id,
                    status: update.status,
                    user_id: None,
                    timestamp: Some(now_millis()),
                };
                Dispatch::Broadcast(self.broadcast(&Frame::AnalysisUpdate(relay)))
            }
            other => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    connection_id = %id,
                    frame_type = %other.frame_type(),
                    "ignoring frame"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &other;
                Dispatch::Ignored
            }
        }
    }

    /// Send `frame` to every open connection. Returns how many received it.
    ///
    /// The frame is serialized once. Connections whose writer is gone are skipped and
    /// evicted; they never stop delivery to the rest.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let text: Utf8Bytes = match frame.to_json() {
            Ok(text) => text.into(),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(frame_type = %frame.frame_type(), error = %e, "failed to encode broadcast");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return 0;
            }
        };

        let mut delivered = 0_usize;
        let mut closed = Vec::new();

        for entry in &self.connections {
            if entry.value().send(text.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        // Shard locks are released once iteration ends.
        for id in closed {
            self.evict(id);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(frame_type = %frame.frame_type(), delivered, "broadcast");

        delivered
    }

    /// Send `frame` to one connection. Returns `false` if it is gone or closed.
    pub fn send_to(&self, id: ConnectionId, frame: &Frame) -> bool {
        let Some(sender) = self.connections.get(&id) else {
            return false;
        };

        match frame.to_json() {
            Ok(text) => sender.send(text.into()).is_ok(),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(connection_id = %id, error = %e, "failed to encode frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            initialized: self.is_initialized(),
            active_connections: self.connection_count(),
        }
    }
}

#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Sleep, sleep, timeout};
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::config::Config;
use super::registry::{ListenerSet, TopicRegistry};
use crate::error::Error;
use crate::types::{Frame, Timestamp, now_millis};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Handshake = Pin<
    Box<
        dyn Future<Output = Result<(WsStream, Response), tokio_tungstenite::tungstenite::Error>>
            + Send,
    >,
>;

/// Upper bound on waiting for the server's close reply after a requested disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Close code sent when the client disconnects on request.
const NORMAL_CLOSURE: u16 = 1000;

/// Client-side connection status.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    /// No transport, and none being opened
    Disconnected,
    /// A transport is being opened
    Connecting,
    /// The transport is open
    Connected,
    /// A requested close handshake is in progress
    Closing,
    /// Every client handle was dropped; the client is unusable
    Closed,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Details delivered to close listeners.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close code, when the peer sent one
    pub code: Option<u16>,
    pub reason: String,
    /// `true` when the close followed [`super::Client::disconnect`]
    pub requested: bool,
}

impl CloseEvent {
    fn requested() -> Self {
        Self {
            code: Some(NORMAL_CLOSURE),
            reason: String::new(),
            requested: true,
        }
    }

    fn from_frame(frame: Option<&CloseFrame>) -> Self {
        Self {
            code: frame.map(|frame| u16::from(frame.code)),
            reason: frame.map(|frame| frame.reason.as_str().to_owned()).unwrap_or_default(),
            requested: false,
        }
    }

    fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            requested: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Telemetry {
    pub(crate) last_frame: Option<Frame>,
    pub(crate) last_ping: Option<Timestamp>,
    pub(crate) round_trip: Option<Duration>,
}

/// State shared between client handles and the driver task.
pub(crate) struct Shared {
    pub(crate) endpoint: Url,
    pub(crate) config: Config,
    pub(crate) status: watch::Sender<ConnectionStatus>,
    pub(crate) attempts: AtomicU32,
    /// Set by a `connect()` issued while a requested close is in progress
    reopen: AtomicBool,
    pub(crate) registry: Arc<TopicRegistry>,
    pub(crate) on_open: Arc<ListenerSet<Url>>,
    pub(crate) on_close: Arc<ListenerSet<CloseEvent>>,
    pub(crate) on_error: Arc<ListenerSet<Error>>,
    pub(crate) frames: broadcast::Sender<Frame>,
    pub(crate) telemetry: RwLock<Telemetry>,
}

impl Shared {
    pub(crate) fn new(endpoint: Url, config: Config) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (frames, _) = broadcast::channel(config.stream_capacity.max(1));

        Self {
            endpoint,
            config,
            status,
            attempts: AtomicU32::new(0),
            reopen: AtomicBool::new(false),
            registry: TopicRegistry::new(),
            on_open: ListenerSet::new(),
            on_close: ListenerSet::new(),
            on_error: ListenerSet::new(),
            frames,
            telemetry: RwLock::new(Telemetry::default()),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|status| {
            let changed = *status != next;
            *status = next;
            changed
        });
    }

    /// Claim a connect request against the current status.
    ///
    /// `Disconnected` moves to `Connecting`. During `Closing` the request is held and
    /// honoured once the close completes. Any other status ignores it.
    pub(crate) fn begin_connect(&self) -> ConnectRequest {
        let mut request = ConnectRequest::Ignored;
        self.status.send_if_modified(|status| match *status {
            ConnectionStatus::Disconnected => {
                *status = ConnectionStatus::Connecting;
                request = ConnectRequest::Started;
                true
            }
            ConnectionStatus::Closing => {
                self.reopen.store(true, Ordering::SeqCst);
                request = ConnectRequest::Deferred;
                false
            }
            _ => false,
        });
        request
    }

    /// Leave `Closing` once a requested close is done. Returns `true` when a connect
    /// arrived meanwhile, in which case the status is already `Connecting`.
    fn finish_close(&self) -> bool {
        let mut reopen = false;
        self.status.send_if_modified(|status| {
            reopen = self.reopen.swap(false, Ordering::SeqCst);
            let next = if reopen {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Disconnected
            };
            let changed = *status != next;
            *status = next;
            changed
        });
        reopen
    }

    pub(crate) fn telemetry(&self) -> std::sync::RwLockReadGuard<'_, Telemetry> {
        self.telemetry.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_ping(&self, timestamp: Timestamp) {
        self.telemetry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_ping = Some(timestamp);
    }

    /// Parse one inbound text frame and fan it out. Malformed frames are logged and
    /// dropped; the connection stays up.
    fn deliver(&self, text: &str) {
        let frame = match Frame::parse(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "dropping malformed frame");
                #[cfg(not(feature = "tracing"))]
                let _ = (&text, &e);
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(frame_type = %frame.frame_type(), "received frame");

        {
            let mut telemetry = self
                .telemetry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if matches!(frame, Frame::Pong(_))
                && let Some(sent) = telemetry.last_ping
            {
                let elapsed = u64::try_from(now_millis().saturating_sub(sent)).unwrap_or(0);
                telemetry.round_trip = Some(Duration::from_millis(elapsed));
            }
            telemetry.last_frame = Some(frame.clone());
        }

        self.registry.dispatch(&frame);
        _ = self.frames.send(frame);
    }

    fn emit_error(&self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(endpoint = %self.endpoint, %error, "socket error");
        self.on_error.emit(error);
    }
}

/// Outcome of [`Shared::begin_connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectRequest {
    /// The caller must send [`Command::Connect`]
    Started,
    /// Held until the in-progress close completes
    Deferred,
    /// A transport is already open or opening
    Ignored,
}

/// Requests from client handles to the driver task.
pub(crate) enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Send(String),
}

enum Phase {
    Idle,
    Connecting(Handshake),
    Connected(WsStream),
    Backoff(Pin<Box<Sleep>>),
}

/// Owner of the single transport and the retry timer.
///
/// Runs until every client handle is dropped, then publishes
/// [`ConnectionStatus::Closed`].
pub(crate) struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    backoff: Constant,
}

impl Driver {
    pub(crate) fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let backoff = Constant::from(&shared.config.reconnect);
        Self {
            shared,
            commands,
            backoff,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Idle;

        loop {
            phase = match phase {
                Phase::Idle => match self.commands.recv().await {
                    Some(Command::Connect) => self.open(),
                    Some(Command::Disconnect(ack)) => self.settle_disconnect(ack),
                    Some(Command::Send(_)) => {
                        Self::discard_outbound();
                        Phase::Idle
                    }
                    None => break,
                },
                Phase::Connecting(mut handshake) => tokio::select! {
                    result = &mut handshake => match result {
                        Ok((stream, _)) => self.opened(stream),
                        Err(e) => {
                            let event = CloseEvent::abnormal(e.to_string());
                            self.shared.emit_error(&e.into());
                            self.closed(&event)
                        }
                    },
                    command = self.commands.recv() => match command {
                        Some(Command::Connect) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!("connect requested while already connecting");
                            Phase::Connecting(handshake)
                        }
                        Some(Command::Disconnect(ack)) => {
                            drop(handshake);
                            self.settle_disconnect(ack)
                        }
                        Some(Command::Send(_)) => {
                            Self::discard_outbound();
                            Phase::Connecting(handshake)
                        }
                        None => break,
                    },
                },
                Phase::Connected(stream) => match self.pump(stream).await {
                    Some(next) => next,
                    None => break,
                },
                Phase::Backoff(mut delay) => tokio::select! {
                    () = &mut delay => self.open(),
                    command = self.commands.recv() => match command {
                        // A manual connect replaces the pending retry
                        Some(Command::Connect) => self.open(),
                        Some(Command::Disconnect(ack)) => self.settle_disconnect(ack),
                        Some(Command::Send(_)) => {
                            Self::discard_outbound();
                            Phase::Backoff(delay)
                        }
                        None => break,
                    },
                },
            };
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.shared.endpoint, "client dropped, driver stopping");
        self.shared.set_status(ConnectionStatus::Closed);
    }

    fn open(&mut self) -> Phase {
        self.shared.set_status(ConnectionStatus::Connecting);

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %self.shared.endpoint,
            attempt = self.shared.attempts.load(Ordering::SeqCst),
            "opening socket"
        );

        Phase::Connecting(Box::pin(connect_async(self.shared.endpoint.to_string())))
    }

    fn opened(&mut self, stream: WsStream) -> Phase {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.backoff.reset();
        self.shared.set_status(ConnectionStatus::Connected);

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.shared.endpoint, "socket connected");

        self.shared.on_open.emit(&self.shared.endpoint);
        Phase::Connected(stream)
    }

    /// Handle an unrequested close: notify, then schedule a retry if the policy allows.
    fn closed(&mut self, event: &CloseEvent) -> Phase {
        self.shared.set_status(ConnectionStatus::Disconnected);

        #[cfg(feature = "tracing")]
        tracing::info!(
            endpoint = %self.shared.endpoint,
            code = ?event.code,
            reason = %event.reason,
            "socket closed"
        );

        self.shared.on_close.emit(event);
        self.schedule_retry()
    }

    fn schedule_retry(&mut self) -> Phase {
        let policy = &self.shared.config.reconnect;
        let attempts = self.shared.attempts.load(Ordering::SeqCst);

        if !policy.auto_reconnect || attempts >= policy.max_attempts {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                attempts,
                max_attempts = policy.max_attempts,
                auto_reconnect = policy.auto_reconnect,
                "not reconnecting"
            );
            return Phase::Idle;
        }

        let attempt = attempts.saturating_add(1);
        self.shared.attempts.store(attempt, Ordering::SeqCst);
        let delay = self.backoff.next_backoff().unwrap_or(policy.interval);

        #[cfg(feature = "tracing")]
        tracing::info!(
            attempt,
            max_attempts = policy.max_attempts,
            ?delay,
            "scheduling reconnect"
        );

        Phase::Backoff(Box::pin(sleep(delay)))
    }

    fn settle_disconnect(&mut self, ack: oneshot::Sender<()>) -> Phase {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.backoff.reset();
        let reopen = self.shared.finish_close();
        _ = ack.send(());

        if reopen {
            #[cfg(feature = "tracing")]
            tracing::debug!("connect requested during close, reopening");
            return self.open();
        }
        Phase::Idle
    }

    fn discard_outbound() {
        #[cfg(feature = "tracing")]
        tracing::debug!("discarding outbound frame, socket is not connected");
    }

    /// Drive an open transport until it closes. Returns `None` once every client handle
    /// is gone.
    async fn pump(&mut self, stream: WsStream) -> Option<Phase> {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.shared.deliver(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        return Some(self.closed(&CloseEvent::from_frame(frame.as_ref())));
                    }
                    Some(Ok(_)) => {
                        // Binary frames and control frames carry no protocol data.
                    }
                    Some(Err(e)) => {
                        let event = CloseEvent::abnormal(e.to_string());
                        self.shared.emit_error(&e.into());
                        return Some(self.closed(&event));
                    }
                    None => return Some(self.closed(&CloseEvent::abnormal("stream ended"))),
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            let event = CloseEvent::abnormal(e.to_string());
                            self.shared.emit_error(&e.into());
                            return Some(self.closed(&event));
                        }
                    }
                    Some(Command::Connect) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("connect requested while already connected");
                    }
                    Some(Command::Disconnect(ack)) => {
                        self.shared.set_status(ConnectionStatus::Closing);
                        close_handshake(write, read).await;
                        self.shared.on_close.emit(&CloseEvent::requested());
                        return Some(self.settle_disconnect(ack));
                    }
                    None => {
                        close_handshake(write, read).await;
                        return None;
                    }
                },
            }
        }
    }
}

async fn close_handshake(
    mut write: SplitSink<WsStream, Message>,
    mut read: SplitStream<WsStream>,
) {
    if write.send(Message::Close(None)).await.is_err() {
        return;
    }

    let reply = timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(message)) = read.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;

    if reply.is_err() {
        #[cfg(feature = "tracing")]
        tracing::debug!(timeout = ?CLOSE_TIMEOUT, "no close reply from server");
    }
}

#![cfg(all(feature = "server", feature = "client"))]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use finreview_realtime::server::{self, Hub};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Running server plus the handles needed to observe and stop it.
struct TestServer {
    addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start(heartbeat: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::new(Hub::new(heartbeat));
        let (shutdown, signal) = oneshot::channel::<()>();

        let served = Arc::clone(&hub);
        tokio::spawn(async move {
            server::serve_with_shutdown(listener, served, async move {
                _ = signal.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            hub,
            shutdown: Some(shutdown),
        }
    }

    fn socket_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            _ = shutdown.send(());
        }
    }
}

/// Raw socket client with the greeting already consumed.
struct RawClient {
    write: SplitSink<Socket, Message>,
    read: SplitStream<Socket>,
}

impl RawClient {
    async fn connect(server: &TestServer) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(server.socket_url())
            .await
            .unwrap();
        let (write, read) = socket.split();
        let mut client = Self { write, read };

        let greeting = client.next_json().await;
        assert_eq!(greeting["type"], "info", "first frame is the greeting");

        client
    }

    async fn send_json(&mut self, value: &Value) {
        self.write
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.write
            .send(Message::Text(text.to_owned().into()))
            .await
            .unwrap();
    }

    /// Next text frame as JSON, skipping anything else.
    async fn next_json(&mut self) -> Value {
        timeout(Duration::from_secs(2), async {
            loop {
                match self.read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => {}
                    other => panic!("socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Next frame of `msg_type`, skipping heartbeats and anything else.
    async fn next_of_type(&mut self, msg_type: &str) -> Value {
        loop {
            let value = self.next_json().await;
            if value["type"] == msg_type {
                return value;
            }
        }
    }

    /// Assert no text frame arrives within `window`.
    async fn assert_silent(&mut self, window: Duration) {
        let received = timeout(window, async {
            loop {
                match self.read.next().await {
                    Some(Ok(Message::Text(text))) => return text.to_string(),
                    Some(Ok(_)) => {}
                    None | Some(Err(_)) => std::future::pending::<()>().await,
                }
            }
        })
        .await;

        assert!(received.is_err(), "unexpected frame: {received:?}");
    }
}

async fn wait_for_connections(hub: &Hub, expected: usize) {
    timeout(Duration::from_secs(2), async {
        while hub.connection_count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count never settled");
}

const QUIET: Duration = Duration::from_secs(300);

mod connection {
    use super::*;

    #[tokio::test]
    async fn greeting_is_sent_on_connect() {
        let server = TestServer::start(QUIET).await;
        let (socket, _) = tokio_tungstenite::connect_async(server.socket_url())
            .await
            .unwrap();
        let (_write, mut read) = socket.split();

        let Some(Ok(Message::Text(text))) = timeout(Duration::from_secs(2), read.next())
            .await
            .unwrap()
        else {
            panic!("expected a text greeting");
        };
        let greeting: Value = serde_json::from_str(text.as_str()).unwrap();

        assert_eq!(greeting["type"], "info");
        assert_eq!(
            greeting["message"],
            "Connected to FinReview real-time server"
        );
        assert!(greeting["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn hub_is_initialized_while_serving() {
        let server = TestServer::start(QUIET).await;
        let _client = RawClient::connect(&server).await;

        assert!(server.hub.is_initialized());
        assert_eq!(server.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn closed_socket_is_evicted() {
        let server = TestServer::start(QUIET).await;
        let mut first = RawClient::connect(&server).await;
        let mut second = RawClient::connect(&server).await;
        wait_for_connections(&server.hub, 2).await;

        second.write.send(Message::Close(None)).await.unwrap();
        wait_for_connections(&server.hub, 1).await;

        first
            .send_json(&json!({ "type": "chat", "userId": "u1", "message": "still here" }))
            .await;
        let chat = first.next_of_type("chat").await;
        assert_eq!(chat["message"], "still here");
    }

    #[tokio::test]
    async fn shutdown_closes_open_sockets() {
        let mut server = TestServer::start(QUIET).await;
        let mut client = RawClient::connect(&server).await;

        server.shutdown.take().unwrap().send(()).unwrap();

        let ended = timeout(Duration::from_secs(2), async {
            loop {
                match client.read.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;

        assert!(ended.is_ok(), "socket should close on shutdown");
    }
}

mod routing {
    use super::*;

    #[tokio::test]
    async fn ping_is_answered_to_sender_only() {
        let server = TestServer::start(QUIET).await;
        let mut sender = RawClient::connect(&server).await;
        let mut bystander = RawClient::connect(&server).await;

        sender
            .send_json(&json!({ "type": "ping", "timestamp": 1_700_000_000_000_i64 }))
            .await;

        let pong = sender.next_json().await;
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].is_i64());

        bystander.assert_silent(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn chat_reaches_every_connection_including_sender() {
        let server = TestServer::start(QUIET).await;
        let mut sender = RawClient::connect(&server).await;
        let mut peer = RawClient::connect(&server).await;

        sender
            .send_json(&json!({ "type": "chat", "userId": 7, "message": "hello" }))
            .await;

        for client in [&mut sender, &mut peer] {
            let chat = client.next_json().await;
            assert_eq!(chat["type"], "chat");
            assert_eq!(chat["userId"], "7");
            assert_eq!(chat["message"], "hello");
            assert!(chat["timestamp"].is_i64());
        }
    }

    #[tokio::test]
    async fn analysis_update_is_restamped_without_user() {
        let server = TestServer::start(QUIET).await;
        let mut sender = RawClient::connect(&server).await;
        let mut peer = RawClient::connect(&server).await;

        sender
            .send_json(&json!({
                "type": "analysis_update",
                "analysisId": "a-42",
                "status": "completed",
                "userId": "u1",
                "timestamp": 1
            }))
            .await;

        let update = peer.next_json().await;
        assert_eq!(update["type"], "analysis_update");
        assert_eq!(update["analysisId"], "a-42");
        assert_eq!(update["status"], "completed");
        assert!(update.get("userId").is_none(), "userId is not relayed");
        assert_ne!(update["timestamp"], 1);

        let echoed = sender.next_json().await;
        assert_eq!(echoed["analysisId"], "a-42");
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let server = TestServer::start(QUIET).await;
        let mut client = RawClient::connect(&server).await;

        client.send_raw("{ not json").await;
        client.send_raw("[1, 2, 3]").await;
        client.send_json(&json!({ "type": "mystery" })).await;
        client.assert_silent(Duration::from_millis(100)).await;

        client.send_json(&json!({ "type": "ping" })).await;
        let pong = client.next_json().await;

        assert_eq!(pong["type"], "pong");
        assert_eq!(server.hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn heartbeat_reaches_every_connection() {
        let server = TestServer::start(Duration::from_millis(100)).await;
        let mut first = RawClient::connect(&server).await;
        let mut second = RawClient::connect(&server).await;

        for client in [&mut first, &mut second] {
            let heartbeat = client.next_of_type("heartbeat").await;
            assert!(heartbeat["timestamp"].is_i64());
        }
    }
}

mod diagnostics {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use finreview_realtime::STATUS_PATH;
    use tower::ServiceExt as _;

    use super::*;

    #[tokio::test]
    async fn status_counts_live_sockets() {
        let server = TestServer::start(QUIET).await;
        let _first = RawClient::connect(&server).await;
        let _second = RawClient::connect(&server).await;
        wait_for_connections(&server.hub, 2).await;

        let response = server::router(Arc::clone(&server.hub))
            .oneshot(Request::get(STATUS_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "initialized": true, "activeConnections": 2 }));
    }
}

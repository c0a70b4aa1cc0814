use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt as _, StreamExt as _};

use super::hub::Hub;

/// `GET /ws`: upgrade and hand the socket to the hub. Connections are anonymous.
pub async fn upgrade(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

/// Run one connection: a writer task drains the hub's outbound queue while this task
/// reads and dispatches inbound frames. The connection is evicted before the writer is
/// torn down.
async fn serve_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (id, mut outbound) = hub.admit();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let outcome = hub.dispatch(id, text.as_str());
                #[cfg(feature = "tracing")]
                tracing::trace!(connection_id = %id, ?outcome, "dispatched frame");
                #[cfg(not(feature = "tracing"))]
                let _ = outcome;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                // Binary frames are not part of the protocol; ping/pong is answered by axum.
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(connection_id = %id, error = %e, "socket error");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                break;
            }
        }
    }

    hub.evict(id);
    writer.abort();
}

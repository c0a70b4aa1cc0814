use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use super::handler;
use super::hub::{Diagnostics, Hub};
use crate::{SOCKET_PATH, STATUS_PATH};

/// Router serving the socket endpoint and the diagnostics endpoint.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route(SOCKET_PATH, get(handler::upgrade))
        .route(STATUS_PATH, get(status))
        .with_state(hub)
}

/// `GET /api/ws/status`
async fn status(State(hub): State<Arc<Hub>>) -> Json<Diagnostics> {
    Json(hub.diagnostics())
}

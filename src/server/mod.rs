//! Connection hub, heartbeat and HTTP surface.
//!
//! # Example
//!
//! ```rust, no_run
//! use std::sync::Arc;
//!
//! use finreview_realtime::server::{self, hub::Hub};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let listener = TcpListener::bind("127.0.0.1:3001").await?;
//!     server::serve(listener, Arc::new(Hub::default())).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod hub;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

pub use self::hub::Hub;
pub use self::routes::router;
use crate::Result;

/// Start the hub and serve until Ctrl-C, then stop the hub.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>) -> Result<()> {
    serve_with_shutdown(listener, hub, shutdown_signal()).await
}

/// Start the hub and serve until `shutdown` resolves. Open sockets are closed and the
/// hub is stopped on the way out.
pub async fn serve_with_shutdown<F>(listener: TcpListener, hub: Arc<Hub>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    hub.start()?;

    #[cfg(feature = "tracing")]
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "real-time server listening");
    }

    let closing = Arc::clone(&hub);
    let served = axum::serve(listener, router(Arc::clone(&hub)))
        .with_graceful_shutdown(async move {
            shutdown.await;
            closing.evict_all();
        })
        .await;

    hub.stop();
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
        std::future::pending::<()>().await;
    }

    #[cfg(feature = "tracing")]
    tracing::info!("shutdown signal received");
}

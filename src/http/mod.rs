//! HTTP server module
//!
//! This module handles HTTP request routing and handling:
//! - Axum router with proxy, session and transmux endpoints
//! - Upstream proxy with playlist rewriting
//! - Transmux cache file serving
//! - CORS middleware

pub mod handlers;
pub mod proxy;
pub mod routes;

pub use routes::create_router;

use std::sync::Arc;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::state::AppState;

/// Bind `addr` and serve the router in a background task.
///
/// Returns the bound address, useful when `addr` asks for port 0.
pub async fn spawn_server(
    state: Arc<AppState>,
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let app = create_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    });
    Ok((local, handle))
}

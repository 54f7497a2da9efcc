//! Route definitions and server startup.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};
use fleet_core::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{callback, health};
use crate::middleware::{callback_auth, request_id};
use crate::state::AppState;

/// Callback bodies carry full test logs.
pub const CALLBACK_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Create the callback router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/node/{node_id}/callback/{runtime}",
            post(callback::node_callback)
                .route_layer(middleware::from_fn_with_state(state.clone(), callback_auth)),
        )
        .route("/health", get(health::health))
        .layer(DefaultBodyLimit::max(CALLBACK_BODY_LIMIT))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the callback API on `addr` until `shutdown` resolves.
pub async fn serve<S>(addr: SocketAddr, state: Arc<AppState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Callback API listening");
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Network(format!("callback server failed: {}", e)))
}

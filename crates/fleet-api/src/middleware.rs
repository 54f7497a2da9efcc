//! HTTP middleware for the callback server.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;
use fleet_core::Error;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Inject a request ID into each request and echo it on the response.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &value {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let mut response = next.run(request).await;
    if let Some(value) = value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Check the per-runtime callback token.
///
/// Runtimes without a `callback_token` accept unauthenticated callbacks.
/// The header may carry the bare token or `Bearer <token>`.
pub async fn callback_auth(
    State(state): State<Arc<AppState>>,
    Path((node_id, runtime)): Path<(String, String)>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(config) = state.runtime(&runtime) else {
        return ApiError::from(Error::ConfigurationMismatch {
            kind: "runtime",
            name: runtime,
        })
        .into_response();
    };

    if let Some(expected) = config.callback_token.as_deref() {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim());
        if presented != Some(expected) {
            warn!(node_id = %node_id, runtime = %runtime, "Rejected callback with bad token");
            return ApiError::Unauthorized.into_response();
        }
    }

    next.run(request).await
}

//! Result callbacks from submit-and-forget labs.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use fleet_core::NodeId;
use fleet_core::node::Node;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub node_id: String,
    pub state: String,
    pub result: Option<String>,
}

impl From<&Node> for CallbackResponse {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.id_str().to_string(),
            state: node.state.to_string(),
            result: node.result.map(|r| r.to_string()),
        }
    }
}

/// `POST /node/{node_id}/callback/{runtime}`
///
/// The body is taken raw so that a non-JSON payload still reaches the
/// orchestrator and closes the node.
pub async fn node_callback(
    State(state): State<Arc<AppState>>,
    Path((node_id, runtime)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<CallbackResponse>, ApiError> {
    let node_id = NodeId::new(node_id);
    info!(node_id = %node_id, runtime = %runtime, bytes = body.len(), "Callback request");

    let node = state
        .orchestrator
        .handle_callback(&node_id, &runtime, &body)
        .await?;
    Ok(Json(CallbackResponse::from(&node)))
}

//! HTTP callback surface for Fleet CI.
//!
//! Remote labs running submit-and-forget jobs post their results to
//! `POST /node/{node_id}/callback/{runtime}`; the body is handed to the
//! orchestrator's callback path.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{build_app, serve};
pub use state::AppState;

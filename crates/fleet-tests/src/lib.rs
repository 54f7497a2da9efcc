//! Integration test infrastructure for Fleet CI.
//!
//! In-memory stand-ins for the node service and artifact storage, pipeline
//! fixtures, and a [`TestContext`] that wires them to a real orchestrator.
//!
//! # Usage
//!
//! ```ignore
//! use fleet_tests::{TestContext, fixtures};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new(fixtures::PIPELINE_YAML).unwrap();
//!     let checkout = ctx.seed(fixtures::NodeFixture::checkout("mainline", "master"));
//!     let outcomes = ctx.dispatch(&checkout).await;
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;
pub mod node_store;
pub mod storage;

pub use context::TestContext;
pub use helpers::*;
pub use node_store::InMemoryNodeService;
pub use storage::MemoryStorage;

/// Initialize test logging (safe to call from every test).
pub fn init_test_logging() {
    fleet_core::telemetry::init_test_tracing();
}

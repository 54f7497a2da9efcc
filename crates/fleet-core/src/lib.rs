//! Fleet CI Core
//!
//! Core domain types, configuration, ports and error handling for Fleet CI.
//! This crate defines the node model and the vocabulary shared by the rule
//! engine, the runtimes, the result builders and the scheduler.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod node;
pub mod ports;
pub mod retry;
pub mod subscription;
pub mod telemetry;
pub mod template;

pub use error::{Error, Result};
pub use ids::*;

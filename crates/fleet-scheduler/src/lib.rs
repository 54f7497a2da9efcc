//! Event-driven job scheduling and dispatch for Fleet CI.

pub mod priority;
pub mod scheduler;
pub mod service;
pub mod triggers;
pub mod updater;

pub use priority::PriorityPolicy;
pub use scheduler::{DispatchTarget, Scheduler};
pub use service::{DispatchOutcome, Orchestrator};
pub use triggers::TriggerMatcher;
pub use updater::NodeUpdater;

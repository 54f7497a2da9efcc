//! Application state shared across handlers.

use fleet_core::config::RuntimeConfig;
use fleet_scheduler::Orchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn runtime(&self, name: &str) -> Option<&RuntimeConfig> {
        self.orchestrator.config().runtime(name)
    }
}

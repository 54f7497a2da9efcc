//! Runtime construction from configuration.

use crate::docker::DockerRuntime;
use crate::lava::LavaRuntime;
use crate::pull_labs::PullLabsRuntime;
use crate::runtime::Runtime;
use crate::shell::ShellRuntime;
use fleet_core::Result;
use fleet_core::config::{PipelineConfig, RuntimeConfig, RuntimeType};
use fleet_core::ports::{ArtifactStorage, TemplateRenderer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Factory for creating runtimes from their configuration.
#[derive(Clone)]
pub struct RuntimeFactory {
    renderer: Arc<dyn TemplateRenderer>,
    storage: Arc<dyn ArtifactStorage>,
}

impl RuntimeFactory {
    pub fn new(renderer: Arc<dyn TemplateRenderer>, storage: Arc<dyn ArtifactStorage>) -> Self {
        Self { renderer, storage }
    }

    /// Create the runtime for `config`, picking the backend from its type.
    pub fn create(&self, config: &RuntimeConfig) -> Result<Arc<dyn Runtime>> {
        let renderer = self.renderer.clone();
        let runtime: Arc<dyn Runtime> = match config.runtime_type {
            RuntimeType::Lava => Arc::new(LavaRuntime::new(config.clone(), renderer)?),
            RuntimeType::Docker => Arc::new(DockerRuntime::new(config.clone(), renderer)?),
            RuntimeType::Shell => Arc::new(ShellRuntime::new(config.clone(), renderer)),
            RuntimeType::PullLabs => Arc::new(PullLabsRuntime::new(
                config.clone(),
                renderer,
                self.storage.clone(),
            )),
        };
        info!(runtime = %config.name, runtime_type = %config.runtime_type, "Created runtime");
        Ok(runtime)
    }

    /// Every configured runtime, keyed by name.
    pub fn create_all(
        &self,
        config: &PipelineConfig,
    ) -> Result<BTreeMap<String, Arc<dyn Runtime>>> {
        config
            .runtimes
            .values()
            .map(|runtime| Ok((runtime.name.clone(), self.create(runtime)?)))
            .collect()
    }
}

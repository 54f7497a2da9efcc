//! Test context wiring in-memory collaborators to a real orchestrator.

use crate::fixtures::TEMPLATES;
use crate::node_store::{InMemoryNodeService, NODE_CHANNEL};
use crate::storage::MemoryStorage;
use axum::Router;
use fleet_api::{AppState, build_app};
use fleet_core::Result;
use fleet_core::config::{PipelineConfig, RuntimeType};
use fleet_core::events::{EventOp, NodeEvent};
use fleet_core::node::{Node, NodeKind};
use fleet_core::template::InterpolationRenderer;
use fleet_runtime::RuntimeFactory;
use fleet_scheduler::{DispatchOutcome, Orchestrator};
use std::sync::Arc;
use tempfile::TempDir;

/// Orchestrator over in-memory services.
///
/// Templates from [`TEMPLATES`] are written to a temporary directory added to
/// every runtime's search path; shell jobs run in their own temporary
/// directory. Drop this to remove both.
pub struct TestContext {
    pub nodes: Arc<InMemoryNodeService>,
    pub storage: Arc<MemoryStorage>,
    pub config: Arc<PipelineConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub templates: TempDir,
    pub work_dir: TempDir,
}

impl TestContext {
    pub fn new(yaml: &str) -> Result<Self> {
        Self::with_config(yaml, |_| {})
    }

    /// Build from `yaml`, letting `customize` adjust the loaded configuration.
    pub fn with_config<F>(yaml: &str, customize: F) -> Result<Self>
    where
        F: FnOnce(&mut PipelineConfig),
    {
        crate::init_test_logging();

        let templates = tempfile::tempdir()?;
        for (name, body) in TEMPLATES {
            std::fs::write(templates.path().join(name), body)?;
        }
        let work_dir = tempfile::tempdir()?;

        let mut config = PipelineConfig::from_yaml_str(yaml)?;
        for runtime in config.runtimes.values_mut() {
            runtime.template_paths.push(templates.path().to_path_buf());
            if runtime.runtime_type == RuntimeType::Shell {
                runtime.work_dir = Some(work_dir.path().to_path_buf());
            }
        }
        customize(&mut config);
        let config = Arc::new(config);

        let nodes = Arc::new(InMemoryNodeService::new());
        let storage = Arc::new(MemoryStorage::new());
        let runtimes = RuntimeFactory::new(Arc::new(InterpolationRenderer::new()), storage.clone())
            .create_all(&config)?;
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            runtimes,
            nodes.clone(),
            storage.clone(),
        ));

        Ok(Self {
            nodes,
            storage,
            config,
            orchestrator,
            templates,
            work_dir,
        })
    }

    /// Point every LAVA runtime at `url`.
    pub fn with_lava(yaml: &str, url: &str) -> Result<Self> {
        Self::with_config(yaml, |config| {
            for runtime in config.runtimes.values_mut() {
                if runtime.runtime_type == RuntimeType::Lava {
                    runtime.url = Some(url.to_string());
                }
            }
        })
    }

    /// Store `node` as if its producer had created it.
    pub fn seed(&self, node: Node) -> Node {
        self.nodes.insert(node)
    }

    /// Run the dispatch pipeline for an update of `node`.
    pub async fn dispatch(&self, node: &Node) -> Vec<DispatchOutcome> {
        let event = NodeEvent::new(EventOp::Updated, node.clone());
        self.orchestrator.handle_event(event, NODE_CHANNEL).await
    }

    /// Job nodes (of any kind but test) created for `job`.
    pub fn job_nodes(&self, job: &str) -> Vec<Node> {
        self.nodes
            .all()
            .into_iter()
            .filter(|n| n.kind != NodeKind::Test && n.group.as_deref() == Some(job))
            .collect()
    }

    pub fn app(&self) -> Router {
        build_app(Arc::new(AppState::new(self.orchestrator.clone())))
    }
}

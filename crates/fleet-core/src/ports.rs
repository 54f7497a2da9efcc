//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the dispatch core and its
//! external collaborators: the node/event service, template rendering and
//! artifact storage.

use crate::events::NodeEvent;
use crate::ids::{NodeId, SubscriptionId};
use crate::node::Node;
use crate::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Node database and event channel.
#[async_trait]
pub trait NodeService: Send + Sync {
    /// Get a node by ID.
    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>>;

    /// Create a node; the returned copy carries its assigned ID.
    async fn create_node(&self, node: &Node) -> Result<Node>;

    /// Replace a stored node.
    async fn update_node(&self, node: &Node) -> Result<Node>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<SubscriptionId>;

    /// Block until the next event on a subscription.
    async fn receive_event(&self, subscription: &SubscriptionId) -> Result<NodeEvent>;

    /// Drop a subscription.
    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()>;
}

/// Renders job templates.
pub trait TemplateRenderer: Send + Sync {
    /// Render `template`, looked up in `search_paths`, with `params`.
    fn render(
        &self,
        template: &str,
        search_paths: &[PathBuf],
        params: &Map<String, Value>,
    ) -> Result<String>;
}

/// Artifact storage.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Upload one file as `dest_path/dest_name` and return its public URL.
    async fn upload_single(&self, local_file: &Path, dest_name: &str, dest_path: &str)
    -> Result<String>;
}

//! Serialised node updates.
//!
//! Result callbacks and timeout handling may race on the same node. Every
//! read-modify-write of a node goes through [`NodeUpdater::update`], which
//! holds a per-node lock for the whole sequence.

use fleet_core::node::Node;
use fleet_core::ports::NodeService;
use fleet_core::{Error, NodeId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

pub struct NodeUpdater {
    service: Arc<dyn NodeService>,
    locks: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<()>>>>,
}

impl NodeUpdater {
    pub fn new(service: Arc<dyn NodeService>) -> Self {
        Self {
            service,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &NodeId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    fn release(&self, id: &NodeId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    /// Fetch the node, apply `change` and store it.
    ///
    /// `change` returns whether anything changed; when it returns `false`
    /// nothing is written and `None` is returned.
    pub async fn update<F>(&self, id: &NodeId, change: F) -> Result<Option<Node>>
    where
        F: FnOnce(&mut Node) -> Result<bool>,
    {
        let lock = self.lock_for(id);
        let outcome = {
            let _guard = lock.lock().await;
            trace!(node_id = %id, "Node lock held");
            self.apply(id, change).await
        };
        drop(lock);
        self.release(id);
        outcome
    }

    async fn apply<F>(&self, id: &NodeId, change: F) -> Result<Option<Node>>
    where
        F: FnOnce(&mut Node) -> Result<bool>,
    {
        let mut node = self
            .service
            .get_node(id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        if !change(&mut node)? {
            return Ok(None);
        }
        self.service.update_node(&node).await.map(Some)
    }

    /// Number of nodes with an update in flight.
    pub fn in_flight(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

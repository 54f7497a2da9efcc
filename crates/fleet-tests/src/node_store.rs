//! In-memory node/event service.
//!
//! Every create and update is broadcast on [`NODE_CHANNEL`] to the
//! subscribers of that channel, in order.

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::events::{EventOp, NodeEvent};
use fleet_core::node::{Node, NodeKind};
use fleet_core::ports::NodeService;
use fleet_core::{Error, NodeId, Result, SubscriptionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;

pub const NODE_CHANNEL: &str = "node";

struct Subscriber {
    channel: String,
    sender: mpsc::UnboundedSender<NodeEvent>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<NodeEvent>>>,
}

#[derive(Default)]
pub struct InMemoryNodeService {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    updates: AtomicU64,
    failing_creates: AtomicU32,
    fail_after: Mutex<Option<u32>>,
}

impl InMemoryNodeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `node` without emitting an event, assigning an id if needed.
    pub fn insert(&self, mut node: Node) -> Node {
        if node.id.is_none() {
            node.id = Some(self.allocate_id());
        }
        if let Some(id) = node.id.clone() {
            self.lock_nodes().insert(id, node.clone());
        }
        node
    }

    /// Make the next `count` creates fail with a retryable storage error.
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Let `successes` more creates through, then fail exactly one.
    pub fn fail_creates_after(&self, successes: u32) {
        *self.fail_after.lock().unwrap_or_else(|e| e.into_inner()) = Some(successes);
    }

    fn take_injected_failure(&self) -> bool {
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return true;
        }
        let mut after = self.fail_after.lock().unwrap_or_else(|e| e.into_inner());
        match *after {
            Some(0) => {
                *after = None;
                true
            }
            Some(n) => {
                *after = Some(n - 1);
                false
            }
            None => false,
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.lock_nodes().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Node> {
        self.lock_nodes().values().cloned().collect()
    }

    pub fn children_of(&self, id: &NodeId) -> Vec<Node> {
        self.lock_nodes()
            .values()
            .filter(|n| n.parent.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    /// The first node of `kind` called `name`, in id order.
    pub fn find(&self, kind: NodeKind, name: &str) -> Option<Node> {
        self.lock_nodes()
            .values()
            .find(|n| n.kind == kind && n.name == name)
            .cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Deliver `event` to the subscribers of `channel`.
    pub fn publish(&self, channel: &str, event: NodeEvent) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for subscriber in subscribers.values().filter(|s| s.channel == channel) {
            let _ = subscriber.sender.send(event.clone());
        }
    }

    fn allocate_id(&self) -> NodeId {
        NodeId::new(format!("node-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl NodeService for InMemoryNodeService {
    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>> {
        Ok(self.get(id))
    }

    async fn create_node(&self, node: &Node) -> Result<Node> {
        if self.take_injected_failure() {
            return Err(Error::Storage("node store unavailable".into()));
        }

        let mut node = node.clone();
        node.id = Some(self.allocate_id());
        let now = Utc::now();
        node.created = now;
        node.updated = now;
        let stored = self.insert(node);
        self.publish(NODE_CHANNEL, NodeEvent::new(EventOp::Created, stored.clone()));
        Ok(stored)
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let id = node
            .id
            .clone()
            .ok_or_else(|| Error::Internal("cannot update a node without id".into()))?;
        let mut node = node.clone();
        node.updated = Utc::now();
        {
            let mut nodes = self.lock_nodes();
            if !nodes.contains_key(&id) {
                return Err(Error::NodeNotFound(id.to_string()));
            }
            nodes.insert(id, node.clone());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.publish(NODE_CHANNEL, NodeEvent::new(EventOp::Updated, node.clone()));
        Ok(node)
    }

    async fn subscribe(&self, channel: &str) -> Result<SubscriptionId> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = SubscriptionId::generate();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id.clone(),
                Subscriber {
                    channel: channel.to_string(),
                    sender,
                    receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
                },
            );
        Ok(id)
    }

    async fn receive_event(&self, subscription: &SubscriptionId) -> Result<NodeEvent> {
        let receiver = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(subscription)
            .map(|s| s.receiver.clone())
            .ok_or_else(|| Error::EventSource(format!("unknown subscription {}", subscription)))?;
        let mut receiver = receiver.lock().await;
        receiver
            .recv()
            .await
            .ok_or_else(|| Error::EventSource(format!("subscription {} closed", subscription)))
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> Result<()> {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subscription)
            .map(|_| ())
            .ok_or_else(|| Error::EventSource(format!("unknown subscription {}", subscription)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::node::NodeState;

    #[tokio::test]
    async fn test_create_assigns_id_and_publishes() {
        let service = InMemoryNodeService::new();
        let sub = service.subscribe(NODE_CHANNEL).await.unwrap();

        let created = service
            .create_node(&Node::new(NodeKind::Checkout, "checkout"))
            .await
            .unwrap();
        assert_eq!(created.id, Some(NodeId::new("node-1")));

        let event = service.receive_event(&sub).await.unwrap();
        assert_eq!(event.op, EventOp::Created);
        assert_eq!(event.id(), created.id.as_ref());
    }

    #[tokio::test]
    async fn test_update_publishes_snapshot() {
        let service = InMemoryNodeService::new();
        let mut node = service.insert(Node::new(NodeKind::Kbuild, "kbuild"));
        let sub = service.subscribe(NODE_CHANNEL).await.unwrap();

        node.set_state(NodeState::Available).unwrap();
        service.update_node(&node).await.unwrap();

        let event = service.receive_event(&sub).await.unwrap();
        assert_eq!(event.op, EventOp::Updated);
        assert_eq!(event.node.state, NodeState::Available);
        assert_eq!(service.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_node() {
        let service = InMemoryNodeService::new();
        let mut node = Node::new(NodeKind::Job, "baseline");
        node.id = Some(NodeId::new("missing"));
        let err = service.update_node(&node).await.unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_create_failures() {
        let service = InMemoryNodeService::new();
        service.fail_next_creates(1);
        let node = Node::new(NodeKind::Job, "baseline");
        assert!(service.create_node(&node).await.unwrap_err().is_retryable());
        assert!(service.create_node(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_fails_after_successes() {
        let service = InMemoryNodeService::new();
        service.fail_creates_after(2);
        let node = Node::new(NodeKind::Test, "timers");
        assert!(service.create_node(&node).await.is_ok());
        assert!(service.create_node(&node).await.is_ok());
        assert!(service.create_node(&node).await.is_err());
        assert!(service.create_node(&node).await.is_ok());
        assert_eq!(service.all().len(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_subscription() {
        let service = InMemoryNodeService::new();
        let sub = service.subscribe(NODE_CHANNEL).await.unwrap();
        service.unsubscribe(&sub).await.unwrap();
        assert!(service.receive_event(&sub).await.is_err());
    }
}

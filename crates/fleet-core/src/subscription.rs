//! Per-subscription context.

use crate::events::NodeEvent;
use crate::ids::SubscriptionId;
use crate::ports::NodeService;
use crate::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// An open subscription and the filter its owner applies to it.
///
/// The subscription belongs to whichever component opened it; nothing else
/// sees its filter.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    filter: BTreeMap<String, Value>,
}

impl Subscription {
    /// Subscribe to `channel`, keeping only events matching `filter`.
    pub async fn open(
        service: &dyn NodeService,
        channel: &str,
        filter: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let id = service.subscribe(channel).await?;
        debug!(subscription = %id, channel, "Subscribed");
        Ok(Self {
            id,
            channel: channel.to_string(),
            filter,
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn accepts(&self, event: &NodeEvent) -> bool {
        event.matches(&self.filter)
    }

    /// Next event that passes the filter.
    pub async fn next_event(&self, service: &dyn NodeService) -> Result<NodeEvent> {
        loop {
            let event = service.receive_event(&self.id).await?;
            if self.accepts(&event) {
                return Ok(event);
            }
            trace!(subscription = %self.id, node_id = event.node.id_str(), "Event filtered out");
        }
    }

    pub async fn close(self, service: &dyn NodeService) -> Result<()> {
        service.unsubscribe(&self.id).await
    }
}

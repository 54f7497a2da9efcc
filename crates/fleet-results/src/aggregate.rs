//! Bottom-up result aggregation.

use crate::hierarchy::ResultHierarchy;
use fleet_core::error::INFRASTRUCTURE_ERROR;
use fleet_core::node::{NodeKind, NodeResult};
use tracing::debug;

/// Name of the synthetic stage holding the backend's own setup steps.
pub const SETUP_STAGE: &str = "setup";

/// Recompute group results from their children.
///
/// A group is recomputed when it has no result of its own or when it reports
/// `pass` while a child failed. Running this twice changes nothing.
pub fn aggregate(tree: &mut ResultHierarchy) {
    for child in &mut tree.child_nodes {
        aggregate(child);
    }
    if tree.child_nodes.is_empty() {
        return;
    }

    let overreported = tree.node.result == Some(NodeResult::Pass)
        && tree
            .child_nodes
            .iter()
            .any(|c| c.node.result == Some(NodeResult::Fail));
    if tree.node.result.is_some() && !overreported {
        return;
    }

    if let Some(result) = from_children(tree) {
        if tree.node.result != Some(result) {
            debug!(name = %tree.node.name, result = %result, "Recomputed group result");
        }
        tree.node.result = Some(result);
    }
}

fn from_children(tree: &ResultHierarchy) -> Option<NodeResult> {
    let has = |r: NodeResult| tree.child_nodes.iter().any(|c| c.node.result == Some(r));
    if has(NodeResult::Fail) {
        Some(NodeResult::Fail)
    } else if has(NodeResult::Pass) {
        Some(NodeResult::Pass)
    } else if has(NodeResult::Skip) {
        Some(NodeResult::Skip)
    } else {
        tree.node.result
    }
}

/// Aggregate, then escalate a failed setup stage on the top-level node.
///
/// A failed setup means the job never really ran: the result becomes
/// `incomplete`, or `fail` for build jobs.
pub fn finalize(tree: &mut ResultHierarchy, kind: NodeKind) {
    aggregate(tree);

    let setup_failed = tree
        .child(SETUP_STAGE)
        .is_some_and(|s| s.node.result == Some(NodeResult::Fail));
    if !setup_failed {
        return;
    }

    let escalated = match kind {
        NodeKind::Kbuild => NodeResult::Fail,
        _ => NodeResult::Incomplete,
    };
    if tree.node.result == Some(NodeResult::Incomplete) || tree.node.result == Some(escalated) {
        return;
    }
    debug!(name = %tree.node.name, result = %escalated, "Setup stage failed, escalating");
    tree.node.result = Some(escalated);
    if escalated == NodeResult::Incomplete && !tree.node.data.contains_key("error_code") {
        tree.set_error(INFRASTRUCTURE_ERROR, "setup stage failed");
    }
}

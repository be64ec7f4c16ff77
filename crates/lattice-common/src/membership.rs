//! Cluster membership events.
//!
//! Membership changes are delivered as messages on a channel instead of
//! listener callbacks, so a single coordination loop can own whatever state
//! reacts to them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Coordinator,
    Ingestor,
    Store,
    Frontend,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::Coordinator => "coordinator",
            NodeRole::Ingestor => "ingestor",
            NodeRole::Store => "store",
            NodeRole::Frontend => "frontend",
        };
        f.write_str(name)
    }
}

/// A cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub role: NodeRole,
    pub index: u32,
}

impl NodeInfo {
    pub fn new(role: NodeRole, index: u32) -> Self {
        Self { role, index }
    }
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodesJoined { role: NodeRole, nodes: Vec<NodeInfo> },
    NodesLeft { role: NodeRole, nodes: Vec<NodeInfo> },
}

/// Source of membership events.
pub trait NodeDiscovery: Send + Sync {
    /// Subscribe to membership changes. The first events on a new
    /// subscription describe the nodes that are already live.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent>;
}

#[derive(Default)]
struct DiscoveryState {
    live: BTreeMap<NodeRole, BTreeSet<NodeInfo>>,
    subscribers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

impl DiscoveryState {
    fn publish(&mut self, event: MembershipEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// In-process discovery: nodes are announced explicitly.
#[derive(Default)]
pub struct LocalDiscovery {
    state: Mutex<DiscoveryState>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce nodes as live. Nodes that are already live are ignored.
    pub fn join(&self, nodes: &[NodeInfo]) {
        let mut state = self.state.lock();
        for (role, joined) in group_by_role(nodes) {
            let live = state.live.entry(role).or_default();
            let fresh: Vec<NodeInfo> = joined.into_iter().filter(|n| live.insert(*n)).collect();
            if fresh.is_empty() {
                continue;
            }
            debug!("{} {} node(s) joined", fresh.len(), role);
            state.publish(MembershipEvent::NodesJoined { role, nodes: fresh });
        }
    }

    /// Announce nodes as gone. Nodes that are not live are ignored.
    pub fn leave(&self, nodes: &[NodeInfo]) {
        let mut state = self.state.lock();
        for (role, left) in group_by_role(nodes) {
            let live = state.live.entry(role).or_default();
            let gone: Vec<NodeInfo> = left.into_iter().filter(|n| live.remove(n)).collect();
            if gone.is_empty() {
                continue;
            }
            debug!("{} {} node(s) left", gone.len(), role);
            state.publish(MembershipEvent::NodesLeft { role, nodes: gone });
        }
    }

    pub fn live_nodes(&self, role: NodeRole) -> Vec<NodeInfo> {
        self.state
            .lock()
            .live
            .get(&role)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl NodeDiscovery for LocalDiscovery {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for (role, nodes) in &state.live {
            if nodes.is_empty() {
                continue;
            }
            let _ = tx.send(MembershipEvent::NodesJoined {
                role: *role,
                nodes: nodes.iter().copied().collect(),
            });
        }
        state.subscribers.push(tx);
        rx
    }
}

fn group_by_role(nodes: &[NodeInfo]) -> BTreeMap<NodeRole, Vec<NodeInfo>> {
    let mut grouped: BTreeMap<NodeRole, Vec<NodeInfo>> = BTreeMap::new();
    for node in nodes {
        grouped.entry(node.role).or_default().push(*node);
    }
    grouped
}

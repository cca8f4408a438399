//! Execution hints: async prefetching and call-stack splits.
//!
//! Neither changes plan semantics. They mark nodes the execution engine may
//! run ahead of demand, and nodes where it should start a fresh call stack.

use std::collections::HashSet;

use tracing::debug;

use qgraph_core::id::NodeId;

use crate::kind::NodeKind;
use crate::node_type::NodeType;
use crate::plan::Plan;
use crate::walker::WalkerWorker;

/// Whether a node may produce rows ahead of its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncPrefetchEligibility {
    Enabled,
    /// Not this node, but its dependencies are unaffected.
    DisabledForNode,
    /// Neither this node nor anything below it.
    DisabledForNodeAndDependencies,
}

impl NodeKind {
    /// Per-kind eligibility, ignoring position in the plan.
    pub fn can_use_async_prefetching(&self) -> AsyncPrefetchEligibility {
        use AsyncPrefetchEligibility::*;
        match self {
            NodeKind::Filter(_)
            | NodeKind::EnumerateList(_)
            | NodeKind::Calculation(_)
            | NodeKind::EnumerateView(_)
            | NodeKind::Materialize(_) => Enabled,
            NodeKind::Limit(_) => DisabledForNodeAndDependencies,
            NodeKind::Insert(_)
            | NodeKind::Remove(_)
            | NodeKind::Replace(_)
            | NodeKind::Update(_)
            | NodeKind::Upsert(_) => DisabledForNodeAndDependencies,
            _ => DisabledForNode,
        }
    }
}

#[derive(Default)]
struct PostOrder {
    order: Vec<NodeId>,
}

impl WalkerWorker for PostOrder {
    fn after(&mut self, _plan: &Plan, id: NodeId) {
        self.order.push(id);
    }
}

impl Plan {
    /// Eligibility of `id` in this plan: the root RETURN never prefetches,
    /// and non-deterministic nodes are excluded.
    pub fn can_use_async_prefetching(&self, id: NodeId) -> AsyncPrefetchEligibility {
        let node = self.node(id);
        if self.root() == Some(id) && node.node_type() == NodeType::Return {
            return AsyncPrefetchEligibility::DisabledForNode;
        }
        match node.kind().can_use_async_prefetching() {
            AsyncPrefetchEligibility::Enabled if !self.is_deterministic(id) => {
                AsyncPrefetchEligibility::DisabledForNode
            }
            e => e,
        }
    }

    /// Flag every node that may prefetch. A node is blocked when any
    /// consumer above it (or the SUBQUERY owning its body) is disabled for
    /// its dependencies. Returns the number of enabled nodes.
    pub fn plan_async_prefetching(&mut self) -> usize {
        let ids: Vec<NodeId> = self.nodes().map(|n| n.id()).collect();
        for id in &ids {
            self.node_mut(*id).async_prefetch_enabled = false;
        }
        self.async_prefetch_nodes = 0;
        let Some(root) = self.root() else {
            return 0;
        };
        if !self.config().async_prefetch {
            debug!("async prefetching disabled by configuration");
            return 0;
        }

        let mut post = PostOrder::default();
        self.walk(root, &mut post);

        let mut blocked: HashSet<NodeId> = HashSet::new();
        let mut enabled = Vec::new();
        for &id in post.order.iter().rev() {
            let mut consumers = self.node(id).parents().to_vec();
            consumers.extend(self.subquery_owner(id));
            let blocked_here = consumers.iter().any(|c| {
                blocked.contains(c)
                    || self.can_use_async_prefetching(*c)
                        == AsyncPrefetchEligibility::DisabledForNodeAndDependencies
            });
            if blocked_here {
                blocked.insert(id);
            } else if self.can_use_async_prefetching(id) == AsyncPrefetchEligibility::Enabled {
                enabled.push(id);
            }
        }

        for id in &enabled {
            self.node_mut(*id).async_prefetch_enabled = true;
        }
        self.async_prefetch_nodes = enabled.len();
        debug!(enabled = enabled.len(), blocked = blocked.len(), "planned async prefetching");
        enabled.len()
    }

    /// Mark every `max_nodes_per_callstack`-th node in post-order so deep
    /// plans are executed on bounded call stacks. Returns how many were marked.
    pub fn plan_callstack_splits(&mut self) -> usize {
        let ids: Vec<NodeId> = self.nodes().map(|n| n.id()).collect();
        for id in ids {
            self.node_mut(id).callstack_split_enabled = false;
        }
        let every = self.config().max_nodes_per_callstack;
        let Some(root) = self.root() else {
            return 0;
        };
        if every == 0 {
            return 0;
        }
        let mut post = PostOrder::default();
        self.walk(root, &mut post);
        let marked: Vec<NodeId> = post
            .order
            .iter()
            .enumerate()
            .filter(|(i, _)| (i + 1) % every == 0)
            .map(|(_, id)| *id)
            .collect();
        for id in &marked {
            self.node_mut(*id).enable_callstack_split();
        }
        debug!(marked = marked.len(), every, "planned call-stack splits");
        marked.len()
    }
}

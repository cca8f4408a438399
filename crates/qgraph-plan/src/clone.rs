//! Node cloning.
//!
//! A clone copies the payload and the liveness/register metadata by value and
//! shares the register plan. Within one plan every clone gets a fresh id; into
//! another plan the id is kept unless it is already taken there.
//!
//! The node set is collected first (the start node, its dependency closure if
//! requested, and the bodies of any subqueries among them). All copies are
//! registered before any edge is wired, and a dependency shared by several
//! cloned nodes is cloned once, so the copy has the same shape as the source.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use qgraph_core::error::Result;
use qgraph_core::id::NodeId;

use crate::kind::NodeKind;
use crate::node::PlanNode;
use crate::plan::Plan;

impl Plan {
    /// Ids to clone, start node first.
    fn clone_set(&self, id: NodeId, with_dependencies: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        // (node, follow dependencies)
        let mut stack = vec![(id, with_dependencies)];
        while let Some((n, follow)) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            out.push(n);
            let node = self.node(n);
            if let NodeKind::Subquery(sq) = node.kind() {
                stack.push((sq.root, true));
            }
            if follow {
                for dep in node.dependencies().iter().rev() {
                    stack.push((*dep, true));
                }
            }
        }
        out
    }

    /// Clone `id` (and its dependency chain if `with_dependencies`) into this
    /// plan. Every copy receives a new id. Returns the id of the copy of `id`.
    pub fn clone_node(&mut self, id: NodeId, with_dependencies: bool) -> Result<NodeId> {
        let ids = self.clone_set(id, with_dependencies);
        let sources: Vec<PlanNode> = ids.iter().map(|n| self.node(*n).clone()).collect();
        let mut mapping = HashMap::new();
        for src in &sources {
            let new_id = self.next_id();
            mapping.insert(src.id, new_id);
        }
        self.materialize(&sources, &mapping)?;
        debug!(source = id.get(), copies = sources.len(), "cloned within plan");
        Ok(mapping[&id])
    }

    /// Clone `id` into `target`, keeping ids that are free there.
    pub fn clone_into(&self, id: NodeId, target: &mut Plan, with_dependencies: bool) -> Result<NodeId> {
        let ids = self.clone_set(id, with_dependencies);
        let sources: Vec<PlanNode> = ids.iter().map(|n| self.node(*n).clone()).collect();
        let kept: HashSet<NodeId> = sources
            .iter()
            .map(|n| n.id)
            .filter(|n| !target.contains(*n))
            .collect();
        let mut mapping = HashMap::new();
        for src in &sources {
            let new_id = if kept.contains(&src.id) {
                src.id
            } else {
                loop {
                    let fresh = target.next_id();
                    if !kept.contains(&fresh) {
                        break fresh;
                    }
                }
            };
            mapping.insert(src.id, new_id);
        }
        for v in self.variables().iter() {
            target.variables_mut().register(v)?;
        }
        target.materialize(&sources, &mapping)?;
        debug!(source = id.get(), copies = sources.len(), "cloned into other plan");
        Ok(mapping[&id])
    }

    fn materialize(&mut self, sources: &[PlanNode], mapping: &HashMap<NodeId, NodeId>) -> Result<()> {
        for src in sources {
            let mut copy = src.detached_copy(mapping[&src.id]);
            if let NodeKind::Subquery(sq) = &mut copy.kind {
                sq.root = mapping[&sq.root];
            }
            self.register_node(copy)?;
        }
        for src in sources {
            let parent = mapping[&src.id];
            for dep in &src.dependencies {
                if let Some(new_dep) = mapping.get(dep) {
                    self.add_dependency(parent, *new_dep);
                }
            }
        }
        Ok(())
    }
}

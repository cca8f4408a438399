//! The plan arena.
//!
//! `Plan` is the sole owner of every node. Edges are stored as `NodeId`s in
//! both directions and every edge mutation goes through [`Plan::update_edge`],
//! so `a.dependencies` contains `b` exactly when `b.parents` contains `a`.
//! A node can only be dropped from the arena once it has no edges left.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use qgraph_core::config::PlanConfig;
use qgraph_core::error::{Error, Result};
use qgraph_core::id::NodeId;
use qgraph_core::variable::{Variable, VariableGenerator};

use crate::expr::{VarReplacements, VarSet};
use crate::kind::NodeKind;
use crate::node::PlanNode;
use crate::node_type::NodeType;

/// Optional source of collection sizes for cost estimation.
pub trait CollectionStats: fmt::Debug {
    /// Number of documents in `collection`, if known.
    fn count(&self, collection: &str) -> Option<usize>;
}

/// Fixed sizes, handy for tests and the CLI.
#[derive(Debug, Clone, Default)]
pub struct StaticCollectionStats {
    pub counts: HashMap<String, usize>,
}

impl CollectionStats for StaticCollectionStats {
    fn count(&self, collection: &str) -> Option<usize> {
        self.counts.get(collection).copied()
    }
}

enum EdgeOp {
    /// Append `dep` to `parent.dependencies` (or insert at a position).
    Link { at: Option<usize> },
    /// Remove one occurrence of `dep` from `parent.dependencies`.
    Unlink,
}

#[derive(Debug)]
pub struct Plan {
    nodes: Vec<PlanNode>,
    index: HashMap<NodeId, usize>,
    root: Option<NodeId>,
    next_id: u64,
    variables: VariableGenerator,
    config: PlanConfig,
    stats: Option<Arc<dyn CollectionStats>>,
    pub(crate) async_prefetch_nodes: usize,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self::with_config(PlanConfig::default())
    }

    pub fn with_config(config: PlanConfig) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            root: None,
            next_id: 1,
            variables: VariableGenerator::new(),
            config,
            stats: None,
            async_prefetch_nodes: 0,
        }
    }

    pub fn config(&self) -> &PlanConfig {
        &self.config
    }

    pub fn set_collection_stats(&mut self, stats: Arc<dyn CollectionStats>) {
        self.stats = Some(stats);
    }

    /// Document count for `collection`, falling back to the configured default.
    pub fn collection_count(&self, collection: &str) -> usize {
        self.stats
            .as_ref()
            .and_then(|s| s.count(collection))
            .unwrap_or(self.config.default_collection_count)
    }

    pub fn variables(&self) -> &VariableGenerator {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut VariableGenerator {
        &mut self.variables
    }

    /// Shorthand for `variables_mut().create(name)`.
    pub fn create_variable(&mut self, name: impl Into<String>) -> Variable {
        self.variables.create(name)
    }

    /// Number of nodes marked for async prefetching by the last planning pass.
    pub fn async_prefetch_nodes(&self) -> usize {
        self.async_prefetch_nodes
    }

    // ---- arena ----

    /// Issue an id not used by any node in this plan.
    pub fn next_id(&mut self) -> NodeId {
        loop {
            let id = NodeId::new(self.next_id);
            self.next_id += 1;
            if !self.index.contains_key(&id) {
                return id;
            }
        }
    }

    /// Create a node with a fresh id. It has no edges yet.
    pub fn create_node(&mut self, kind: NodeKind) -> NodeId {
        let id = self.next_id();
        self.insert(PlanNode::new(id, kind));
        id
    }

    /// Add a node under an explicit id, as deserialization does.
    pub fn create_node_with_id(&mut self, id: NodeId, kind: NodeKind) -> Result<NodeId> {
        self.register_node(PlanNode::new(id, kind))
    }

    pub(crate) fn register_node(&mut self, node: PlanNode) -> Result<NodeId> {
        if self.index.contains_key(&node.id) {
            return Err(Error::Internal(format!("duplicate node id {}", node.id.get())));
        }
        let after = node.id.get().checked_add(1).ok_or_else(|| {
            Error::Internal(format!("node id {} is out of range", node.id.get()))
        })?;
        for v in node.kind.vars_set_here() {
            self.variables.register(&v)?;
        }
        self.next_id = self.next_id.max(after);
        let id = node.id;
        self.insert(node);
        Ok(id)
    }

    fn insert(&mut self, node: PlanNode) {
        trace!(id = node.id.get(), ty = node.type_name(), "registering node");
        self.index.insert(node.id, self.nodes.len());
        self.nodes.push(node);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Drop a detached node from the arena.
    pub fn remove_node(&mut self, id: NodeId) -> Result<PlanNode> {
        let node = self
            .get(id)
            .ok_or_else(|| Error::Internal(format!("unknown node {}", id.get())))?;
        if !node.dependencies().is_empty() || !node.parents().is_empty() {
            return Err(Error::Invariant(format!(
                "node {} still has edges",
                id.get()
            )));
        }
        let pos = self.index[&id];
        self.index.remove(&id);
        let node = self.nodes.swap_remove(pos);
        if let Some(moved) = self.nodes.get(pos) {
            self.index.insert(moved.id, pos);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        trace!(id = id.get(), "removed node");
        Ok(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&PlanNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut PlanNode> {
        match self.index.get(&id) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    /// Panics if `id` does not belong to this plan; a dangling id is a bug in
    /// the caller, not bad input.
    pub fn node(&self, id: NodeId) -> &PlanNode {
        &self.nodes[self.index[&id]]
    }

    /// See [`Plan::node`].
    pub fn node_mut(&mut self, id: NodeId) -> &mut PlanNode {
        let i = self.index[&id];
        &mut self.nodes[i]
    }

    pub fn node_type(&self, id: NodeId) -> NodeType {
        self.node(id).node_type()
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, id: NodeId) {
        debug_assert!(self.contains(id));
        self.root = Some(id);
    }

    // ---- edges ----

    /// The one place that touches `dependencies`/`parents`.
    fn update_edge(&mut self, parent: NodeId, dep: NodeId, op: EdgeOp) -> bool {
        match op {
            EdgeOp::Link { at } => {
                let deps = &mut self.node_mut(parent).dependencies;
                match at {
                    Some(i) if i <= deps.len() => deps.insert(i, dep),
                    _ => deps.push(dep),
                }
                self.node_mut(dep).parents.push(parent);
                true
            }
            EdgeOp::Unlink => {
                let deps = &mut self.node_mut(parent).dependencies;
                let Some(pos) = deps.iter().position(|d| *d == dep) else {
                    return false;
                };
                deps.remove(pos);
                let parents = &mut self.node_mut(dep).parents;
                if let Some(pos) = parents.iter().position(|p| *p == parent) {
                    parents.remove(pos);
                }
                true
            }
        }
    }

    pub fn add_dependency(&mut self, node: NodeId, dep: NodeId) {
        self.update_edge(node, dep, EdgeOp::Link { at: None });
    }

    /// Make `parent` depend on `node`.
    pub fn add_parent(&mut self, node: NodeId, parent: NodeId) {
        self.update_edge(parent, node, EdgeOp::Link { at: None });
    }

    /// Replace `old` by `new` in `node.dependencies`, keeping its position.
    /// Returns false if `old` was not a dependency.
    pub fn replace_dependency(&mut self, node: NodeId, old: NodeId, new: NodeId) -> bool {
        let Some(pos) = self.node(node).dependencies.iter().position(|d| *d == old) else {
            return false;
        };
        self.update_edge(node, old, EdgeOp::Unlink);
        self.update_edge(node, new, EdgeOp::Link { at: Some(pos) });
        true
    }

    pub fn remove_dependency(&mut self, node: NodeId, dep: NodeId) -> bool {
        self.update_edge(node, dep, EdgeOp::Unlink)
    }

    pub fn remove_dependencies(&mut self, node: NodeId) {
        let deps = self.node(node).dependencies.clone();
        for dep in deps {
            self.update_edge(node, dep, EdgeOp::Unlink);
        }
    }

    /// Swap the first dependency of `node` for `new`, fixing both parent lists.
    pub fn swap_first_dependency(&mut self, node: NodeId, new: NodeId) {
        match self.node(node).first_dependency() {
            Some(old) => {
                self.replace_dependency(node, old, new);
            }
            None => self.add_dependency(node, new),
        }
    }

    /// Cut `id` out of its chain: every parent now depends on `id`'s first
    /// dependency instead. If `id` was the root, that dependency becomes root.
    pub fn unlink_node(&mut self, id: NodeId) -> Result<()> {
        let dep = self.node(id).first_dependency();
        let parents = self.node(id).parents.clone();
        if dep.is_none() && !parents.is_empty() {
            return Err(Error::Invariant(format!(
                "cannot unlink node {} without a dependency",
                id.get()
            )));
        }
        for p in parents {
            match dep {
                Some(d) => {
                    self.replace_dependency(p, id, d);
                }
                None => {
                    self.remove_dependency(p, id);
                }
            }
        }
        self.remove_dependencies(id);
        if self.root == Some(id) {
            self.root = dep;
        }
        debug!(id = id.get(), "unlinked node");
        Ok(())
    }

    // ---- navigation ----

    pub fn first_dependency(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).first_dependency()
    }

    pub fn first_parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).first_parent()
    }

    /// Whether any node on the first-parent chain above `id` has type `ty`.
    pub fn has_parent_of_type(&self, id: NodeId, ty: NodeType) -> bool {
        let mut current = self.first_parent(id);
        while let Some(p) = current {
            if self.node_type(p) == ty {
                return true;
            }
            current = self.first_parent(p);
        }
        false
    }

    /// First SINGLETON strictly below `id` on the first-dependency chain.
    pub fn singleton_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = self.first_dependency(id);
        while let Some(n) = current {
            if self.node_type(n) == NodeType::Singleton {
                return Some(n);
            }
            current = self.first_dependency(n);
        }
        None
    }

    /// Nodes on the first-dependency chain starting at `id`.
    pub fn dependency_chain(&self, id: NodeId, include_self: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = Some(id);
        while let Some(n) = current {
            if include_self || n != id {
                out.push(n);
            }
            current = self.first_dependency(n);
        }
        out
    }

    /// Closest enumerating node below `id`, i.e. the loop `id` runs inside.
    pub fn loop_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        loop {
            if !self.node(current).has_dependency() {
                return None;
            }
            current = self.first_dependency(current)?;
            if self.node_type(current).is_loop() {
                return Some(current);
            }
        }
    }

    pub fn is_in_inner_loop(&self, id: NodeId) -> bool {
        self.loop_of(id).is_some()
    }

    fn chain_end(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(d) = self.first_dependency(current) {
            current = d;
        }
        current
    }

    /// True for nodes of a nested subquery body, whose chain bottoms out at a
    /// different singleton than the main query.
    pub fn is_in_subquery(&self, id: NodeId) -> bool {
        match self.root {
            Some(root) => self.chain_end(id) != self.chain_end(root),
            None => false,
        }
    }

    /// Structural equality by type, id, depth and splice flag, recursively
    /// over dependencies. `other` may be a different plan.
    pub fn is_equal_to(&self, id: NodeId, other: &Plan, other_id: NodeId) -> bool {
        let mut stack = vec![(id, other_id)];
        let mut seen = HashSet::new();
        while let Some((a, b)) = stack.pop() {
            if !seen.insert((a, b)) {
                continue;
            }
            let (Some(l), Some(r)) = (self.get(a), other.get(b)) else {
                return false;
            };
            if l.node_type() != r.node_type()
                || l.id != r.id
                || l.depth != r.depth
                || l.in_spliced_subquery != r.in_spliced_subquery
                || l.dependencies.len() != r.dependencies.len()
            {
                return false;
            }
            stack.extend(l.dependencies.iter().copied().zip(r.dependencies.iter().copied()));
        }
        true
    }

    // ---- variables ----

    /// Node that sets `var`, searched over the whole arena.
    pub fn get_var_set_by(&self, var: &Variable) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.kind.vars_set_here().iter().any(|v| v.id == var.id))
            .map(|n| n.id)
    }

    /// Variables read at `id`. For a SUBQUERY this includes every variable the
    /// body reads but does not define itself.
    pub fn variables_used_here(&self, id: NodeId) -> VarSet {
        let mut out = VarSet::new();
        match &self.node(id).kind {
            NodeKind::Subquery(sq) => {
                let body = self.subquery_body(sq.root);
                let mut set_inside = VarSet::new();
                let mut used_inside = VarSet::new();
                for n in &body {
                    let node = self.node(*n);
                    set_inside.extend(node.kind.vars_set_here());
                    node.kind.vars_used_here(&mut used_inside);
                }
                out.extend(
                    used_inside
                        .into_iter()
                        .filter(|v| !set_inside.iter().any(|s| s.id == v.id)),
                );
            }
            kind => kind.vars_used_here(&mut out),
        }
        out
    }

    pub fn variables_set_here(&self, id: NodeId) -> Vec<Variable> {
        self.node(id).kind.vars_set_here()
    }

    /// Every node reachable from a subquery root through dependencies and
    /// nested subquery bodies.
    pub fn subquery_body(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            out.push(n);
            let node = self.node(n);
            stack.extend(node.dependencies.iter().copied());
            if let NodeKind::Subquery(sq) = &node.kind {
                stack.push(sq.root);
            }
        }
        out
    }

    /// The SUBQUERY node whose body is rooted at `root`, if any.
    pub fn subquery_owner(&self, root: NodeId) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| matches!(&n.kind, NodeKind::Subquery(sq) if sq.root == root))
            .map(|n| n.id)
    }

    pub fn replace_variables(&mut self, id: NodeId, replacements: &VarReplacements) {
        self.node_mut(id).kind.replace_variables(replacements);
    }

    pub fn replace_attribute_access(
        &mut self,
        id: NodeId,
        search: &Variable,
        path: &[String],
        replacement: &Variable,
    ) {
        self.node_mut(id)
            .kind
            .replace_attribute_access(search, path, replacement);
    }

    /// Checks the arena: id index consistency, edge symmetry, no dangling
    /// edges, root present.
    pub fn verify(&self) -> Result<()> {
        if self.index.len() != self.nodes.len() {
            return Err(Error::Invariant("duplicate node ids in arena".into()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if self.index.get(&node.id) != Some(&i) {
                return Err(Error::Invariant(format!(
                    "index mismatch for node {}",
                    node.id.get()
                )));
            }
            for dep in &node.dependencies {
                let Some(d) = self.get(*dep) else {
                    return Err(Error::Invariant(format!(
                        "node {} depends on unknown node {}",
                        node.id.get(),
                        dep.get()
                    )));
                };
                let down = node.dependencies.iter().filter(|x| *x == dep).count();
                let up = d.parents.iter().filter(|p| **p == node.id).count();
                if down != up {
                    return Err(Error::Invariant(format!(
                        "asymmetric edge {} -> {}",
                        node.id.get(),
                        dep.get()
                    )));
                }
            }
            for parent in &node.parents {
                let Some(p) = self.get(*parent) else {
                    return Err(Error::Invariant(format!(
                        "node {} has unknown parent {}",
                        node.id.get(),
                        parent.get()
                    )));
                };
                if !p.dependencies.contains(&node.id) {
                    return Err(Error::Invariant(format!(
                        "asymmetric edge {} -> {}",
                        parent.get(),
                        node.id.get()
                    )));
                }
            }
        }
        if let Some(root) = self.root {
            if !self.contains(root) {
                return Err(Error::Invariant(format!("unknown root {}", root.get())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{FilterNode, ReturnNode};

    fn chain(plan: &mut Plan) -> (NodeId, NodeId, NodeId) {
        let x = plan.create_variable("x");
        let s = plan.create_node(NodeKind::Singleton);
        let f = plan.create_node(NodeKind::Filter(FilterNode {
            in_variable: x.clone(),
        }));
        let r = plan.create_node(NodeKind::Return(ReturnNode {
            in_variable: x,
            count: false,
        }));
        plan.add_dependency(f, s);
        plan.add_dependency(r, f);
        plan.set_root(r);
        (s, f, r)
    }

    #[test]
    fn edges_stay_symmetric() {
        let mut plan = Plan::new();
        let (s, f, r) = chain(&mut plan);
        plan.verify().unwrap();
        assert_eq!(plan.node(s).parents(), &[f]);

        let extra = plan.create_node(NodeKind::NoResults);
        assert!(plan.replace_dependency(r, f, extra));
        plan.verify().unwrap();
        assert!(plan.node(f).parents().is_empty());
        assert_eq!(plan.node(extra).parents(), &[r]);

        assert!(!plan.remove_dependency(r, f));
        plan.swap_first_dependency(r, f);
        plan.verify().unwrap();
        assert_eq!(plan.node(r).dependencies(), &[f]);
    }

    #[test]
    fn unlink_rewires_parents_and_root() {
        let mut plan = Plan::new();
        let (s, f, r) = chain(&mut plan);
        plan.unlink_node(f).unwrap();
        plan.verify().unwrap();
        assert_eq!(plan.node(r).dependencies(), &[s]);
        assert!(plan.node(f).dependencies().is_empty());

        plan.unlink_node(r).unwrap();
        assert_eq!(plan.root(), Some(s));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut plan = Plan::new();
        plan.create_node_with_id(NodeId::new(5), NodeKind::Singleton)
            .unwrap();
        let a = plan.create_node(NodeKind::Singleton);
        assert_eq!(a, NodeId::new(6));
        let err = plan
            .create_node_with_id(NodeId::new(5), NodeKind::Singleton)
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn only_detached_nodes_can_be_removed() {
        let mut plan = Plan::new();
        let (s, f, r) = chain(&mut plan);
        assert!(matches!(plan.remove_node(f), Err(Error::Invariant(_))));
        plan.unlink_node(f).unwrap();
        plan.remove_node(f).unwrap();
        assert!(!plan.contains(f));
        assert_eq!(plan.len(), 2);
        plan.verify().unwrap();
        assert_eq!(plan.node(r).dependencies(), &[s]);
    }

    #[test]
    fn shared_node_cannot_be_removed() {
        let mut plan = Plan::new();
        let s = plan.create_node(NodeKind::Singleton);
        let a = plan.create_node(NodeKind::NoResults);
        let b = plan.create_node(NodeKind::NoResults);
        plan.add_dependency(a, s);
        plan.add_dependency(b, s);
        assert!(matches!(plan.remove_node(s), Err(Error::Invariant(_))));
        assert!(plan.contains(s));
        plan.verify().unwrap();
    }

    #[test]
    fn largest_node_id_is_rejected() {
        let mut plan = Plan::new();
        let err = plan
            .create_node_with_id(NodeId::new(u64::MAX), NodeKind::Singleton)
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(plan.is_empty());
    }

    #[test]
    fn navigation_follows_first_edges() {
        let mut plan = Plan::new();
        let (s, f, r) = chain(&mut plan);
        assert_eq!(plan.singleton_of(r), Some(s));
        assert_eq!(plan.dependency_chain(r, true), vec![r, f, s]);
        assert_eq!(plan.dependency_chain(r, false), vec![f, s]);
        assert!(plan.has_parent_of_type(s, NodeType::Return));
        assert!(!plan.has_parent_of_type(r, NodeType::Return));
        assert!(!plan.is_in_inner_loop(r));
        assert!(!plan.is_in_subquery(f));
        assert!(plan.is_equal_to(r, &plan, r));
        assert!(!plan.is_equal_to(r, &plan, f));
    }
}

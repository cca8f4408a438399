//! Iterative depth-first traversal over a plan.
//!
//! Every whole-plan pass (cost, liveness, serialization, optimizer searches)
//! runs through [`Walker`]. The walk keeps its own stack of `(node, state)`
//! frames so plan depth never turns into call-stack depth.
//!
//! Flattening linearizes bounded fan-out regions. A parallel start (a GATHER
//! with several dependencies) descends into its first branch only and leaves a
//! bookmark. When that branch reaches the shared join node (SCATTER,
//! DISTRIBUTE or MUTEX with several parents) the walker switches to the next
//! untried branch instead. Only after the last branch is the join visited,
//! once, so every node still appears after all of its dependencies.

use std::collections::HashSet;

use tracing::trace;

use qgraph_core::id::NodeId;

use crate::kind::NodeKind;
use crate::node_type::NodeType;
use crate::plan::Plan;

/// Callbacks for a walk. All hooks have no-op defaults.
pub trait WalkerWorker {
    /// Called when `id` is first reached. Returning `true` aborts the walk.
    fn before(&mut self, _plan: &Plan, _id: NodeId) -> bool {
        false
    }

    /// Called once all dependencies of `id` (and its subquery, if entered)
    /// have been processed.
    fn after(&mut self, _plan: &Plan, _id: NodeId) {}

    /// Whether to descend into the body of SUBQUERY `subquery`.
    fn enter_subquery(&mut self, _plan: &Plan, _subquery: NodeId, _root: NodeId) -> bool {
        true
    }

    fn leave_subquery(&mut self, _plan: &Plan, _subquery: NodeId, _root: NodeId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkOrder {
    /// Dependencies, then the subquery body, then `after`.
    #[default]
    DependenciesFirst,
    /// Subquery body, then dependencies, then `after`.
    SubqueriesFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlattenMode {
    #[default]
    None,
    /// Only GATHER-over-ASYNC branches joined at a MUTEX.
    AsyncOnly,
    /// Every GATHER fan-in joined at SCATTER, DISTRIBUTE or MUTEX.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Uniqueness {
    /// Visit each node at most once.
    #[default]
    Unique,
    /// Visit a node once per path that reaches it.
    NonUnique,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Processed,
    InSubquery,
}

#[derive(Debug)]
struct Bookmark {
    start: NodeId,
    next_branch: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Walker {
    order: WalkOrder,
    flatten: FlattenMode,
    uniqueness: Uniqueness,
}

impl Walker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order(mut self, order: WalkOrder) -> Self {
        self.order = order;
        self
    }

    pub fn flatten(mut self, flatten: FlattenMode) -> Self {
        self.flatten = flatten;
        self
    }

    pub fn uniqueness(mut self, uniqueness: Uniqueness) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    fn is_parallel_start(&self, plan: &Plan, id: NodeId) -> bool {
        let node = plan.node(id);
        if node.node_type() != NodeType::Gather || node.dependencies().len() < 2 {
            return false;
        }
        match self.flatten {
            FlattenMode::None => false,
            FlattenMode::All => true,
            FlattenMode::AsyncOnly => node
                .dependencies()
                .iter()
                .all(|d| plan.node_type(*d) == NodeType::Async),
        }
    }

    fn is_join(&self, plan: &Plan, id: NodeId) -> bool {
        let node = plan.node(id);
        if node.parents().len() < 2 {
            return false;
        }
        match self.flatten {
            FlattenMode::None => false,
            FlattenMode::AsyncOnly => node.node_type() == NodeType::Mutex,
            FlattenMode::All => matches!(
                node.node_type(),
                NodeType::Scatter | NodeType::Distribute | NodeType::Mutex
            ),
        }
    }

    /// Walk from `start`. Returns `true` if a worker aborted the walk.
    pub fn walk<W: WalkerWorker + ?Sized>(&self, plan: &Plan, start: NodeId, worker: &mut W) -> bool {
        let mut stack: Vec<(NodeId, State)> = vec![(start, State::Pending)];
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut bookmarks: Vec<Bookmark> = Vec::new();

        while let Some((id, state)) = stack.pop() {
            match state {
                State::Pending => {
                    if self.is_join(plan, id) && self.resume_bookmark(plan, &mut bookmarks, &mut stack) {
                        trace!(join = id.get(), "deferring join node to next branch");
                        continue;
                    }
                    if self.uniqueness == Uniqueness::Unique && !seen.insert(id) {
                        continue;
                    }
                    if worker.before(plan, id) {
                        Self::unwind(plan, &mut stack, worker);
                        return true;
                    }
                    if self.order == WalkOrder::SubqueriesFirst {
                        if let Some(root) = subquery_root(plan, id) {
                            if worker.enter_subquery(plan, id, root) {
                                stack.push((id, State::InSubquery));
                                stack.push((root, State::Pending));
                                continue;
                            }
                        }
                    }
                    stack.push((id, State::Processed));
                    self.push_dependencies(plan, id, &mut stack, &mut bookmarks);
                }
                State::Processed => {
                    if let Some(bm) = bookmarks.last_mut() {
                        if bm.start == id {
                            let deps = plan.node(id).dependencies();
                            if bm.next_branch < deps.len() {
                                // A branch ended without reaching a join.
                                let branch = deps[bm.next_branch];
                                bm.next_branch += 1;
                                stack.push((id, State::Processed));
                                stack.push((branch, State::Pending));
                                continue;
                            }
                            bookmarks.pop();
                        }
                    }
                    if self.order == WalkOrder::DependenciesFirst {
                        if let Some(root) = subquery_root(plan, id) {
                            if worker.enter_subquery(plan, id, root) {
                                stack.push((id, State::InSubquery));
                                stack.push((root, State::Pending));
                                continue;
                            }
                        }
                    }
                    worker.after(plan, id);
                }
                State::InSubquery => {
                    if let Some(root) = subquery_root(plan, id) {
                        worker.leave_subquery(plan, id, root);
                    }
                    match self.order {
                        WalkOrder::SubqueriesFirst => {
                            stack.push((id, State::Processed));
                            self.push_dependencies(plan, id, &mut stack, &mut bookmarks);
                        }
                        WalkOrder::DependenciesFirst => worker.after(plan, id),
                    }
                }
            }
        }
        false
    }

    fn push_dependencies(
        &self,
        plan: &Plan,
        id: NodeId,
        stack: &mut Vec<(NodeId, State)>,
        bookmarks: &mut Vec<Bookmark>,
    ) {
        let deps = plan.node(id).dependencies();
        if self.is_parallel_start(plan, id) {
            bookmarks.push(Bookmark {
                start: id,
                next_branch: 1,
            });
            stack.push((deps[0], State::Pending));
            return;
        }
        // Reverse so the first dependency is popped first.
        for dep in deps.iter().rev() {
            stack.push((*dep, State::Pending));
        }
    }

    /// Switch to the next untried branch of the innermost parallel region.
    fn resume_bookmark(
        &self,
        plan: &Plan,
        bookmarks: &mut [Bookmark],
        stack: &mut Vec<(NodeId, State)>,
    ) -> bool {
        let Some(bm) = bookmarks.last_mut() else {
            return false;
        };
        let deps = plan.node(bm.start).dependencies();
        if bm.next_branch >= deps.len() {
            return false;
        }
        let branch = deps[bm.next_branch];
        bm.next_branch += 1;
        stack.push((branch, State::Pending));
        true
    }

    /// Close every subquery still open when a worker aborts.
    fn unwind<W: WalkerWorker + ?Sized>(plan: &Plan, stack: &mut Vec<(NodeId, State)>, worker: &mut W) {
        while let Some((id, state)) = stack.pop() {
            if state == State::InSubquery {
                if let Some(root) = subquery_root(plan, id) {
                    worker.leave_subquery(plan, id, root);
                }
            }
        }
    }
}

fn subquery_root(plan: &Plan, id: NodeId) -> Option<NodeId> {
    match plan.node(id).kind() {
        NodeKind::Subquery(sq) => Some(sq.root),
        _ => None,
    }
}

impl Plan {
    /// Dependency-first walk from `start`.
    pub fn walk<W: WalkerWorker + ?Sized>(&self, start: NodeId, worker: &mut W) -> bool {
        Walker::new().walk(self, start, worker)
    }

    pub fn walk_subqueries_first<W: WalkerWorker + ?Sized>(&self, start: NodeId, worker: &mut W) -> bool {
        Walker::new()
            .order(WalkOrder::SubqueriesFirst)
            .walk(self, start, worker)
    }

    /// Dependency-first walk that linearizes parallel regions.
    pub fn flat_walk<W: WalkerWorker + ?Sized>(
        &self,
        start: NodeId,
        worker: &mut W,
        async_only: bool,
    ) -> bool {
        let mode = if async_only {
            FlattenMode::AsyncOnly
        } else {
            FlattenMode::All
        };
        Walker::new().flatten(mode).walk(self, start, worker)
    }
}

/// Collects nodes of the given types. Set `enter_subqueries` to search
/// nested subquery bodies as well.
#[derive(Debug, Default)]
pub struct NodeFinder {
    types: Vec<NodeType>,
    enter_subqueries: bool,
    pub found: Vec<NodeId>,
}

impl NodeFinder {
    pub fn new(types: &[NodeType], enter_subqueries: bool) -> Self {
        Self {
            types: types.to_vec(),
            enter_subqueries,
            found: Vec::new(),
        }
    }
}

impl WalkerWorker for NodeFinder {
    fn before(&mut self, plan: &Plan, id: NodeId) -> bool {
        if self.types.contains(&plan.node_type(id)) {
            self.found.push(id);
        }
        false
    }

    fn enter_subquery(&mut self, _plan: &Plan, _subquery: NodeId, _root: NodeId) -> bool {
        self.enter_subqueries
    }
}

/// Records visit order, used by tests and the CLI's `--trace-walk`.
#[derive(Debug, Default)]
pub struct VisitRecorder {
    pub before: Vec<NodeId>,
    pub after: Vec<NodeId>,
    pub subqueries: Vec<NodeId>,
}

impl WalkerWorker for VisitRecorder {
    fn before(&mut self, _plan: &Plan, id: NodeId) -> bool {
        self.before.push(id);
        false
    }

    fn after(&mut self, _plan: &Plan, id: NodeId) {
        self.after.push(id);
    }

    fn enter_subquery(&mut self, _plan: &Plan, subquery: NodeId, _root: NodeId) -> bool {
        self.subqueries.push(subquery);
        true
    }
}

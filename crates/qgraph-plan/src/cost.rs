//! Cost estimation.
//!
//! Estimates are a heuristic `(rows, cost)` pair used to rank alternatives.
//! Each node's estimate is a function of its payload and its dependencies'
//! estimates. `get_cost` recomputes lazily with one post-order walk;
//! `invalidate_cost` marks the affected nodes stale.

use std::collections::HashSet;

use tracing::trace;

use qgraph_core::id::NodeId;

use crate::kind::{CollectMethod, NodeKind};
use crate::plan::Plan;
use crate::walker::WalkerWorker;

/// Extra per-row cost for random access.
const RANDOM_ACCESS_FACTOR: f64 = 1.005;

/// Cost of skipping one row in LIMIT.
const SKIP_COST: f64 = 0.000_001;

/// Assumed length of a shortest path.
const AVG_PATH_LENGTH: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub struct CostEstimate {
    pub estimated_cost: f64,
    pub estimated_nr_items: usize,
    valid: bool,
    /// Row counts of enclosing spliced subqueries.
    outer_estimated_nr_items: Vec<usize>,
}

impl CostEstimate {
    pub fn invalid() -> Self {
        Self {
            estimated_cost: 0.0,
            estimated_nr_items: 0,
            valid: false,
            outer_estimated_nr_items: Vec::new(),
        }
    }

    /// A valid estimate with no rows and no cost.
    pub fn empty() -> Self {
        Self {
            valid: true,
            ..Self::invalid()
        }
    }

    pub fn new(estimated_nr_items: usize, estimated_cost: f64) -> Self {
        Self {
            estimated_cost,
            estimated_nr_items,
            valid: true,
            outer_estimated_nr_items: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        *self = Self::invalid();
    }

    /// Remember the current row count when entering a spliced subquery.
    pub fn save_estimated_nr_items(&mut self) {
        self.outer_estimated_nr_items.push(self.estimated_nr_items);
    }

    /// Restore the row count saved by the matching subquery start.
    pub fn restore_estimated_nr_items(&mut self) {
        if let Some(items) = self.outer_estimated_nr_items.pop() {
            self.estimated_nr_items = items;
        }
    }

    pub fn nesting(&self) -> usize {
        self.outer_estimated_nr_items.len()
    }
}

fn estimate_aggregate_groups(input_rows: usize, num_group_keys: usize) -> usize {
    if num_group_keys == 0 {
        return 1;
    }
    let cardinality_factor = match num_group_keys {
        1 => 0.1,
        2 => 0.25,
        3 => 0.4,
        _ => 0.5,
    };
    ((input_rows as f64 * cardinality_factor) as usize)
        .max(1)
        .min(input_rows.max(1))
}

fn scale(items: usize, selectivity: f64) -> usize {
    (items as f64 * selectivity).ceil() as usize
}

impl Plan {
    /// Estimate for `id`, recomputing stale nodes below it first.
    pub fn get_cost(&self, id: NodeId) -> CostEstimate {
        {
            let cached = self.node(id).cost.borrow();
            if cached.is_valid() {
                return cached.clone();
            }
        }
        let mut worker = CostCalculator::default();
        self.walk(id, &mut worker);
        trace!(id = id.get(), recomputed = worker.recomputed.len(), "cost pass");
        self.node(id).cost.borrow().clone()
    }

    /// Mark `id`, everything below it (subquery bodies included) and
    /// everything that depends on it as stale.
    pub fn invalidate_cost(&self, id: NodeId) {
        let mut worker = CostInvalidator;
        self.walk(id, &mut worker);

        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(n) = stack.pop() {
            if !seen.insert(n) {
                continue;
            }
            self.node(n).cost.borrow_mut().invalidate();
            let node = self.node(n);
            stack.extend(node.parents().iter().copied());
            if node.parents().is_empty() {
                stack.extend(self.subquery_owner(n));
            }
        }
    }

    /// Invalidate every node reachable from the root.
    pub fn invalidate_all_costs(&self) {
        for node in self.nodes() {
            node.cost.borrow_mut().invalidate();
        }
    }

    fn dependency_estimate(&self, id: NodeId) -> CostEstimate {
        let deps = self.node(id).dependencies();
        match deps {
            [] => CostEstimate::empty(),
            [single] => self.get_cost(*single),
            many => {
                // Fan-in: rows and cost of all inputs add up.
                let mut total = CostEstimate::empty();
                for dep in many {
                    let c = self.get_cost(*dep);
                    total.estimated_nr_items = total.estimated_nr_items.saturating_add(c.estimated_nr_items);
                    total.estimated_cost += c.estimated_cost;
                    if total.outer_estimated_nr_items.is_empty() {
                        total.outer_estimated_nr_items = c.outer_estimated_nr_items;
                    }
                }
                total
            }
        }
    }

    /// Number of elements an ENUMERATE_LIST over `var` will produce per row.
    fn list_length(&self, var: &qgraph_core::variable::Variable) -> usize {
        let default = self.config().default_list_length;
        let Some(setter) = self.get_var_set_by(var) else {
            return default;
        };
        match self.node(setter).kind() {
            NodeKind::Calculation(calc) => calc.expression.known_length().unwrap_or(default),
            NodeKind::Subquery(sq) => self.get_cost(sq.root).estimated_nr_items,
            _ => default,
        }
    }

    /// This node's own estimate from its payload and its inputs. Inputs are
    /// fetched through `get_cost`, so they are never stale.
    pub fn estimate_cost(&self, id: NodeId) -> CostEstimate {
        let cfg = self.config();
        let mut est = self.dependency_estimate(id);
        let incoming = est.estimated_nr_items;
        let per_row = incoming as f64;

        match self.node(id).kind() {
            NodeKind::Singleton => {
                est.estimated_nr_items = 1;
                est.estimated_cost = 1.0;
            }
            NodeKind::EnumerateCollection(n) => {
                let count = self.collection_count(&n.collection);
                let factor = if n.random { RANDOM_ACCESS_FACTOR } else { 1.0 };
                est.estimated_nr_items = incoming.saturating_mul(count);
                est.estimated_cost += per_row * count as f64 * factor + 1.0;
                if n.filter.is_some() {
                    est.estimated_nr_items = scale(est.estimated_nr_items, cfg.filter_selectivity);
                }
            }
            NodeKind::EnumerateList(n) => {
                let length = self.list_length(&n.in_variable);
                est.estimated_nr_items = incoming.saturating_mul(length);
                est.estimated_cost += est.estimated_nr_items as f64;
                if n.filter.is_some() {
                    est.estimated_nr_items = scale(est.estimated_nr_items, cfg.filter_selectivity);
                }
            }
            NodeKind::Filter(_) => {
                est.estimated_cost += per_row;
                est.estimated_nr_items = scale(incoming, cfg.filter_selectivity);
            }
            NodeKind::Limit(n) => {
                let offset = usize::try_from(n.offset).unwrap_or(usize::MAX);
                let limit = usize::try_from(n.limit).unwrap_or(usize::MAX);
                est.estimated_cost += offset.min(incoming) as f64 * SKIP_COST;
                est.estimated_nr_items = incoming.saturating_sub(offset).min(limit);
                if n.full_count {
                    est.estimated_cost += per_row;
                } else {
                    est.estimated_cost += est.estimated_nr_items as f64;
                }
            }
            NodeKind::Calculation(_)
            | NodeKind::Return(_)
            | NodeKind::Materialize(_)
            | NodeKind::Window(_)
            | NodeKind::Insert(_)
            | NodeKind::Remove(_)
            | NodeKind::Replace(_)
            | NodeKind::Update(_)
            | NodeKind::Upsert(_)
            | NodeKind::Remote(_)
            | NodeKind::Distribute(_)
            | NodeKind::DistributeConsumer(_)
            | NodeKind::Mutex(_) => {
                est.estimated_cost += per_row;
            }
            NodeKind::Async => {}
            NodeKind::Subquery(sq) => {
                let sub = self.get_cost(sq.root);
                est.estimated_cost += per_row * sub.estimated_cost;
            }
            NodeKind::Sort(n) => {
                if incoming > 3 {
                    est.estimated_cost += per_row * per_row.log2();
                } else {
                    est.estimated_cost += per_row;
                }
                if let Some(limit) = n.limit {
                    est.estimated_nr_items =
                        incoming.min(usize::try_from(limit).unwrap_or(usize::MAX));
                }
            }
            NodeKind::Collect(n) => {
                est.estimated_cost += per_row;
                est.estimated_nr_items = match n.collect_options {
                    CollectMethod::Count => 1,
                    CollectMethod::Distinct => estimate_aggregate_groups(incoming, 1),
                    CollectMethod::Hash | CollectMethod::Sorted => {
                        estimate_aggregate_groups(incoming, n.groups.len())
                    }
                };
            }
            NodeKind::Scatter(n) => {
                est.estimated_cost += per_row * n.clients.len().max(1) as f64;
            }
            NodeKind::Gather(n) => {
                if !n.elements.is_empty() && incoming > 3 {
                    est.estimated_cost += per_row * per_row.log2();
                } else {
                    est.estimated_cost += per_row;
                }
            }
            NodeKind::NoResults => {
                est.estimated_nr_items = 0;
                est.estimated_cost = 0.5;
            }
            NodeKind::Traversal(n) => {
                let levels = usize::try_from(n.max_depth.saturating_sub(n.min_depth))
                    .unwrap_or(usize::MAX)
                    .saturating_add(1);
                est.estimated_nr_items = incoming
                    .saturating_mul(cfg.traversal_fanout)
                    .saturating_mul(levels);
                est.estimated_cost += est.estimated_nr_items as f64;
            }
            NodeKind::Index(n) => {
                let count = self.collection_count(&n.collection);
                let per_lookup = if n.unique {
                    1
                } else {
                    scale(count, cfg.index_selectivity).max(1)
                };
                est.estimated_nr_items = incoming.saturating_mul(per_lookup);
                est.estimated_cost +=
                    est.estimated_nr_items as f64 + per_row * (count.max(2) as f64).log2();
            }
            NodeKind::ShortestPath(_) => {
                est.estimated_nr_items = incoming.saturating_mul(AVG_PATH_LENGTH);
                est.estimated_cost += per_row * cfg.traversal_fanout as f64 * AVG_PATH_LENGTH as f64;
            }
            NodeKind::KShortestPaths(_) => {
                est.estimated_nr_items = incoming.saturating_mul(cfg.traversal_fanout);
                est.estimated_cost += per_row * cfg.traversal_fanout as f64 * AVG_PATH_LENGTH as f64;
            }
            NodeKind::RemoteSingle(_) => {
                est.estimated_nr_items = incoming.min(1);
                est.estimated_cost += 1.0;
            }
            NodeKind::EnumerateView(n) => {
                let count = self.collection_count(&n.view);
                est.estimated_nr_items = incoming.saturating_mul(count);
                if n.condition.is_some() {
                    est.estimated_nr_items = scale(est.estimated_nr_items, cfg.filter_selectivity);
                }
                est.estimated_cost += per_row * count as f64 + 1.0;
            }
            NodeKind::SubqueryStart(_) => {
                est.save_estimated_nr_items();
                est.estimated_cost += per_row;
            }
            NodeKind::SubqueryEnd(_) => {
                est.estimated_cost += per_row;
                est.restore_estimated_nr_items();
            }
            NodeKind::Join(n) => {
                let mut rows = incoming;
                let mut scanned = 0usize;
                for (i, info) in n.index_infos.iter().enumerate() {
                    let count = self.collection_count(&info.collection);
                    scanned = scanned.saturating_add(count);
                    rows = if i == 0 {
                        rows.saturating_mul(count)
                    } else {
                        scale(rows, cfg.index_selectivity).max(1)
                    };
                }
                est.estimated_nr_items = rows;
                est.estimated_cost += rows as f64 + scanned as f64;
            }
        }
        est.valid = true;
        est
    }
}

/// Recomputes stale estimates post-order.
#[derive(Debug, Default)]
struct CostCalculator {
    recomputed: HashSet<NodeId>,
}

impl WalkerWorker for CostCalculator {
    fn after(&mut self, plan: &Plan, id: NodeId) {
        let node = plan.node(id);
        let input_changed = node
            .dependencies()
            .iter()
            .any(|d| self.recomputed.contains(d))
            || matches!(node.kind(), NodeKind::Subquery(sq) if self.recomputed.contains(&sq.root));
        if node.cost.borrow().is_valid() && !input_changed {
            return;
        }
        node.cost.borrow_mut().invalidate();
        let est = plan.estimate_cost(id);
        *node.cost.borrow_mut() = est;
        self.recomputed.insert(id);
    }
}

/// Marks every visited node stale.
struct CostInvalidator;

impl WalkerWorker for CostInvalidator {
    fn before(&mut self, plan: &Plan, id: NodeId) -> bool {
        plan.node(id).cost.borrow_mut().invalidate();
        false
    }
}

//! Variable usage analysis.
//!
//! Walking from the root, `before` runs top-down and accumulates the variables
//! still needed by later nodes; `after` runs bottom-up and accumulates the
//! variables in scope. Each node stores a snapshot of both as stacks with one
//! frame per spliced subquery level.

use std::collections::HashMap;

use tracing::debug;

use qgraph_core::error::{Error, Result};
use qgraph_core::id::NodeId;

use crate::expr::VarSet;
use crate::kind::NodeKind;
use crate::plan::Plan;
use crate::walker::WalkerWorker;

#[derive(Debug, Default, Clone)]
struct Usage {
    used_later: Vec<VarSet>,
    valid: Vec<VarSet>,
}

#[derive(Debug)]
struct VarUsageFinder<'a> {
    used_later: Vec<VarSet>,
    valid: Vec<VarSet>,
    results: &'a mut HashMap<NodeId, Usage>,
}

impl<'a> VarUsageFinder<'a> {
    fn new(results: &'a mut HashMap<NodeId, Usage>, valid: Vec<VarSet>) -> Self {
        Self {
            used_later: vec![VarSet::new()],
            valid,
            results,
        }
    }

    fn top_used(&mut self) -> &mut VarSet {
        if self.used_later.is_empty() {
            self.used_later.push(VarSet::new());
        }
        let last = self.used_later.len() - 1;
        &mut self.used_later[last]
    }

    fn top_valid(&mut self) -> &mut VarSet {
        if self.valid.is_empty() {
            self.valid.push(VarSet::new());
        }
        let last = self.valid.len() - 1;
        &mut self.valid[last]
    }
}

impl WalkerWorker for VarUsageFinder<'_> {
    fn before(&mut self, plan: &Plan, id: NodeId) -> bool {
        let snapshot = self.used_later.clone();
        self.results.entry(id).or_default().used_later = snapshot;

        let used = plan.variables_used_here(id);
        match plan.node(id).kind() {
            NodeKind::SubqueryEnd(_) => {
                // Walking into the spliced body from its end.
                self.used_later.push(used);
            }
            NodeKind::SubqueryStart(_) => {
                // Leaving the body: what it needed from outside must survive
                // in the outer rows.
                if self.used_later.len() > 1 {
                    if let Some(inner) = self.used_later.pop() {
                        self.top_used().extend(inner);
                    }
                }
                self.top_used().extend(used);
            }
            _ => self.top_used().extend(used),
        }
        false
    }

    fn after(&mut self, plan: &Plan, id: NodeId) {
        match plan.node(id).kind() {
            NodeKind::SubqueryStart(_) => {
                let copy = self.top_valid().clone();
                self.valid.push(copy);
            }
            NodeKind::SubqueryEnd(_) => {
                if self.valid.len() > 1 {
                    self.valid.pop();
                }
            }
            _ => {}
        }
        let set = plan.variables_set_here(id);
        self.top_valid().extend(set);
        let snapshot = self.valid.clone();
        self.results.entry(id).or_default().valid = snapshot;
    }

    fn enter_subquery(&mut self, plan: &Plan, _subquery: NodeId, root: NodeId) -> bool {
        let mut inner = VarUsageFinder::new(&mut *self.results, self.valid.clone());
        plan.walk(root, &mut inner);
        false
    }
}

impl Plan {
    /// Compute `varsUsedLater`/`varsValid` stacks for every node reachable
    /// from the root, including nested subquery bodies.
    pub fn find_var_usage(&mut self) -> Result<()> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("plan has no root".into()))?;
        let mut results = HashMap::new();
        {
            let mut finder = VarUsageFinder::new(&mut results, vec![VarSet::new()]);
            self.walk(root, &mut finder);
        }
        let count = results.len();
        for (id, usage) in results {
            let node = self.node_mut(id);
            node.set_vars_used_later(usage.used_later);
            node.set_vars_valid(usage.valid);
            node.set_var_usage_valid();
        }
        debug!(nodes = count, "variable usage computed");
        Ok(())
    }

    pub fn invalidate_var_usage(&mut self) {
        let ids: Vec<NodeId> = self.nodes().map(|n| n.id()).collect();
        for id in ids {
            self.node_mut(id).invalidate_var_usage();
        }
    }
}

//! Rewriting nested subqueries into the spliced form.
//!
//! A `SUBQUERY` node whose body is `SINGLETON -> ... -> RETURN x` becomes
//! `SUBQUERY_START -> ... -> SUBQUERY_END(x)` inline in the outer chain. The
//! body's singleton and trailing RETURN disappear; every node of the inlined
//! body is flagged `isInSplicedSubquery`.

use tracing::debug;

use qgraph_core::error::{Error, Result};
use qgraph_core::id::NodeId;

use crate::kind::{NodeKind, SubqueryEndNode, SubqueryNode, SubqueryStartNode};
use crate::node_type::NodeType;
use crate::plan::Plan;

impl Plan {
    /// Splice every nested subquery. Returns how many were rewritten.
    pub fn splice_subqueries(&mut self) -> Result<usize> {
        let mut spliced = 0;
        loop {
            let next = self
                .nodes()
                .find(|n| n.node_type() == NodeType::Subquery)
                .map(|n| n.id());
            let Some(id) = next else { break };
            self.splice_subquery(id)?;
            spliced += 1;
        }
        if spliced > 0 {
            self.invalidate_var_usage();
            self.invalidate_all_costs();
        }
        debug!(spliced, nodes = self.len(), "spliced subqueries");
        Ok(spliced)
    }

    /// Inline one SUBQUERY node. Returns the new SUBQUERY_END.
    pub fn splice_subquery(&mut self, id: NodeId) -> Result<NodeId> {
        let SubqueryNode { root: body_root, out_variable } = match self.node(id).kind() {
            NodeKind::Subquery(sq) => sq.clone(),
            _ => {
                return Err(Error::Internal(format!(
                    "node {} is not a subquery",
                    id.get()
                )))
            }
        };
        let singleton = if self.node_type(body_root) == NodeType::Singleton {
            body_root
        } else {
            self.singleton_of(body_root).ok_or_else(|| {
                Error::Invariant(format!("subquery {} has no singleton", id.get()))
            })?
        };
        let outer_spliced = self.node(id).is_in_spliced_subquery();
        let returned = match self.node(body_root).kind() {
            NodeKind::Return(ret) if body_root != singleton => Some(ret.in_variable.clone()),
            _ => None,
        };
        let mut body = self.subquery_body(body_root);
        body.retain(|n| *n != singleton);

        let start = self.create_node(NodeKind::SubqueryStart(SubqueryStartNode {
            subquery_out_variable: Some(out_variable.clone()),
        }));
        for dep in self.node(id).dependencies().to_vec() {
            self.add_dependency(start, dep);
        }
        self.remove_dependencies(id);
        for parent in self.node(singleton).parents().to_vec() {
            self.replace_dependency(parent, singleton, start);
        }
        self.remove_node(singleton)?;

        let end = match returned {
            Some(in_variable) => {
                let kind = NodeKind::SubqueryEnd(SubqueryEndNode {
                    in_variable: Some(in_variable),
                    out_variable,
                });
                let below = self.first_dependency(body_root);
                self.remove_dependencies(body_root);
                self.remove_node(body_root)?;
                body.retain(|n| *n != body_root);
                let end = self.create_node(kind);
                if let Some(below) = below {
                    self.add_dependency(end, below);
                }
                end
            }
            None => {
                let end = self.create_node(NodeKind::SubqueryEnd(SubqueryEndNode {
                    in_variable: None,
                    out_variable,
                }));
                let below = if body_root == singleton { start } else { body_root };
                self.add_dependency(end, below);
                end
            }
        };

        for parent in self.node(id).parents().to_vec() {
            self.replace_dependency(parent, id, end);
        }
        let was_root = self.root() == Some(id);
        self.remove_node(id)?;
        if was_root {
            self.set_root(end);
        }

        for n in body {
            self.node_mut(n).set_is_in_spliced_subquery(true);
        }
        self.node_mut(start).set_is_in_spliced_subquery(outer_spliced);
        self.node_mut(end).set_is_in_spliced_subquery(outer_spliced);
        debug!(subquery = id.get(), start = start.get(), end = end.get(), "spliced");
        Ok(end)
    }
}

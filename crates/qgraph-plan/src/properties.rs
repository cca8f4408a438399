//! Whole-node properties that look through subquery bodies.

use qgraph_core::id::NodeId;

use crate::kind::NodeKind;
use crate::plan::Plan;

impl Plan {
    /// Determinism of `id`. A SUBQUERY is deterministic only if its whole
    /// body is.
    pub fn is_deterministic(&self, id: NodeId) -> bool {
        match self.node(id).kind() {
            NodeKind::Subquery(sq) => self
                .subquery_body(sq.root)
                .into_iter()
                .all(|n| self.node(n).kind().is_deterministic()),
            kind => kind.is_deterministic(),
        }
    }

    /// Whether `id` writes data, directly or from inside a subquery body.
    pub fn is_modification_node(&self, id: NodeId) -> bool {
        match self.node(id).kind() {
            NodeKind::Subquery(sq) => self
                .subquery_body(sq.root)
                .into_iter()
                .any(|n| self.node_type(n).is_modification()),
            _ => self.node_type(id).is_modification(),
        }
    }

    /// A SUBQUERY is constant when its result cannot change between
    /// iterations of the enclosing loop: it reads no outer variables, is
    /// deterministic and writes nothing. Non-subquery nodes are never const.
    pub fn is_const_subquery(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind(), NodeKind::Subquery(_))
            && self.variables_used_here(id).is_empty()
            && self.is_deterministic(id)
            && !self.is_modification_node(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::kind::{CalculationNode, ModificationNode, ReturnNode, SubqueryNode};
    use serde_json::json;

    fn subquery_over(plan: &mut Plan, expr: Expr, modify: bool) -> NodeId {
        let v = plan.create_variable("v");
        let out = plan.create_variable("out");
        let s = plan.create_node(NodeKind::Singleton);
        let c = plan.create_node(NodeKind::Calculation(CalculationNode {
            out_variable: v.clone(),
            expression: expr,
        }));
        plan.add_dependency(c, s);
        let mut top = c;
        if modify {
            let ins = plan.create_node(NodeKind::Insert(ModificationNode {
                collection: "c".into(),
                in_doc_variable: v.clone(),
                in_key_variable: None,
                out_variable_old: None,
                out_variable_new: None,
                modification_flags: Default::default(),
            }));
            plan.add_dependency(ins, top);
            top = ins;
        }
        let r = plan.create_node(NodeKind::Return(ReturnNode {
            in_variable: v,
            count: false,
        }));
        plan.add_dependency(r, top);
        plan.create_node(NodeKind::Subquery(SubqueryNode {
            root: r,
            out_variable: out,
        }))
    }

    #[test]
    fn constant_body_makes_a_const_subquery() {
        let mut plan = Plan::new();
        let sq = subquery_over(&mut plan, Expr::literal(json!(1)), false);
        assert!(plan.is_deterministic(sq));
        assert!(!plan.is_modification_node(sq));
        assert!(plan.is_const_subquery(sq));
    }

    #[test]
    fn random_call_poisons_determinism() {
        let mut plan = Plan::new();
        let sq = subquery_over(&mut plan, Expr::call("RAND", vec![], false), false);
        assert!(!plan.is_deterministic(sq));
        assert!(!plan.is_const_subquery(sq));
    }

    #[test]
    fn outer_reference_is_not_const() {
        let mut plan = Plan::new();
        let outer = plan.create_variable("outer");
        let sq = subquery_over(&mut plan, Expr::reference(&outer), false);
        assert!(plan.is_deterministic(sq));
        assert!(!plan.is_const_subquery(sq));
    }

    #[test]
    fn insert_in_body_is_a_modification() {
        let mut plan = Plan::new();
        let sq = subquery_over(&mut plan, Expr::literal(json!({})), true);
        assert!(plan.is_modification_node(sq));
        assert!(!plan.is_const_subquery(sq));
    }
}

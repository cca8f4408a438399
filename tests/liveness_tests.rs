//! Variable usage stacks and register planning across subquery forms.


use plan_fixtures::{linear, with_subquery};
use qgraph_core::id::{NodeId, RegisterId};
use qgraph_plan::{NodeType, Plan, VarSet};

fn names(set: &VarSet) -> Vec<&str> {
    set.iter().map(|v| v.name.as_str()).collect()
}

fn find(plan: &Plan, ty: NodeType) -> NodeId {
    plan.nodes()
        .find(|n| n.node_type() == ty)
        .map(|n| n.id())
        .unwrap()
}

#[test]
fn linear_registers() {
    let mut l = linear();
    l.plan.plan_registers().unwrap();
    let values = l.plan.variables().by_name("values").cloned().unwrap();
    let x = l.plan.variables().by_name("x").cloned().unwrap();

    assert_eq!(l.plan.node(l.calc).depth(), 0);
    assert_eq!(l.plan.node(l.list).depth(), 1);
    assert_eq!(l.plan.node(l.ret).depth(), 1);
    assert_eq!(l.plan.variable_to_register_id(l.ret, &values), Some(RegisterId::new(0)));
    assert_eq!(l.plan.variable_to_register_id(l.ret, &x), Some(RegisterId::new(1)));
    assert_eq!(l.plan.nr_input_registers(l.list), 1);
    assert_eq!(l.plan.nr_output_registers(l.list), 2);
    assert_eq!(l.plan.nr_output_registers(l.ret), 2);

    // The list is dead once it has been enumerated.
    assert!(l.plan.node(l.filter).regs_to_clear().contains(&RegisterId::new(0)));
    assert!(!l.plan.node(l.filter).regs_to_clear().contains(&RegisterId::new(1)));
    let keep = l.plan.node(l.filter).regs_to_keep_stack();
    assert_eq!(keep.len(), 1);
    assert!(keep[0].contains(&RegisterId::new(1)));
}

#[test]
fn every_node_shares_one_register_plan() {
    let mut l = linear();
    l.plan.plan_registers().unwrap();
    let first = l.plan.node(l.singleton).register_plan().unwrap().clone();
    for node in l.plan.nodes() {
        assert!(std::sync::Arc::ptr_eq(node.register_plan().unwrap(), &first));
    }
}

#[test]
fn nested_body_sees_outer_variables() {
    let mut w = with_subquery();
    w.plan.find_var_usage().unwrap();
    let filter = find(&w.plan, NodeType::Filter);
    // The body's valid set starts from the rows of the enclosing loop.
    let valid = names(w.plan.node(filter).vars_valid());
    assert!(valid.contains(&"x"));
    assert!(valid.contains(&"y"));
    assert!(!valid.contains(&"s"));
    assert_eq!(names(w.plan.node(w.ret).vars_valid()), vec!["outer", "x", "s"]);
}

#[test]
fn spliced_body_has_its_own_frame() {
    let mut w = with_subquery();
    w.plan.splice_subqueries().unwrap();
    w.plan.find_var_usage().unwrap();

    let start = find(&w.plan, NodeType::SubqueryStart);
    let end = find(&w.plan, NodeType::SubqueryEnd);
    let filter = find(&w.plan, NodeType::Filter);

    let f = w.plan.node(filter);
    assert_eq!(f.vars_used_later_stack().len(), 2);
    assert_eq!(f.vars_valid_stack().len(), 2);
    assert_eq!(names(&f.vars_used_later_stack()[0]), vec!["s"]);
    assert_eq!(names(f.vars_used_later()), vec!["x"]);
    assert!(names(f.vars_valid()).contains(&"x"));

    assert_eq!(w.plan.node(start).vars_valid_stack().len(), 2);
    assert_eq!(w.plan.node(end).vars_valid_stack().len(), 1);
    assert_eq!(names(w.plan.node(end).vars_valid()), vec!["outer", "x", "s"]);
    assert!(w.plan.node(w.ret).vars_used_later().is_empty());
}

#[test]
fn spliced_registers_keep_one_frame_per_level() {
    let mut w = with_subquery();
    w.plan.splice_subqueries().unwrap();
    w.plan.plan_registers().unwrap();
    let filter = find(&w.plan, NodeType::Filter);
    let node = w.plan.node(filter);
    assert_eq!(node.regs_to_keep_stack().len(), node.vars_valid_stack().len());
    let s = w.plan.variables().by_name("s").cloned().unwrap();
    assert!(w.plan.variable_to_register_id(w.ret, &s).is_some());
    // SUBQUERY_END opens a depth above the body.
    let end = find(&w.plan, NodeType::SubqueryEnd);
    assert!(w.plan.node(end).depth() > w.plan.node(filter).depth());
}

#[test]
fn invalidation_clears_usage() {
    let mut l = linear();
    l.plan.find_var_usage().unwrap();
    assert!(l.plan.node(l.ret).is_var_usage_valid());
    l.plan.invalidate_var_usage();
    assert!(l.plan.nodes().all(|n| !n.is_var_usage_valid()));
}

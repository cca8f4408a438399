//! End-to-end behaviour of the plan graph on small query shapes.


use std::collections::HashSet;

use plan_fixtures::{linear, with_subquery};
use qgraph_core::config::PlanConfig;
use qgraph_core::error::Error;
use qgraph_core::id::NodeId;
use qgraph_plan::{NodeType, Plan, SerializeFlags};
use serde_json::json;

#[test]
fn linear_plan_estimates() {
    let l = linear();
    let list = l.plan.get_cost(l.list);
    let ret = l.plan.get_cost(l.ret);
    assert_eq!(list.estimated_nr_items, 3);
    // ceil(3 * 0.5)
    assert_eq!(ret.estimated_nr_items, 2);
    assert!(ret.estimated_nr_items > 0);
    assert!(ret.estimated_nr_items <= list.estimated_nr_items);
    // 1 (singleton) + 1 (calc) + 3 (enumerate) + 3 (filter) + 2 (return)
    assert_eq!(ret.estimated_cost, 10.0);
}

#[test]
fn filter_uses_exactly_its_input() {
    let l = linear();
    let used: Vec<String> = l
        .plan
        .variables_used_here(l.filter)
        .into_iter()
        .map(|v| v.name)
        .collect();
    assert_eq!(used, vec!["x".to_string()]);
    assert!(l.plan.variables_set_here(l.filter).is_empty());
}

#[test]
fn linear_plan_round_trips() {
    let l = linear();
    let doc = l.plan.to_document(SerializeFlags::DETAILS).unwrap();
    let restored = Plan::from_document(&doc).unwrap();
    assert_eq!(restored.len(), l.plan.len());
    assert_eq!(restored.root(), Some(l.ret));
    for node in l.plan.nodes() {
        let copy = restored.get(node.id()).expect("id survives");
        assert_eq!(copy.node_type(), node.node_type());
        assert_eq!(copy.dependencies(), node.dependencies());
        assert_eq!(copy.kind(), node.kind());
    }
    assert!(l.plan.is_equal_to(l.ret, &restored, l.ret));
}

#[test]
fn cloning_with_dependencies_copies_the_chain() {
    let mut l = linear();
    let originals: HashSet<NodeId> = l.plan.nodes().map(|n| n.id()).collect();
    let copy = l.plan.clone_node(l.filter, true).unwrap();

    let chain = l.plan.dependency_chain(copy, true);
    assert_eq!(chain.len(), 4);
    assert!(chain.iter().all(|id| !originals.contains(id)));
    assert_eq!(l.plan.len(), originals.len() + 4);

    let types = |plan: &Plan, ids: &[NodeId]| -> Vec<NodeType> {
        ids.iter().map(|id| plan.node_type(*id)).collect()
    };
    let source = l.plan.dependency_chain(l.filter, true);
    assert_eq!(types(&l.plan, &chain), types(&l.plan, &source));
    assert_eq!(
        types(&l.plan, &chain),
        vec![
            NodeType::Filter,
            NodeType::EnumerateList,
            NodeType::Calculation,
            NodeType::Singleton,
        ]
    );
    l.plan.verify().unwrap();
    // Originals are untouched.
    assert_eq!(l.plan.node(l.filter).parents(), &[l.ret]);
}

#[test]
fn unknown_type_id_is_not_implemented() {
    let doc = json!([
        {"type": "SingletonNode", "typeID": 1, "id": 1, "dependencies": []},
        {"type": "IndexRangeNode", "typeID": 3, "id": 2, "dependencies": [1]},
    ]);
    let err = Plan::from_document(&doc).unwrap_err();
    assert!(err.is_not_implemented(), "{err}");

    let doc = json!([{"type": "Mystery", "typeID": 99, "id": 1, "dependencies": []}]);
    assert!(matches!(Plan::from_document(&doc), Err(Error::NotImplemented(_))));
}

#[test]
fn invalidation_forces_identical_recomputation() {
    let l = linear();
    let first = l.plan.get_cost(l.ret);
    l.plan.invalidate_cost(l.filter);
    assert!(!l.plan.node(l.ret).cached_cost().is_valid());
    assert!(!l.plan.node(l.singleton).cached_cost().is_valid());
    let again = l.plan.get_cost(l.ret);
    assert_eq!(first, again);
}

#[test]
fn selectivity_comes_from_config() {
    let config = PlanConfig {
        filter_selectivity: 1.0,
        ..PlanConfig::default()
    };
    let l = linear();
    let doc = l.plan.to_document(SerializeFlags::DETAILS).unwrap();
    let plan = Plan::from_document_with_config(&doc, config).unwrap();
    assert_eq!(plan.get_cost(l.ret).estimated_nr_items, 3);
}

#[test]
fn subquery_cost_multiplies_by_outer_rows() {
    let w = with_subquery();
    let body = w.plan.get_cost(w.body_root);
    let sq = w.plan.get_cost(w.subquery);
    let outer = w.plan.get_cost(w.plan.first_dependency(w.subquery).unwrap());
    assert_eq!(outer.estimated_nr_items, 2);
    assert_eq!(sq.estimated_nr_items, 2);
    assert_eq!(
        sq.estimated_cost,
        outer.estimated_cost + 2.0 * body.estimated_cost
    );
}

#[test]
fn splicing_keeps_rows_and_removes_nesting() {
    let mut w = with_subquery();
    let nested_rows = w.plan.get_cost(w.ret).estimated_nr_items;
    w.plan.splice_subqueries().unwrap();
    w.plan.verify().unwrap();
    assert!(w.plan.nodes().all(|n| n.node_type() != NodeType::Subquery));
    // SUBQUERY_END restores the outer row count.
    assert_eq!(w.plan.get_cost(w.ret).estimated_nr_items, nested_rows);
    let doc = w.plan.to_document(SerializeFlags::DETAILS).unwrap();
    let spliced: Vec<bool> = doc
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n.get("isInSplicedSubquery").is_some())
        .collect();
    assert_eq!(spliced.iter().filter(|s| **s).count(), 3);
}

#[test]
fn variables_resolve_to_their_defining_node() {
    let l = linear();
    let x = l.plan.variables().by_name("x").unwrap().clone();
    let values = l.plan.variables().by_name("values").unwrap().clone();
    assert_eq!(l.plan.get_var_set_by(&x), Some(l.list));
    assert_eq!(l.plan.get_var_set_by(&values), Some(l.calc));
    assert!(l.plan.variables_set_here(l.filter).is_empty());
}

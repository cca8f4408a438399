//! Plan documents: flag gating, nested subqueries, and malformed input.


use std::collections::BTreeSet;

use plan_fixtures::{linear, with_subquery};
use qgraph_core::error::Error;
use qgraph_core::id::NodeId;
use qgraph_plan::expr::{BinaryOp, Expr};
use qgraph_plan::kind::*;
use qgraph_plan::{NodeKind, NodeType, Plan, SerializeFlags};
use serde_json::{json, Value};

fn node<'a>(doc: &'a Value, id: u64) -> &'a Value {
    doc.as_array()
        .unwrap()
        .iter()
        .find(|n| n["id"] == json!(id))
        .unwrap()
}

#[test]
fn optional_fields_follow_flags() {
    let l = linear();
    let id = l.filter.get();

    let bare = l.plan.to_document(SerializeFlags::NONE).unwrap();
    let f = node(&bare, id);
    assert!(f.get("typeID").is_none());
    assert!(f.get("parents").is_none());
    assert!(f.get("estimatedCost").is_none());
    assert!(f.get("inVariable").is_none());

    let full = l
        .plan
        .to_document(SerializeFlags::DETAILS | SerializeFlags::PARENTS | SerializeFlags::ESTIMATES)
        .unwrap();
    let f = node(&full, id);
    assert_eq!(f["type"], "FilterNode");
    assert_eq!(f["typeID"], 5);
    assert_eq!(f["parents"], json!([l.ret.get()]));
    assert_eq!(f["dependencies"], json!([l.list.get()]));
    assert_eq!(f["estimatedNrItems"], 2);
    assert_eq!(f["inVariable"]["name"], "x");
    assert_eq!(f["depth"], 0);
    // No register plan yet: an empty block is written.
    assert_eq!(f["totalNrRegs"], 0);
}

#[test]
fn register_information_round_trips() {
    let mut l = linear();
    l.plan.plan_registers().unwrap();
    let flags = SerializeFlags::DETAILS | SerializeFlags::REGISTER_INFORMATION;
    let doc = l.plan.to_document(flags).unwrap();

    let f = node(&doc, l.filter.get());
    assert_eq!(f["varsUsedHere"][0]["name"], "x");
    assert!(f["varsSetHere"].as_array().unwrap().is_empty());
    assert!(f["varsUsedLaterStack"].is_array());
    assert!(f["nrRegs"].is_array());

    let restored = Plan::from_document(&doc).unwrap();
    for original in l.plan.nodes() {
        let copy = restored.node(original.id());
        assert_eq!(copy.depth(), original.depth());
        assert_eq!(copy.regs_to_clear(), original.regs_to_clear());
        assert_eq!(copy.regs_to_keep_stack(), original.regs_to_keep_stack());
        assert_eq!(copy.vars_used_later_stack(), original.vars_used_later_stack());
        assert_eq!(copy.vars_valid_stack(), original.vars_valid_stack());
        assert_eq!(
            copy.register_plan().map(|r| r.total_nr_regs),
            original.register_plan().map(|r| r.total_nr_regs)
        );
    }
    assert_eq!(
        restored.nr_output_registers(l.ret),
        l.plan.nr_output_registers(l.ret)
    );
}

#[test]
fn nested_subquery_round_trips() {
    let w = with_subquery();
    let doc = w.plan.to_document(SerializeFlags::DETAILS).unwrap();
    // Only the outer chain is at top level.
    assert_eq!(doc.as_array().unwrap().len(), 5);
    let sq = node(&doc, w.subquery.get());
    assert_eq!(sq["subquery"]["nodes"].as_array().unwrap().len(), 5);
    assert_eq!(sq["isConst"], false);

    let restored = Plan::from_document(&doc).unwrap();
    assert_eq!(restored.len(), w.plan.len());
    match restored.node(w.subquery).kind() {
        NodeKind::Subquery(payload) => assert_eq!(payload.root, w.body_root),
        other => panic!("unexpected {other:?}"),
    }
    assert!(restored.is_in_subquery(w.body_root));
    assert!(w.plan.is_equal_to(w.ret, &restored, w.ret));
    assert_eq!(
        restored.get_cost(w.ret).estimated_cost,
        w.plan.get_cost(w.ret).estimated_cost
    );
}

#[test]
fn execution_hints_are_written_only_when_set() {
    let mut l = linear();
    let before = l.plan.to_document(SerializeFlags::NONE).unwrap();
    assert!(node(&before, l.filter.get()).get("isAsyncPrefetchEnabled").is_none());

    let enabled = l.plan.plan_async_prefetching();
    assert!(enabled > 0);
    let doc = l.plan.to_document(SerializeFlags::NONE).unwrap();
    assert_eq!(node(&doc, l.filter.get())["isAsyncPrefetchEnabled"], true);
    assert!(node(&doc, l.ret.get()).get("isAsyncPrefetchEnabled").is_none());

    let restored = Plan::from_document(&doc).unwrap();
    assert_eq!(restored.async_prefetch_nodes(), enabled);
}

#[test]
fn explain_wraps_nodes_with_totals_and_fingerprint() {
    let l = linear();
    let explain = l.plan.explain().unwrap();
    assert_eq!(explain["rootNodeId"], l.ret.get());
    assert_eq!(explain["estimatedNrItems"], 2);
    assert_eq!(explain["nodes"].as_array().unwrap().len(), 5);
    let fp = explain["fingerprint"].as_str().unwrap().to_string();
    assert_eq!(fp.len(), 64);
    assert_eq!(l.plan.explain().unwrap()["fingerprint"], fp.as_str());

    let mut other = linear();
    other.plan.unlink_node(other.filter).unwrap();
    let changed = other.plan.explain().unwrap();
    assert_ne!(changed["fingerprint"], fp.as_str());

    // An explain document can be read back.
    let restored = Plan::from_document(&explain).unwrap();
    assert_eq!(restored.root(), Some(l.ret));
    assert!(restored.variables().by_name("values").is_some());
}

#[test]
fn legacy_single_frame_liveness_is_accepted() {
    let doc = json!([{
        "type": "SingletonNode", "id": 1, "dependencies": [],
        "varsUsedLater": [], "varsValid": [{"id": 0, "name": "a"}]
    }]);
    let plan = Plan::from_document(&doc).unwrap();
    let s = plan.node(qgraph_core::id::NodeId::new(1));
    assert!(s.is_var_usage_valid());
    assert_eq!(s.vars_valid_stack().len(), 1);
    assert_eq!(s.vars_valid().len(), 1);
}

#[test]
fn malformed_documents_are_rejected_whole() {
    let cases = [
        // empty regsToKeepStack
        json!([{"type": "SingletonNode", "id": 1, "dependencies": [], "regsToKeepStack": []}]),
        // dangling dependency
        json!([{"type": "SingletonNode", "id": 1, "dependencies": [7]}]),
        // duplicate id
        json!([
            {"type": "SingletonNode", "id": 1, "dependencies": []},
            {"type": "NoResultsNode", "id": 1, "dependencies": []},
        ]),
        // name and id disagree
        json!([{"type": "FilterNode", "typeID": 1, "id": 1, "dependencies": []}]),
        // missing id
        json!([{"type": "SingletonNode", "dependencies": []}]),
        // payload without its required field
        json!([{"type": "FilterNode", "id": 1, "dependencies": []}]),
        // not an array
        json!("nodes"),
    ];
    for doc in cases {
        let err = Plan::from_document(&doc).unwrap_err();
        assert!(matches!(err, Error::Internal(_)), "{doc}: {err}");
    }
}

#[test]
fn unsupported_shapes_are_not_implemented() {
    let x = json!({"id": 1, "name": "x"});
    let cases = [
        json!([{"type": "CollectNode", "id": 1, "dependencies": [],
                "groups": 5, "aggregates": []}]),
        json!([{"type": "CollectNode", "id": 1, "dependencies": [],
                "groups": [{"outVariable": x, "inVariable": x}]}]),
        json!([{"type": "WindowNode", "id": 1, "dependencies": [],
                "aggregates": {"n": 1}}]),
        json!([{"type": "SingletonNode", "id": 1, "dependencies": [],
                "regsToClear": "0"}]),
        json!([{"type": "SingletonNode", "id": 1, "dependencies": [],
                "varsUsedLater": 3, "varsValid": []}]),
    ];
    for doc in cases {
        let err = Plan::from_document(&doc).unwrap_err();
        assert!(err.is_not_implemented(), "{doc}: {err}");
    }
}

#[test]
fn ids_without_a_successor_are_rejected() {
    let node = json!([{"type": "SingletonNode", "id": u64::MAX, "dependencies": []}]);
    assert!(matches!(Plan::from_document(&node), Err(Error::Internal(_))));

    let variable = json!({
        "nodes": [{"type": "SingletonNode", "id": 1, "dependencies": []}],
        "variables": [{"id": u64::MAX, "name": "v"}],
    });
    assert!(matches!(Plan::from_document(&variable), Err(Error::Internal(_))));
}

#[test]
fn node_type_names_round_trip_through_ids() {
    for ty in NodeType::ALL {
        assert_eq!(NodeType::from_type_id(ty.type_id()).unwrap(), ty);
        assert_eq!(NodeType::from_type_name(ty.type_name()).unwrap(), ty);
    }
    assert!(NodeType::from_type_id(0).unwrap_err().is_not_implemented());
    assert!(NodeType::from_type_name("IndexRangeNode").is_err());
}

/// One populated payload per node type. The match has no catch-all so a new
/// type cannot be added without a sample here.
fn sample_kind(plan: &mut Plan, ty: NodeType) -> NodeKind {
    let a = plan.create_variable("a");
    let b = plan.create_variable("b");
    let c = plan.create_variable("c");
    let call = Expr::call(
        "CONCAT",
        vec![Expr::reference(&a), Expr::Range { low: 1, high: 3 }],
        false,
    );
    let cond = Expr::binary(BinaryOp::Lt, Expr::attribute(Expr::reference(&a), "k"), Expr::literal(7));
    let sort = vec![SortElement {
        in_variable: a.clone(),
        ascending: false,
        path: vec!["k".into()],
    }];
    let agg = vec![Aggregate {
        out_variable: c.clone(),
        in_variable: Some(b.clone()),
        function: "SUM".into(),
    }];
    let flags = ModificationOptions {
        ignore_errors: true,
        wait_for_sync: true,
        ignore_document_not_found: false,
    };
    let modification = ModificationNode {
        collection: "docs".into(),
        in_doc_variable: a.clone(),
        in_key_variable: Some(b.clone()),
        out_variable_old: Some(c.clone()),
        out_variable_new: None,
        modification_flags: flags.clone(),
    };
    match ty {
        NodeType::Singleton => NodeKind::Singleton,
        NodeType::NoResults => NodeKind::NoResults,
        NodeType::Async => NodeKind::Async,
        NodeType::EnumerateCollection => NodeKind::EnumerateCollection(EnumerateCollectionNode {
            collection: "docs".into(),
            out_variable: a,
            random: true,
            filter: Some(cond),
            projections: vec!["k".into()],
        }),
        NodeType::EnumerateList => NodeKind::EnumerateList(EnumerateListNode {
            in_variable: a,
            out_variable: b,
            filter: Some(cond),
        }),
        NodeType::Filter => NodeKind::Filter(FilterNode { in_variable: a }),
        NodeType::Limit => NodeKind::Limit(LimitNode {
            offset: 2,
            limit: 5,
            full_count: true,
        }),
        NodeType::Calculation => NodeKind::Calculation(CalculationNode {
            out_variable: b,
            expression: call,
        }),
        NodeType::Subquery => {
            let single = plan.create_node(NodeKind::Singleton);
            let ret = plan.create_node(NodeKind::Return(ReturnNode {
                in_variable: a,
                count: false,
            }));
            plan.add_dependency(ret, single);
            NodeKind::Subquery(SubqueryNode {
                root: ret,
                out_variable: b,
            })
        }
        NodeType::Sort => NodeKind::Sort(SortNode {
            elements: sort,
            stable: true,
            limit: Some(10),
        }),
        NodeType::Collect => NodeKind::Collect(CollectNode {
            groups: vec![GroupVariable {
                out_variable: b.clone(),
                in_variable: a.clone(),
            }],
            aggregates: agg,
            expression_variable: Some(a.clone()),
            out_variable: Some(c),
            keep_variables: vec![a],
            collect_options: CollectMethod::Sorted,
        }),
        NodeType::Scatter => NodeKind::Scatter(ScatterNode {
            clients: vec!["s1".into(), "s2".into()],
        }),
        NodeType::Gather => NodeKind::Gather(GatherNode {
            elements: sort,
            parallelism: GatherParallelism::Parallel,
        }),
        NodeType::Remote => NodeKind::Remote(RemoteNode {
            server: "s1".into(),
            own_name: "r".into(),
            query_id: "q7".into(),
        }),
        NodeType::Insert => NodeKind::Insert(modification),
        NodeType::Remove => NodeKind::Remove(modification),
        NodeType::Replace => NodeKind::Replace(modification),
        NodeType::Update => NodeKind::Update(modification),
        NodeType::Return => NodeKind::Return(ReturnNode {
            in_variable: a,
            count: true,
        }),
        NodeType::Distribute => NodeKind::Distribute(DistributeNode {
            variable: a,
            clients: vec!["s1".into()],
        }),
        NodeType::Upsert => NodeKind::Upsert(UpsertNode {
            collection: "docs".into(),
            in_doc_variable: a.clone(),
            insert_variable: b,
            update_variable: c,
            out_variable_new: Some(a),
            is_replace: true,
            modification_flags: flags,
        }),
        NodeType::Traversal => NodeKind::Traversal(TraversalNode {
            graph: "g".into(),
            start: Endpoint::Variable(a),
            vertex_out_variable: b,
            edge_out_variable: Some(c),
            path_out_variable: None,
            min_depth: 2,
            max_depth: 4,
            direction: Direction::Inbound,
        }),
        NodeType::Index => NodeKind::Index(IndexNode {
            collection: "docs".into(),
            indexes: vec!["primary".into()],
            out_variable: a,
            condition: Some(cond),
            unique: true,
            ascending: false,
        }),
        NodeType::ShortestPath => NodeKind::ShortestPath(ShortestPathNode {
            graph: "g".into(),
            start: Endpoint::Constant("v/1".into()),
            target: Endpoint::Variable(a),
            vertex_out_variable: Some(b),
            edge_out_variable: Some(c),
            direction: Direction::Any,
        }),
        NodeType::KShortestPaths => NodeKind::KShortestPaths(KShortestPathsNode {
            graph: "g".into(),
            start: Endpoint::Variable(a),
            target: Endpoint::Constant("v/9".into()),
            path_out_variable: b,
            direction: Direction::Outbound,
        }),
        NodeType::RemoteSingle => NodeKind::RemoteSingle(RemoteSingleNode {
            collection: "docs".into(),
            key: "k1".into(),
            in_variable: Some(a),
            out_variable: Some(b),
            out_variable_old: Some(c),
            out_variable_new: None,
        }),
        NodeType::EnumerateView => NodeKind::EnumerateView(EnumerateViewNode {
            view: "v".into(),
            out_variable: a,
            condition: Some(cond),
            scorers: vec![Scorer {
                out_variable: b,
                expression: call,
            }],
        }),
        NodeType::DistributeConsumer => NodeKind::DistributeConsumer(DistributeConsumerNode {
            distribute_id: "d1".into(),
        }),
        NodeType::SubqueryStart => NodeKind::SubqueryStart(SubqueryStartNode {
            subquery_out_variable: Some(a),
        }),
        NodeType::SubqueryEnd => NodeKind::SubqueryEnd(SubqueryEndNode {
            in_variable: Some(a),
            out_variable: b,
        }),
        NodeType::Materialize => NodeKind::Materialize(MaterializeNode {
            collection: Some("docs".into()),
            in_nm_doc_id: a,
            out_variable: b,
            old_doc_variable: Some(c),
        }),
        NodeType::Mutex => NodeKind::Mutex(MutexNode {
            clients: vec!["s2".into()],
        }),
        NodeType::Window => NodeKind::Window(WindowNode {
            range_variable: Some(a),
            bounds: WindowBounds {
                preceding: json!(2),
                following: json!("unbounded"),
            },
            aggregates: agg,
        }),
        NodeType::Join => NodeKind::Join(JoinNode {
            index_infos: vec![JoinIndexInfo {
                collection: "docs".into(),
                index: "idx".into(),
                out_variable: a,
                condition: Some(cond),
                projections: vec!["k".into()],
                produce_result: true,
            }],
            options: JoinOptions {
                use_cache: true,
                parallelism: 3,
            },
        }),
    }
}

#[test]
fn every_node_kind_round_trips_with_its_payload() {
    let mut plan = Plan::new();
    let mut top: Option<NodeId> = None;
    for ty in NodeType::ALL {
        let kind = sample_kind(&mut plan, ty);
        let id = plan.create_node(kind);
        if let Some(prev) = top {
            plan.add_dependency(id, prev);
        }
        top = Some(id);
    }
    let root = top.unwrap();
    plan.set_root(root);

    let doc = plan.to_document(SerializeFlags::DETAILS).unwrap();
    let restored = Plan::from_document(&doc).unwrap();

    assert_eq!(restored.len(), plan.len());
    assert_eq!(restored.root(), Some(root));
    let seen: BTreeSet<NodeType> = restored.nodes().map(|n| n.node_type()).collect();
    assert_eq!(seen.len(), NodeType::ALL.len());
    for original in plan.nodes() {
        let back = restored.node(original.id());
        assert_eq!(back.kind(), original.kind(), "{:?}", original.node_type());
        assert_eq!(back.dependencies(), original.dependencies());
    }
}

#[test]
fn function_calls_are_listed_only_when_requested() {
    let mut plan = Plan::new();
    let v = plan.create_variable("v");
    let single = plan.create_node(NodeKind::Singleton);
    let expression = Expr::call(
        "CONCAT",
        vec![
            Expr::call("RAND", vec![], false),
            Expr::call("CONCAT", vec![Expr::literal(1)], true),
        ],
        true,
    );
    let calc = plan.create_node(NodeKind::Calculation(CalculationNode {
        out_variable: v.clone(),
        expression,
    }));
    let ret = plan.create_node(NodeKind::Return(ReturnNode {
        in_variable: v,
        count: false,
    }));
    plan.add_dependency(calc, single);
    plan.add_dependency(ret, calc);
    plan.set_root(ret);

    let plain = plan.to_document(SerializeFlags::DETAILS).unwrap();
    assert!(node(&plain, calc.get()).get("functions").is_none());

    let doc = plan
        .to_document(SerializeFlags::DETAILS | SerializeFlags::FUNCTIONS)
        .unwrap();
    assert_eq!(
        node(&doc, calc.get())["functions"],
        json!([
            {"name": "CONCAT", "isDeterministic": true},
            {"name": "RAND", "isDeterministic": false},
        ])
    );
    assert!(node(&doc, ret.get()).get("functions").is_none());
    // Readers ignore the listing.
    let restored = Plan::from_document(&doc).unwrap();
    assert_eq!(restored.node(calc).kind(), plan.node(calc).kind());
}

/// Shift every node id in a flat document by `offset`.
fn shift_ids(doc: &Value, offset: u64) -> Value {
    let shift = |v: &Value| json!(v.as_u64().unwrap() + offset);
    let mut doc = doc.clone();
    for n in doc.as_array_mut().unwrap() {
        let id = shift(&n["id"]);
        n["id"] = id;
        let deps: Vec<Value> = n["dependencies"].as_array().unwrap().iter().map(shift).collect();
        n["dependencies"] = Value::Array(deps);
    }
    doc
}

#[test]
fn fingerprint_follows_structure_not_ids() {
    let l = linear();
    let fp = l.plan.fingerprint().unwrap();
    assert_eq!(l.plan.explain().unwrap()["fingerprint"], fp.to_hex());

    let doc = l.plan.to_document(SerializeFlags::DETAILS).unwrap();
    let moved = Plan::from_document(&shift_ids(&doc, 100)).unwrap();
    assert_ne!(moved.root(), l.plan.root());
    assert_eq!(moved.fingerprint().unwrap(), fp);

    let mut limited = linear();
    let limit = limited.plan.create_node(NodeKind::Limit(LimitNode {
        offset: 0,
        limit: 1,
        full_count: false,
    }));
    limited.plan.add_dependency(limit, limited.filter);
    limited.plan.replace_dependency(limited.ret, limited.filter, limit);
    let one = limited.plan.fingerprint().unwrap();
    assert_ne!(one, fp);
    if let NodeKind::Limit(n) = limited.plan.node_mut(limit).kind_mut() {
        n.limit = 2;
    }
    assert_ne!(limited.plan.fingerprint().unwrap(), one);

    let w = with_subquery();
    let nested = w.plan.fingerprint().unwrap();
    assert_ne!(nested, fp);
    let doc = w.plan.to_document(SerializeFlags::DETAILS).unwrap();
    let restored = Plan::from_document(&doc).unwrap();
    assert_eq!(restored.fingerprint().unwrap(), nested);
}

use criterion::{criterion_group, criterion_main, Criterion};
use qgraph_plan::expr::Expr;
use qgraph_plan::kind::{CalculationNode, EnumerateListNode, FilterNode, ReturnNode};
use qgraph_plan::{NodeKind, Plan, SerializeFlags, VisitRecorder};
use serde_json::json;

/// A single chain of `depth` FILTER/CALCULATION pairs over one list.
fn deep_plan(depth: usize) -> Plan {
    let mut plan = Plan::new();
    let list = plan.create_variable("list");
    let x = plan.create_variable("x");
    let mut top = plan.create_node(NodeKind::Singleton);
    let calc = plan.create_node(NodeKind::Calculation(CalculationNode {
        out_variable: list.clone(),
        expression: Expr::literal(json!([1, 2, 3, 4])),
    }));
    plan.add_dependency(calc, top);
    top = plan.create_node(NodeKind::EnumerateList(EnumerateListNode {
        in_variable: list,
        out_variable: x.clone(),
        filter: None,
    }));
    plan.add_dependency(top, calc);
    for _ in 0..depth {
        let y = plan.create_variable("y");
        let c = plan.create_node(NodeKind::Calculation(CalculationNode {
            out_variable: y.clone(),
            expression: Expr::reference(&x),
        }));
        plan.add_dependency(c, top);
        let f = plan.create_node(NodeKind::Filter(FilterNode { in_variable: y }));
        plan.add_dependency(f, c);
        top = f;
    }
    let r = plan.create_node(NodeKind::Return(ReturnNode {
        in_variable: x,
        count: false,
    }));
    plan.add_dependency(r, top);
    plan.set_root(r);
    plan
}

fn bench_walk(c: &mut Criterion) {
    let plan = deep_plan(5_000);
    let root = plan.root().unwrap();
    c.bench_function("walk_deep_chain", |b| {
        b.iter(|| {
            let mut recorder = VisitRecorder::default();
            plan.walk(root, &mut recorder);
            recorder.after.len()
        })
    });
}

fn bench_cost(c: &mut Criterion) {
    let plan = deep_plan(5_000);
    let root = plan.root().unwrap();
    c.bench_function("cost_after_invalidation", |b| {
        b.iter(|| {
            plan.invalidate_all_costs();
            plan.get_cost(root).estimated_cost
        })
    });
}

fn bench_roundtrip(c: &mut Criterion) {
    let plan = deep_plan(500);
    c.bench_function("serialize_deserialize", |b| {
        b.iter(|| {
            let doc = plan.to_document(SerializeFlags::DETAILS).unwrap();
            Plan::from_document(&doc).unwrap().len()
        })
    });
}

criterion_group!(plans, bench_walk, bench_cost, bench_roundtrip);
criterion_main!(plans);

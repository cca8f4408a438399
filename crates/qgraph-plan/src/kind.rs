//! Variant payloads and the per-variant half of the shared node contract.
//!
//! `NodeKind` is the closed sum type over every node kind. Anything that needs
//! only the payload (variable usage, rewrites, determinism, payload JSON) is
//! dispatched here with one `match`; anything that needs the surrounding plan
//! (cost, subquery bodies) lives on `Plan`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use qgraph_core::error::{Error, Result};
use qgraph_core::id::NodeId;
use qgraph_core::variable::Variable;

use crate::expr::{Expr, VarReplacements, VarSet};
use crate::node_type::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outbound,
    Inbound,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMethod {
    #[default]
    Hash,
    Sorted,
    Distinct,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatherParallelism {
    #[default]
    Undefined,
    Serial,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortElement {
    pub in_variable: Variable,
    #[serde(default = "default_true")]
    pub ascending: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVariable {
    pub out_variable: Variable,
    pub in_variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_variable: Option<Variable>,
    #[serde(rename = "type")]
    pub function: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModificationOptions {
    pub ignore_errors: bool,
    pub wait_for_sync: bool,
    pub ignore_document_not_found: bool,
}

/// Start or target of a path search: a variable or a constant document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Endpoint {
    Variable(Variable),
    Constant(String),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumerateCollectionNode {
    pub collection: String,
    pub out_variable: Variable,
    #[serde(default)]
    pub random: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumerateListNode {
    pub in_variable: Variable,
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterNode {
    pub in_variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitNode {
    #[serde(default)]
    pub offset: u64,
    pub limit: u64,
    #[serde(default)]
    pub full_count: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationNode {
    pub out_variable: Variable,
    pub expression: Expr,
}

/// A nested subquery. The body lives in the same plan arena; `root` is the
/// body's final node, reachable only through this payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SubqueryNode {
    pub root: NodeId,
    pub out_variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortNode {
    pub elements: Vec<SortElement>,
    #[serde(default)]
    pub stable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectNode {
    #[serde(default)]
    pub groups: Vec<GroupVariable>,
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keep_variables: Vec<Variable>,
    #[serde(default)]
    pub collect_options: CollectMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScatterNode {
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatherNode {
    pub elements: Vec<SortElement>,
    pub parallelism: GatherParallelism,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteNode {
    pub server: String,
    pub own_name: String,
    pub query_id: String,
}

/// Shared payload of INSERT, REMOVE, REPLACE and UPDATE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationNode {
    pub collection: String,
    pub in_doc_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_key_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable_old: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable_new: Option<Variable>,
    #[serde(default)]
    pub modification_flags: ModificationOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertNode {
    pub collection: String,
    pub in_doc_variable: Variable,
    pub insert_variable: Variable,
    pub update_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable_new: Option<Variable>,
    #[serde(default)]
    pub is_replace: bool,
    #[serde(default)]
    pub modification_flags: ModificationOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnNode {
    pub in_variable: Variable,
    #[serde(default)]
    pub count: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeNode {
    pub variable: Variable,
    #[serde(default)]
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalNode {
    pub graph: String,
    pub start: Endpoint,
    pub vertex_out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_out_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_out_variable: Option<Variable>,
    #[serde(default = "default_min_depth")]
    pub min_depth: u32,
    #[serde(default = "default_min_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub direction: Direction,
}

fn default_min_depth() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexNode {
    pub collection: String,
    pub indexes: Vec<String>,
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShortestPathNode {
    pub graph: String,
    pub start: Endpoint,
    pub target: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_out_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_out_variable: Option<Variable>,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KShortestPathsNode {
    pub graph: String,
    pub start: Endpoint,
    pub target: Endpoint,
    pub path_out_variable: Variable,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSingleNode {
    pub collection: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable_old: Option<Variable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_variable_new: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scorer {
    pub out_variable: Variable,
    pub expression: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnumerateViewNode {
    pub view: String,
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scorers: Vec<Scorer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistributeConsumerNode {
    pub distribute_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubqueryStartNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subquery_out_variable: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubqueryEndNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_variable: Option<Variable>,
    pub out_variable: Variable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializeNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub in_nm_doc_id: Variable,
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_doc_variable: Option<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutexNode {
    pub clients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBounds {
    pub preceding: Value,
    pub following: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_variable: Option<Variable>,
    pub bounds: WindowBounds,
    #[serde(default)]
    pub aggregates: Vec<Aggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinIndexInfo {
    pub collection: String,
    pub index: String,
    pub out_variable: Variable,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projections: Vec<String>,
    #[serde(default)]
    pub produce_result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinOptions {
    pub use_cache: bool,
    pub parallelism: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinNode {
    pub index_infos: Vec<JoinIndexInfo>,
    #[serde(default)]
    pub options: JoinOptions,
}

/// Closed sum type over every plan node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Singleton,
    EnumerateCollection(EnumerateCollectionNode),
    EnumerateList(EnumerateListNode),
    Filter(FilterNode),
    Limit(LimitNode),
    Calculation(CalculationNode),
    Subquery(SubqueryNode),
    Sort(SortNode),
    Collect(CollectNode),
    Scatter(ScatterNode),
    Gather(GatherNode),
    Remote(RemoteNode),
    Insert(ModificationNode),
    Remove(ModificationNode),
    Replace(ModificationNode),
    Update(ModificationNode),
    Return(ReturnNode),
    NoResults,
    Distribute(DistributeNode),
    Upsert(UpsertNode),
    Traversal(TraversalNode),
    Index(IndexNode),
    ShortestPath(ShortestPathNode),
    KShortestPaths(KShortestPathsNode),
    RemoteSingle(RemoteSingleNode),
    EnumerateView(EnumerateViewNode),
    DistributeConsumer(DistributeConsumerNode),
    SubqueryStart(SubqueryStartNode),
    SubqueryEnd(SubqueryEndNode),
    Materialize(MaterializeNode),
    Async,
    Mutex(MutexNode),
    Window(WindowNode),
    Join(JoinNode),
}

fn opt(v: &Option<Variable>, out: &mut VarSet) {
    if let Some(v) = v {
        out.insert(v.clone());
    }
}

fn endpoint(e: &Endpoint, out: &mut VarSet) {
    if let Endpoint::Variable(v) = e {
        out.insert(v.clone());
    }
}

fn replace(v: &mut Variable, map: &VarReplacements) {
    if let Some(n) = map.get(&v.id) {
        *v = n.clone();
    }
}

fn replace_opt(v: &mut Option<Variable>, map: &VarReplacements) {
    if let Some(v) = v {
        replace(v, map);
    }
}

fn replace_endpoint(e: &mut Endpoint, map: &VarReplacements) {
    if let Endpoint::Variable(v) = e {
        replace(v, map);
    }
}

fn expr_vars_excluding(e: Option<&Expr>, own: &[&Variable], out: &mut VarSet) {
    if let Some(e) = e {
        let mut vars = VarSet::new();
        e.variables(&mut vars);
        for v in vars {
            if !own.iter().any(|o| o.id == v.id) {
                out.insert(v);
            }
        }
    }
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Singleton => NodeType::Singleton,
            NodeKind::EnumerateCollection(_) => NodeType::EnumerateCollection,
            NodeKind::EnumerateList(_) => NodeType::EnumerateList,
            NodeKind::Filter(_) => NodeType::Filter,
            NodeKind::Limit(_) => NodeType::Limit,
            NodeKind::Calculation(_) => NodeType::Calculation,
            NodeKind::Subquery(_) => NodeType::Subquery,
            NodeKind::Sort(_) => NodeType::Sort,
            NodeKind::Collect(_) => NodeType::Collect,
            NodeKind::Scatter(_) => NodeType::Scatter,
            NodeKind::Gather(_) => NodeType::Gather,
            NodeKind::Remote(_) => NodeType::Remote,
            NodeKind::Insert(_) => NodeType::Insert,
            NodeKind::Remove(_) => NodeType::Remove,
            NodeKind::Replace(_) => NodeType::Replace,
            NodeKind::Update(_) => NodeType::Update,
            NodeKind::Return(_) => NodeType::Return,
            NodeKind::NoResults => NodeType::NoResults,
            NodeKind::Distribute(_) => NodeType::Distribute,
            NodeKind::Upsert(_) => NodeType::Upsert,
            NodeKind::Traversal(_) => NodeType::Traversal,
            NodeKind::Index(_) => NodeType::Index,
            NodeKind::ShortestPath(_) => NodeType::ShortestPath,
            NodeKind::KShortestPaths(_) => NodeType::KShortestPaths,
            NodeKind::RemoteSingle(_) => NodeType::RemoteSingle,
            NodeKind::EnumerateView(_) => NodeType::EnumerateView,
            NodeKind::DistributeConsumer(_) => NodeType::DistributeConsumer,
            NodeKind::SubqueryStart(_) => NodeType::SubqueryStart,
            NodeKind::SubqueryEnd(_) => NodeType::SubqueryEnd,
            NodeKind::Materialize(_) => NodeType::Materialize,
            NodeKind::Async => NodeType::Async,
            NodeKind::Mutex(_) => NodeType::Mutex,
            NodeKind::Window(_) => NodeType::Window,
            NodeKind::Join(_) => NodeType::Join,
        }
    }

    /// Variables read by this node. Subquery bodies are handled by the plan.
    pub fn vars_used_here(&self, out: &mut VarSet) {
        match self {
            NodeKind::Singleton
            | NodeKind::Limit(_)
            | NodeKind::Subquery(_)
            | NodeKind::Scatter(_)
            | NodeKind::Remote(_)
            | NodeKind::NoResults
            | NodeKind::DistributeConsumer(_)
            | NodeKind::SubqueryStart(_)
            | NodeKind::Async
            | NodeKind::Mutex(_) => {}
            NodeKind::EnumerateCollection(n) => {
                expr_vars_excluding(n.filter.as_ref(), &[&n.out_variable], out)
            }
            NodeKind::EnumerateList(n) => {
                out.insert(n.in_variable.clone());
                expr_vars_excluding(n.filter.as_ref(), &[&n.out_variable], out);
            }
            NodeKind::Filter(n) => {
                out.insert(n.in_variable.clone());
            }
            NodeKind::Calculation(n) => n.expression.variables(out),
            NodeKind::Sort(n) => out.extend(n.elements.iter().map(|e| e.in_variable.clone())),
            NodeKind::Gather(n) => out.extend(n.elements.iter().map(|e| e.in_variable.clone())),
            NodeKind::Collect(n) => {
                out.extend(n.groups.iter().map(|g| g.in_variable.clone()));
                for a in &n.aggregates {
                    opt(&a.in_variable, out);
                }
                opt(&n.expression_variable, out);
                out.extend(n.keep_variables.iter().cloned());
            }
            NodeKind::Insert(n)
            | NodeKind::Remove(n)
            | NodeKind::Replace(n)
            | NodeKind::Update(n) => {
                out.insert(n.in_doc_variable.clone());
                opt(&n.in_key_variable, out);
            }
            NodeKind::Upsert(n) => {
                out.insert(n.in_doc_variable.clone());
                out.insert(n.insert_variable.clone());
                out.insert(n.update_variable.clone());
            }
            NodeKind::Return(n) => {
                out.insert(n.in_variable.clone());
            }
            NodeKind::Distribute(n) => {
                out.insert(n.variable.clone());
            }
            NodeKind::Traversal(n) => endpoint(&n.start, out),
            NodeKind::Index(n) => expr_vars_excluding(n.condition.as_ref(), &[&n.out_variable], out),
            NodeKind::ShortestPath(n) => {
                endpoint(&n.start, out);
                endpoint(&n.target, out);
            }
            NodeKind::KShortestPaths(n) => {
                endpoint(&n.start, out);
                endpoint(&n.target, out);
            }
            NodeKind::RemoteSingle(n) => opt(&n.in_variable, out),
            NodeKind::EnumerateView(n) => {
                expr_vars_excluding(n.condition.as_ref(), &[&n.out_variable], out);
                for s in &n.scorers {
                    expr_vars_excluding(Some(&s.expression), &[&n.out_variable], out);
                }
            }
            NodeKind::SubqueryEnd(n) => opt(&n.in_variable, out),
            NodeKind::Materialize(n) => {
                out.insert(n.in_nm_doc_id.clone());
            }
            NodeKind::Window(n) => {
                opt(&n.range_variable, out);
                for a in &n.aggregates {
                    opt(&a.in_variable, out);
                }
            }
            NodeKind::Join(n) => {
                let own: Vec<&Variable> = n.index_infos.iter().map(|i| &i.out_variable).collect();
                for info in &n.index_infos {
                    expr_vars_excluding(info.condition.as_ref(), &own, out);
                }
            }
        }
    }

    /// Variables written by this node, in declaration order.
    pub fn vars_set_here(&self) -> Vec<Variable> {
        fn some(vs: &[&Option<Variable>]) -> Vec<Variable> {
            vs.iter().filter_map(|v| v.as_ref().cloned()).collect()
        }
        match self {
            NodeKind::Singleton
            | NodeKind::Filter(_)
            | NodeKind::Limit(_)
            | NodeKind::Sort(_)
            | NodeKind::Scatter(_)
            | NodeKind::Gather(_)
            | NodeKind::Remote(_)
            | NodeKind::Return(_)
            | NodeKind::NoResults
            | NodeKind::Distribute(_)
            | NodeKind::DistributeConsumer(_)
            | NodeKind::SubqueryStart(_)
            | NodeKind::Async
            | NodeKind::Mutex(_) => Vec::new(),
            NodeKind::EnumerateCollection(n) => vec![n.out_variable.clone()],
            NodeKind::EnumerateList(n) => vec![n.out_variable.clone()],
            NodeKind::Calculation(n) => vec![n.out_variable.clone()],
            NodeKind::Subquery(n) => vec![n.out_variable.clone()],
            NodeKind::Collect(n) => {
                let mut v: Vec<Variable> = n.groups.iter().map(|g| g.out_variable.clone()).collect();
                v.extend(n.aggregates.iter().map(|a| a.out_variable.clone()));
                v.extend(n.out_variable.iter().cloned());
                v
            }
            NodeKind::Insert(n)
            | NodeKind::Remove(n)
            | NodeKind::Replace(n)
            | NodeKind::Update(n) => some(&[&n.out_variable_old, &n.out_variable_new]),
            NodeKind::Upsert(n) => some(&[&n.out_variable_new]),
            NodeKind::Traversal(n) => {
                let mut v = vec![n.vertex_out_variable.clone()];
                v.extend(some(&[&n.edge_out_variable, &n.path_out_variable]));
                v
            }
            NodeKind::Index(n) => vec![n.out_variable.clone()],
            NodeKind::ShortestPath(n) => some(&[&n.vertex_out_variable, &n.edge_out_variable]),
            NodeKind::KShortestPaths(n) => vec![n.path_out_variable.clone()],
            NodeKind::RemoteSingle(n) => some(&[
                &n.out_variable,
                &n.out_variable_old,
                &n.out_variable_new,
            ]),
            NodeKind::EnumerateView(n) => {
                let mut v = vec![n.out_variable.clone()];
                v.extend(n.scorers.iter().map(|s| s.out_variable.clone()));
                v
            }
            NodeKind::SubqueryEnd(n) => vec![n.out_variable.clone()],
            NodeKind::Materialize(n) => vec![n.out_variable.clone()],
            NodeKind::Window(n) => n.aggregates.iter().map(|a| a.out_variable.clone()).collect(),
            NodeKind::Join(n) => n
                .index_infos
                .iter()
                .filter(|i| i.produce_result)
                .map(|i| i.out_variable.clone())
                .collect(),
        }
    }

    /// Rewrite every variable this node reads. Output variables are untouched.
    pub fn replace_variables(&mut self, map: &VarReplacements) {
        match self {
            NodeKind::Singleton
            | NodeKind::Limit(_)
            | NodeKind::Subquery(_)
            | NodeKind::Scatter(_)
            | NodeKind::Remote(_)
            | NodeKind::NoResults
            | NodeKind::DistributeConsumer(_)
            | NodeKind::SubqueryStart(_)
            | NodeKind::Async
            | NodeKind::Mutex(_) => {}
            NodeKind::EnumerateCollection(n) => {
                if let Some(f) = &mut n.filter {
                    f.replace_variables(map);
                }
            }
            NodeKind::EnumerateList(n) => {
                replace(&mut n.in_variable, map);
                if let Some(f) = &mut n.filter {
                    f.replace_variables(map);
                }
            }
            NodeKind::Filter(n) => replace(&mut n.in_variable, map),
            NodeKind::Calculation(n) => n.expression.replace_variables(map),
            NodeKind::Sort(n) => {
                for e in &mut n.elements {
                    replace(&mut e.in_variable, map);
                }
            }
            NodeKind::Gather(n) => {
                for e in &mut n.elements {
                    replace(&mut e.in_variable, map);
                }
            }
            NodeKind::Collect(n) => {
                for g in &mut n.groups {
                    replace(&mut g.in_variable, map);
                }
                for a in &mut n.aggregates {
                    replace_opt(&mut a.in_variable, map);
                }
                replace_opt(&mut n.expression_variable, map);
                for k in &mut n.keep_variables {
                    replace(k, map);
                }
            }
            NodeKind::Insert(n)
            | NodeKind::Remove(n)
            | NodeKind::Replace(n)
            | NodeKind::Update(n) => {
                replace(&mut n.in_doc_variable, map);
                replace_opt(&mut n.in_key_variable, map);
            }
            NodeKind::Upsert(n) => {
                replace(&mut n.in_doc_variable, map);
                replace(&mut n.insert_variable, map);
                replace(&mut n.update_variable, map);
            }
            NodeKind::Return(n) => replace(&mut n.in_variable, map),
            NodeKind::Distribute(n) => replace(&mut n.variable, map),
            NodeKind::Traversal(n) => replace_endpoint(&mut n.start, map),
            NodeKind::Index(n) => {
                if let Some(c) = &mut n.condition {
                    c.replace_variables(map);
                }
            }
            NodeKind::ShortestPath(n) => {
                replace_endpoint(&mut n.start, map);
                replace_endpoint(&mut n.target, map);
            }
            NodeKind::KShortestPaths(n) => {
                replace_endpoint(&mut n.start, map);
                replace_endpoint(&mut n.target, map);
            }
            NodeKind::RemoteSingle(n) => replace_opt(&mut n.in_variable, map),
            NodeKind::EnumerateView(n) => {
                if let Some(c) = &mut n.condition {
                    c.replace_variables(map);
                }
                for s in &mut n.scorers {
                    s.expression.replace_variables(map);
                }
            }
            NodeKind::SubqueryEnd(n) => replace_opt(&mut n.in_variable, map),
            NodeKind::Materialize(n) => replace(&mut n.in_nm_doc_id, map),
            NodeKind::Window(n) => {
                replace_opt(&mut n.range_variable, map);
                for a in &mut n.aggregates {
                    replace_opt(&mut a.in_variable, map);
                }
            }
            NodeKind::Join(n) => {
                for info in &mut n.index_infos {
                    if let Some(c) = &mut info.condition {
                        c.replace_variables(map);
                    }
                }
            }
        }
    }

    /// Expressions carried by the payload.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut exprs: Vec<&Expr> = Vec::new();
        match self {
            NodeKind::Calculation(n) => exprs.push(&n.expression),
            NodeKind::EnumerateCollection(n) => exprs.extend(n.filter.as_ref()),
            NodeKind::EnumerateList(n) => exprs.extend(n.filter.as_ref()),
            NodeKind::Index(n) => exprs.extend(n.condition.as_ref()),
            NodeKind::EnumerateView(n) => {
                exprs.extend(n.condition.as_ref());
                exprs.extend(n.scorers.iter().map(|s| &s.expression));
            }
            NodeKind::Join(n) => {
                exprs.extend(n.index_infos.iter().filter_map(|i| i.condition.as_ref()))
            }
            _ => {}
        }
        exprs
    }

    /// Rewrite `search.path...` accesses inside this node's expressions.
    pub fn replace_attribute_access(
        &mut self,
        search: &Variable,
        path: &[String],
        replacement: &Variable,
    ) {
        let mut exprs: Vec<&mut Expr> = Vec::new();
        match self {
            NodeKind::Calculation(n) => exprs.push(&mut n.expression),
            NodeKind::EnumerateCollection(n) => exprs.extend(n.filter.as_mut()),
            NodeKind::EnumerateList(n) => exprs.extend(n.filter.as_mut()),
            NodeKind::Index(n) => exprs.extend(n.condition.as_mut()),
            NodeKind::EnumerateView(n) => {
                exprs.extend(n.condition.as_mut());
                exprs.extend(n.scorers.iter_mut().map(|s| &mut s.expression));
            }
            NodeKind::Join(n) => {
                exprs.extend(n.index_infos.iter_mut().filter_map(|i| i.condition.as_mut()))
            }
            _ => {}
        }
        for e in exprs {
            e.replace_attribute_access(search, path, replacement);
        }
    }

    /// Payload-level determinism. Subquery bodies are checked by the plan.
    pub fn is_deterministic(&self) -> bool {
        match self {
            NodeKind::EnumerateCollection(n) => {
                !n.random && n.filter.as_ref().map_or(true, Expr::is_deterministic)
            }
            NodeKind::EnumerateList(n) => n.filter.as_ref().map_or(true, Expr::is_deterministic),
            NodeKind::Calculation(n) => n.expression.is_deterministic(),
            NodeKind::Index(n) => n.condition.as_ref().map_or(true, Expr::is_deterministic),
            NodeKind::EnumerateView(n) => {
                n.condition.as_ref().map_or(true, Expr::is_deterministic)
                    && n.scorers.iter().all(|s| s.expression.is_deterministic())
            }
            _ => true,
        }
    }

    /// Serialize the payload fields. Subqueries carry a nested plan and are
    /// written by the plan serializer instead.
    pub(crate) fn payload_to_json(&self) -> Result<Map<String, Value>> {
        fn obj<T: Serialize>(p: &T) -> Result<Map<String, Value>> {
            match serde_json::to_value(p).map_err(|e| Error::Internal(e.to_string()))? {
                Value::Object(m) => Ok(m),
                other => Err(Error::Internal(format!(
                    "payload serialized to non-object {other}"
                ))),
            }
        }
        match self {
            NodeKind::Singleton | NodeKind::NoResults | NodeKind::Async => Ok(Map::new()),
            NodeKind::Subquery(_) => Err(Error::Invariant(
                "subquery payload must be written with its plan".into(),
            )),
            NodeKind::EnumerateCollection(n) => obj(n),
            NodeKind::EnumerateList(n) => obj(n),
            NodeKind::Filter(n) => obj(n),
            NodeKind::Limit(n) => obj(n),
            NodeKind::Calculation(n) => obj(n),
            NodeKind::Sort(n) => obj(n),
            NodeKind::Collect(n) => obj(n),
            NodeKind::Scatter(n) => obj(n),
            NodeKind::Gather(n) => obj(n),
            NodeKind::Remote(n) => obj(n),
            NodeKind::Insert(n)
            | NodeKind::Remove(n)
            | NodeKind::Replace(n)
            | NodeKind::Update(n) => obj(n),
            NodeKind::Return(n) => obj(n),
            NodeKind::Distribute(n) => obj(n),
            NodeKind::Upsert(n) => obj(n),
            NodeKind::Traversal(n) => obj(n),
            NodeKind::Index(n) => obj(n),
            NodeKind::ShortestPath(n) => obj(n),
            NodeKind::KShortestPaths(n) => obj(n),
            NodeKind::RemoteSingle(n) => obj(n),
            NodeKind::EnumerateView(n) => obj(n),
            NodeKind::DistributeConsumer(n) => obj(n),
            NodeKind::SubqueryStart(n) => obj(n),
            NodeKind::SubqueryEnd(n) => obj(n),
            NodeKind::Materialize(n) => obj(n),
            NodeKind::Mutex(n) => obj(n),
            NodeKind::Window(n) => obj(n),
            NodeKind::Join(n) => obj(n),
        }
    }

    /// Parse the payload of a non-subquery node from its document object.
    /// Unknown keys are ignored; missing required payload fields are errors.
    pub(crate) fn payload_from_json(ty: NodeType, doc: &Map<String, Value>) -> Result<NodeKind> {
        fn parse<T: DeserializeOwned>(ty: NodeType, doc: &Map<String, Value>) -> Result<T> {
            serde_json::from_value(Value::Object(doc.clone()))
                .map_err(|e| Error::Internal(format!("invalid {} payload: {e}", ty.type_name())))
        }
        /// Variable lists the reader cannot interpret are an unsupported
        /// shape, not a malformed document.
        fn require_array(ty: NodeType, doc: &Map<String, Value>, key: &str) -> Result<()> {
            match doc.get(key) {
                Some(Value::Array(_)) => Ok(()),
                _ => Err(Error::NotImplemented(format!(
                    "invalid \"{key}\" definition in {}",
                    ty.type_name()
                ))),
            }
        }
        match ty {
            NodeType::Collect => {
                require_array(ty, doc, "groups")?;
                require_array(ty, doc, "aggregates")?;
            }
            NodeType::Window => require_array(ty, doc, "aggregates")?,
            _ => {}
        }
        Ok(match ty {
            NodeType::Singleton => NodeKind::Singleton,
            NodeType::NoResults => NodeKind::NoResults,
            NodeType::Async => NodeKind::Async,
            NodeType::Subquery => {
                return Err(Error::Invariant(
                    "subquery payload must be read with its plan".into(),
                ))
            }
            NodeType::EnumerateCollection => NodeKind::EnumerateCollection(parse(ty, doc)?),
            NodeType::EnumerateList => NodeKind::EnumerateList(parse(ty, doc)?),
            NodeType::Filter => NodeKind::Filter(parse(ty, doc)?),
            NodeType::Limit => NodeKind::Limit(parse(ty, doc)?),
            NodeType::Calculation => NodeKind::Calculation(parse(ty, doc)?),
            NodeType::Sort => NodeKind::Sort(parse(ty, doc)?),
            NodeType::Collect => NodeKind::Collect(parse(ty, doc)?),
            NodeType::Scatter => NodeKind::Scatter(parse(ty, doc)?),
            NodeType::Gather => NodeKind::Gather(parse(ty, doc)?),
            NodeType::Remote => NodeKind::Remote(parse(ty, doc)?),
            NodeType::Insert => NodeKind::Insert(parse(ty, doc)?),
            NodeType::Remove => NodeKind::Remove(parse(ty, doc)?),
            NodeType::Replace => NodeKind::Replace(parse(ty, doc)?),
            NodeType::Update => NodeKind::Update(parse(ty, doc)?),
            NodeType::Return => NodeKind::Return(parse(ty, doc)?),
            NodeType::Distribute => NodeKind::Distribute(parse(ty, doc)?),
            NodeType::Upsert => NodeKind::Upsert(parse(ty, doc)?),
            NodeType::Traversal => NodeKind::Traversal(parse(ty, doc)?),
            NodeType::Index => NodeKind::Index(parse(ty, doc)?),
            NodeType::ShortestPath => NodeKind::ShortestPath(parse(ty, doc)?),
            NodeType::KShortestPaths => NodeKind::KShortestPaths(parse(ty, doc)?),
            NodeType::RemoteSingle => NodeKind::RemoteSingle(parse(ty, doc)?),
            NodeType::EnumerateView => NodeKind::EnumerateView(parse(ty, doc)?),
            NodeType::DistributeConsumer => NodeKind::DistributeConsumer(parse(ty, doc)?),
            NodeType::SubqueryStart => NodeKind::SubqueryStart(parse(ty, doc)?),
            NodeType::SubqueryEnd => NodeKind::SubqueryEnd(parse(ty, doc)?),
            NodeType::Materialize => NodeKind::Materialize(parse(ty, doc)?),
            NodeType::Mutex => NodeKind::Mutex(parse(ty, doc)?),
            NodeType::Window => NodeKind::Window(parse(ty, doc)?),
            NodeType::Join => NodeKind::Join(parse(ty, doc)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qgraph_core::id::VariableId;

    fn var(id: u64, name: &str) -> Variable {
        Variable::new(VariableId::new(id), name)
    }

    #[test]
    fn collect_reports_inputs_and_outputs() {
        let kind = NodeKind::Collect(CollectNode {
            groups: vec![GroupVariable {
                out_variable: var(10, "g"),
                in_variable: var(1, "a"),
            }],
            aggregates: vec![Aggregate {
                out_variable: var(11, "n"),
                in_variable: Some(var(2, "b")),
                function: "SUM".into(),
            }],
            expression_variable: None,
            out_variable: Some(var(12, "into")),
            keep_variables: vec![],
            collect_options: CollectMethod::Hash,
        });
        let mut used = VarSet::new();
        kind.vars_used_here(&mut used);
        let used: Vec<u64> = used.iter().map(|v| v.id.get()).collect();
        assert_eq!(used, vec![1, 2]);
        let set: Vec<u64> = kind.vars_set_here().iter().map(|v| v.id.get()).collect();
        assert_eq!(set, vec![10, 11, 12]);
    }

    #[test]
    fn replace_variables_leaves_outputs_alone() {
        let x = var(1, "x");
        let y = var(2, "y");
        let mut kind = NodeKind::EnumerateList(EnumerateListNode {
            in_variable: x.clone(),
            out_variable: x.clone(),
            filter: None,
        });
        let mut map = VarReplacements::new();
        map.insert(x.id, y.clone());
        kind.replace_variables(&map);
        match kind {
            NodeKind::EnumerateList(n) => {
                assert_eq!(n.in_variable, y);
                assert_eq!(n.out_variable, x);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn payload_json_ignores_unknown_keys_and_rejects_missing_required() {
        let mut doc = Map::new();
        doc.insert("inVariable".into(), serde_json::json!({"id": 4, "name": "x"}));
        doc.insert("somethingElse".into(), Value::Bool(true));
        let kind = NodeKind::payload_from_json(NodeType::Filter, &doc).unwrap();
        assert_eq!(kind.node_type(), NodeType::Filter);

        let err = NodeKind::payload_from_json(NodeType::Filter, &Map::new()).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn random_scan_is_not_deterministic() {
        let kind = NodeKind::EnumerateCollection(EnumerateCollectionNode {
            collection: "c".into(),
            out_variable: var(1, "d"),
            random: true,
            filter: None,
            projections: vec![],
        });
        assert!(!kind.is_deterministic());
    }
}

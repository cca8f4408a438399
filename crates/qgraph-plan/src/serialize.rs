//! Plan documents.
//!
//! A plan serializes to a JSON array of node objects in post-order of a
//! flattening walk from the root, so dependencies come before dependents and
//! the root is last. Each object carries `type`, `id` and the ids of its
//! `dependencies`; everything else is gated by [`SerializeFlags`]. Boolean
//! markers (`isInSplicedSubquery`, `isAsyncPrefetchEnabled`,
//! `isCallstackSplitEnabled`) are written only when true.
//!
//! Reading is all-or-nothing and happens in two passes: create every node
//! (nested subquery documents included), then wire edges by id. Forward
//! references are allowed.

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use qgraph_core::config::PlanConfig;
use qgraph_core::error::{Error, Result};
use qgraph_core::hash::{Fingerprint, FingerprintBuilder};
use qgraph_core::id::{NodeId, RegisterId};
use qgraph_core::variable::Variable;

use crate::expr::VarSet;
use crate::kind::{NodeKind, SubqueryNode};
use crate::node::{PlanNode, RegIdSet};
use crate::node_type::NodeType;
use crate::plan::Plan;
use crate::registers::RegisterPlan;
use crate::walker::WalkerWorker;

/// Bit set selecting optional node fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerializeFlags(u32);

impl SerializeFlags {
    pub const NONE: SerializeFlags = SerializeFlags(0);
    /// `typeID`, payload, depth, register plan and liveness stacks.
    pub const DETAILS: SerializeFlags = SerializeFlags(1);
    pub const PARENTS: SerializeFlags = SerializeFlags(2);
    pub const ESTIMATES: SerializeFlags = SerializeFlags(4);
    /// `functions`: name and determinism of every function a node calls.
    pub const FUNCTIONS: SerializeFlags = SerializeFlags(8);
    /// Register detail plus `varsSetHere`/`varsUsedHere`.
    pub const REGISTER_INFORMATION: SerializeFlags = SerializeFlags(16);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        SerializeFlags(bits)
    }

    pub const fn contains(self, other: SerializeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SerializeFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SerializeFlags {
    type Output = SerializeFlags;
    fn bitor(self, rhs: Self) -> Self {
        SerializeFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SerializeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Collects the serialization order.
#[derive(Default)]
struct OrderCollector {
    order: Vec<NodeId>,
}

impl WalkerWorker for OrderCollector {
    fn after(&mut self, _plan: &Plan, id: NodeId) {
        self.order.push(id);
    }

    fn enter_subquery(&mut self, _plan: &Plan, _subquery: NodeId, _root: NodeId) -> bool {
        // Bodies are written nested inside the SUBQUERY payload.
        false
    }
}

fn ids(list: &[NodeId]) -> Value {
    Value::Array(list.iter().map(|i| Value::from(i.get())).collect())
}

fn var_stack(stack: &[VarSet]) -> Result<Value> {
    serde_json::to_value(stack).map_err(|e| Error::Internal(e.to_string()))
}

/// One entry per distinct function name, sorted by name.
fn functions_json(kind: &NodeKind) -> Vec<Value> {
    let mut seen: BTreeMap<&str, bool> = BTreeMap::new();
    for expr in kind.expressions() {
        for (name, deterministic) in expr.functions() {
            *seen.entry(name).or_insert(true) &= deterministic;
        }
    }
    seen
        .into_iter()
        .map(|(name, deterministic)| json!({ "name": name, "isDeterministic": deterministic }))
        .collect()
}

fn reg_stack(stack: &[RegIdSet]) -> Value {
    Value::Array(
        stack
            .iter()
            .map(|frame| Value::Array(frame.iter().map(|r| Value::from(r.get())).collect()))
            .collect(),
    )
}

impl Plan {
    /// Node documents reachable from `start`, dependencies first.
    pub fn to_document_from(&self, start: NodeId, flags: SerializeFlags) -> Result<Value> {
        let mut collector = OrderCollector::default();
        self.flat_walk(start, &mut collector, false);
        let mut nodes = Vec::with_capacity(collector.order.len());
        for id in collector.order {
            nodes.push(Value::Object(self.node_to_json(id, flags)?));
        }
        Ok(Value::Array(nodes))
    }

    /// The whole plan as a node array.
    pub fn to_document(&self, flags: SerializeFlags) -> Result<Value> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("plan has no root".into()))?;
        self.to_document_from(root, flags)
    }

    fn node_to_json(&self, id: NodeId, flags: SerializeFlags) -> Result<Map<String, Value>> {
        let node = self.node(id);
        let ty = node.node_type();
        let mut obj = Map::new();
        obj.insert("type".into(), Value::from(ty.type_name()));
        if flags.contains(SerializeFlags::DETAILS) {
            obj.insert("typeID".into(), Value::from(ty.type_id()));
        }
        obj.insert("dependencies".into(), ids(node.dependencies()));
        obj.insert("id".into(), Value::from(id.get()));
        if flags.contains(SerializeFlags::PARENTS) {
            obj.insert("parents".into(), ids(node.parents()));
        }
        if flags.contains(SerializeFlags::ESTIMATES) {
            let est = self.get_cost(id);
            obj.insert("estimatedCost".into(), json!(est.estimated_cost));
            obj.insert("estimatedNrItems".into(), json!(est.estimated_nr_items));
        }

        if flags.intersects(SerializeFlags::DETAILS | SerializeFlags::REGISTER_INFORMATION) {
            obj.insert("depth".into(), Value::from(node.depth()));
            match node.register_plan() {
                Some(rp) => rp.write_json(&mut obj)?,
                None => RegisterPlan::write_empty_json(&mut obj),
            }
            obj.insert(
                "regsToClear".into(),
                Value::Array(
                    node.regs_to_clear()
                        .iter()
                        .map(|r| Value::from(r.get()))
                        .collect(),
                ),
            );
            if node.is_var_usage_valid() {
                obj.insert(
                    "varsUsedLaterStack".into(),
                    var_stack(node.vars_used_later_stack())?,
                );
                obj.insert("varsValidStack".into(), var_stack(node.vars_valid_stack())?);
            }
            if !node.regs_to_keep_stack().is_empty() {
                obj.insert("regsToKeepStack".into(), reg_stack(node.regs_to_keep_stack()));
            }
            if flags.contains(SerializeFlags::REGISTER_INFORMATION) {
                obj.insert(
                    "varsSetHere".into(),
                    serde_json::to_value(node.vars_set_here())
                        .map_err(|e| Error::Internal(e.to_string()))?,
                );
                obj.insert(
                    "varsUsedHere".into(),
                    serde_json::to_value(self.variables_used_here(id))
                        .map_err(|e| Error::Internal(e.to_string()))?,
                );
            }
            if node.is_in_spliced_subquery() {
                obj.insert("isInSplicedSubquery".into(), Value::Bool(true));
            }
        }
        if node.is_async_prefetch_enabled() {
            obj.insert("isAsyncPrefetchEnabled".into(), Value::Bool(true));
        }
        if node.is_callstack_split_enabled() {
            obj.insert("isCallstackSplitEnabled".into(), Value::Bool(true));
        }

        if flags.contains(SerializeFlags::FUNCTIONS) {
            let functions = functions_json(node.kind());
            if !functions.is_empty() {
                obj.insert("functions".into(), Value::Array(functions));
            }
        }

        if flags.contains(SerializeFlags::DETAILS) {
            match node.kind() {
                NodeKind::Subquery(sq) => {
                    let nested = self.to_document_from(sq.root, flags)?;
                    obj.insert("subquery".into(), json!({ "nodes": nested }));
                    obj.insert(
                        "outVariable".into(),
                        serde_json::to_value(&sq.out_variable)
                            .map_err(|e| Error::Internal(e.to_string()))?,
                    );
                    obj.insert(
                        "isDeterministic".into(),
                        Value::Bool(self.is_deterministic(id)),
                    );
                    obj.insert("isConst".into(), Value::Bool(self.is_const_subquery(id)));
                }
                kind => {
                    for (k, v) in kind.payload_to_json()? {
                        obj.insert(k, v);
                    }
                }
            }
        }
        Ok(obj)
    }

    /// Structural fingerprint from the root: node types, edges and payloads,
    /// independent of node ids and of cost estimates.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("plan has no root".into()))?;
        let mut builder = FingerprintBuilder::new();
        self.feed_fingerprint(root, &mut builder)?;
        Ok(builder.finish())
    }

    fn feed_fingerprint(&self, start: NodeId, builder: &mut FingerprintBuilder) -> Result<()> {
        let mut collector = OrderCollector::default();
        self.flat_walk(start, &mut collector, false);
        for id in collector.order {
            let node = self.node(id);
            builder.node(id, node.node_type().type_id());
            for dep in node.dependencies() {
                builder.dependency(*dep)?;
            }
            match node.kind() {
                NodeKind::Subquery(sq) => {
                    builder.payload(&sq.out_variable)?;
                    builder.open_scope();
                    self.feed_fingerprint(sq.root, builder)?;
                    builder.close_scope();
                }
                kind => builder.payload(&kind.payload_to_json()?)?,
            }
        }
        Ok(())
    }

    /// Explain output: the detailed node array plus root, variables, totals
    /// and the structural fingerprint.
    pub fn explain(&self) -> Result<Value> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("plan has no root".into()))?;
        let nodes = self.to_document(SerializeFlags::DETAILS | SerializeFlags::ESTIMATES)?;
        let fingerprint = self.fingerprint()?;
        let est = self.get_cost(root);
        let variables: Vec<&Variable> = self.variables().iter().collect();
        Ok(json!({
            "nodes": nodes,
            "rootNodeId": root.get(),
            "variables": variables,
            "estimatedCost": est.estimated_cost,
            "estimatedNrItems": est.estimated_nr_items,
            "fingerprint": fingerprint.to_hex(),
        }))
    }

    /// Rebuild a plan from a node array (or an object with a `nodes` array).
    pub fn from_document(doc: &Value) -> Result<Plan> {
        Self::from_document_with_config(doc, PlanConfig::default())
    }

    pub fn from_document_with_config(doc: &Value, config: PlanConfig) -> Result<Plan> {
        let (nodes, root_hint, variables) = match doc {
            Value::Array(nodes) => (nodes, None, None),
            Value::Object(obj) => {
                let nodes = obj
                    .get("nodes")
                    .and_then(Value::as_array)
                    .ok_or_else(|| Error::Internal("\"nodes\" needs to be an array".into()))?;
                let root = obj.get("rootNodeId").and_then(Value::as_u64).map(NodeId::new);
                (nodes, root, obj.get("variables"))
            }
            _ => {
                return Err(Error::Internal(
                    "plan document must be an array or an object".into(),
                ))
            }
        };

        let mut plan = Plan::with_config(config);
        if let Some(vars) = variables {
            let vars: Vec<Variable> = serde_json::from_value(vars.clone())
                .map_err(|e| Error::Internal(format!("\"variables\" is malformed: {e}")))?;
            for v in &vars {
                plan.variables_mut().register(v)?;
            }
        }

        let mut edges = Vec::new();
        let last = read_nodes(&mut plan, nodes, &mut edges)?;
        for (node, deps) in edges {
            for dep in deps {
                if !plan.contains(dep) {
                    return Err(Error::Internal(format!(
                        "node {} depends on unknown node {}",
                        node.get(),
                        dep.get()
                    )));
                }
                plan.add_dependency(node, dep);
            }
        }

        let root = root_hint.or(last);
        if let Some(root) = root {
            if !plan.contains(root) {
                return Err(Error::Internal(format!("unknown root node {}", root.get())));
            }
            plan.set_root(root);
        }
        plan.verify()?;
        debug!(nodes = plan.len(), "plan rebuilt from document");
        Ok(plan)
    }
}

type PendingEdges = Vec<(NodeId, Vec<NodeId>)>;

/// First pass: create nodes, remembering dependency ids. Returns the id of
/// the last node, which is the root of a canonical document.
fn read_nodes(plan: &mut Plan, nodes: &[Value], edges: &mut PendingEdges) -> Result<Option<NodeId>> {
    let mut last = None;
    for doc in nodes {
        let obj = doc
            .as_object()
            .ok_or_else(|| Error::Internal("plan node must be an object".into()))?;
        let id = read_node(plan, obj, edges)?;
        last = Some(id);
    }
    Ok(last)
}

fn read_type(obj: &Map<String, Value>) -> Result<NodeType> {
    match obj.get("typeID") {
        Some(v) => {
            let raw = v
                .as_i64()
                .ok_or_else(|| Error::Internal("\"typeID\" needs to be an integer".into()))?;
            let ty = NodeType::from_type_id(raw)?;
            if let Some(name) = obj.get("type").and_then(Value::as_str) {
                if name != ty.type_name() {
                    return Err(Error::Internal(format!(
                        "\"type\" {name} does not match typeID {raw}"
                    )));
                }
            }
            Ok(ty)
        }
        None => {
            let name = obj
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Internal("\"type\" needs to be a string".into()))?;
            NodeType::from_type_name(name)
        }
    }
}

fn read_id_list(obj: &Map<String, Value>, key: &str) -> Result<Vec<NodeId>> {
    let Some(list) = obj.get(key) else {
        return Ok(Vec::new());
    };
    let list = list
        .as_array()
        .ok_or_else(|| Error::Internal(format!("\"{key}\" needs to be an array")))?;
    list.iter()
        .map(|v| {
            v.as_u64()
                .map(NodeId::new)
                .ok_or_else(|| Error::Internal(format!("\"{key}\" needs to contain node ids")))
        })
        .collect()
}

fn read_var_stack(obj: &Map<String, Value>, key: &str, legacy: &str) -> Result<Option<Vec<VarSet>>> {
    match obj.get(key) {
        Some(Value::Array(frames)) if !frames.is_empty() => {
            let mut stack = Vec::with_capacity(frames.len());
            for frame in frames {
                if !frame.is_array() {
                    return Err(Error::Internal(format!("\"{key}\" needs to contain arrays")));
                }
                let vars: VarSet = serde_json::from_value(frame.clone())
                    .map_err(|e| Error::Internal(format!("\"{key}\" is malformed: {e}")))?;
                stack.push(vars);
            }
            Ok(Some(stack))
        }
        Some(_) => Err(Error::Internal(format!(
            "\"{key}\" needs to be a non-empty array"
        ))),
        None => match obj.get(legacy) {
            // Older single-frame form.
            Some(v @ Value::Array(_)) => {
                let vars: VarSet = serde_json::from_value(v.clone())
                    .map_err(|e| Error::Internal(format!("\"{legacy}\" is malformed: {e}")))?;
                Ok(Some(vec![vars]))
            }
            Some(_) => Err(Error::NotImplemented(format!(
                "\"{legacy}\" needs to be an array"
            ))),
            None => Ok(None),
        },
    }
}

fn read_regs(value: &Value, key: &str) -> Result<RegIdSet> {
    let list = value
        .as_array()
        .ok_or_else(|| Error::Internal(format!("\"{key}\" needs to contain arrays")))?;
    list.iter()
        .map(|r| {
            r.as_u64()
                .and_then(|r| u32::try_from(r).ok())
                .map(RegisterId::new)
                .ok_or_else(|| Error::Internal(format!("\"{key}\" needs to contain register ids")))
        })
        .collect()
}

fn read_flag(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn read_node(plan: &mut Plan, obj: &Map<String, Value>, edges: &mut PendingEdges) -> Result<NodeId> {
    let ty = read_type(obj)?;
    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .map(NodeId::new)
        .ok_or_else(|| Error::Internal("\"id\" needs to be an integer".into()))?;

    let kind = if ty == NodeType::Subquery {
        let nested = obj
            .get("subquery")
            .and_then(|s| s.get("nodes"))
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Internal("\"subquery\" needs a \"nodes\" array".into()))?;
        let root = read_nodes(plan, nested, edges)?
            .ok_or_else(|| Error::Internal("subquery body is empty".into()))?;
        let out_variable: Variable = obj
            .get("outVariable")
            .cloned()
            .ok_or_else(|| Error::Internal("\"outVariable\" is missing".into()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| Error::Internal(format!("\"outVariable\" is malformed: {e}")))
            })?;
        NodeKind::Subquery(SubqueryNode { root, out_variable })
    } else {
        NodeKind::payload_from_json(ty, obj)?
    };

    let mut node = PlanNode::new(id, kind);

    if let Some(depth) = obj.get("depth") {
        node.depth = depth
            .as_u64()
            .and_then(|d| u32::try_from(d).ok())
            .ok_or_else(|| Error::Internal("\"depth\" needs to be an integer".into()))?;
    }
    if let Some(rp) = RegisterPlan::read_json(obj)? {
        node.register_plan = Some(Arc::new(rp));
    }
    if let Some(regs) = obj.get("regsToClear") {
        if !regs.is_array() {
            return Err(Error::NotImplemented(
                "\"regsToClear\" needs to be an array".into(),
            ));
        }
        node.regs_to_clear = read_regs(regs, "regsToClear")?;
    }
    let used_later = read_var_stack(obj, "varsUsedLaterStack", "varsUsedLater")?;
    let valid = read_var_stack(obj, "varsValidStack", "varsValid")?;
    match (used_later, valid) {
        (Some(used_later), Some(valid)) => {
            node.vars_used_later_stack = used_later;
            node.vars_valid_stack = valid;
            node.var_usage_valid = true;
        }
        (None, None) => {}
        _ => {
            return Err(Error::Internal(
                "\"varsUsedLaterStack\" and \"varsValidStack\" must appear together".into(),
            ))
        }
    }
    if let Some(stack) = obj.get("regsToKeepStack") {
        let frames = stack
            .as_array()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| {
                Error::Internal("\"regsToKeepStack\" needs to be a non-empty array".into())
            })?;
        node.regs_to_keep_stack = frames
            .iter()
            .map(|f| read_regs(f, "regsToKeepStack"))
            .collect::<Result<_>>()?;
    }
    node.in_spliced_subquery = read_flag(obj, "isInSplicedSubquery");
    node.async_prefetch_enabled = read_flag(obj, "isAsyncPrefetchEnabled");
    node.callstack_split_enabled = read_flag(obj, "isCallstackSplitEnabled");

    if obj.contains_key("parents") {
        // Parents are derived from dependencies; the list is informational.
        let parents = read_id_list(obj, "parents")?;
        if parents.iter().any(|p| *p == id) {
            warn!(id = id.get(), "node lists itself as parent");
        }
    }
    let deps = read_id_list(obj, "dependencies")?;

    plan.register_node(node)?;
    if plan.node(id).is_async_prefetch_enabled() {
        plan.async_prefetch_nodes += 1;
    }
    edges.push((id, deps));
    Ok(id)
}

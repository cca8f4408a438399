//! Register planning.
//!
//! A deliberately simple allocator: every variable gets its own register at
//! the depth where it is produced, depths grow at increase-depth nodes, and
//! nothing is reused. Its output has the shape block instantiation expects
//! (`RegisterPlan`, `regsToClear`, `regsToKeepStack`, per-depth register
//! counts), which is what the rest of the plan graph depends on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use qgraph_core::error::{Error, Result};
use qgraph_core::id::{NodeId, RegisterCount, RegisterId, VariableId};

use crate::expr::VarSet;
use crate::node::RegIdSet;
use crate::node_type::NodeType;
use crate::plan::Plan;
use crate::walker::WalkerWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarInfo {
    #[serde(rename = "VariableId")]
    pub variable_id: VariableId,
    pub depth: u32,
    #[serde(rename = "RegisterId")]
    pub register_id: RegisterId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterPlan {
    pub var_info: BTreeMap<VariableId, VarInfo>,
    /// Registers in a row at each depth, cumulative.
    pub nr_regs: Vec<RegisterCount>,
    pub total_nr_regs: RegisterCount,
}

impl RegisterPlan {
    pub fn new() -> Self {
        Self {
            var_info: BTreeMap::new(),
            nr_regs: vec![0],
            total_nr_regs: 0,
        }
    }

    pub fn depth(&self) -> u32 {
        self.nr_regs.len().saturating_sub(1) as u32
    }

    /// Open a new depth that starts with all registers of the previous one.
    pub fn increase_depth(&mut self) -> u32 {
        let carried = self.nr_regs.last().copied().unwrap_or(0);
        self.nr_regs.push(carried);
        self.depth()
    }

    pub fn register_variable(&mut self, var: VariableId, depth: u32) -> RegisterId {
        if let Some(info) = self.var_info.get(&var) {
            return info.register_id;
        }
        let reg = RegisterId::new(self.total_nr_regs);
        self.total_nr_regs += 1;
        for count in self.nr_regs.iter_mut().skip(depth as usize) {
            *count += 1;
        }
        self.var_info.insert(
            var,
            VarInfo {
                variable_id: var,
                depth,
                register_id: reg,
            },
        );
        reg
    }

    pub fn variable_to_register_id(&self, var: VariableId) -> Option<RegisterId> {
        self.var_info.get(&var).map(|i| i.register_id)
    }

    fn registers_of(&self, vars: &VarSet) -> RegIdSet {
        vars.iter()
            .filter_map(|v| self.variable_to_register_id(v.id))
            .collect()
    }

    pub(crate) fn write_json(&self, obj: &mut Map<String, Value>) -> Result<()> {
        let infos: Vec<&VarInfo> = self.var_info.values().collect();
        obj.insert(
            "varInfoList".into(),
            serde_json::to_value(infos).map_err(|e| Error::Internal(e.to_string()))?,
        );
        obj.insert("nrRegs".into(), Value::from(self.nr_regs.clone()));
        obj.insert("totalNrRegs".into(), Value::from(self.total_nr_regs));
        Ok(())
    }

    pub(crate) fn write_empty_json(obj: &mut Map<String, Value>) {
        obj.insert("varInfoList".into(), Value::Array(Vec::new()));
        obj.insert("nrRegs".into(), Value::Array(Vec::new()));
        obj.insert("totalNrRegs".into(), Value::from(0));
    }

    /// Read the register-plan block. Returns `None` when it is absent or
    /// empty.
    pub(crate) fn read_json(obj: &Map<String, Value>) -> Result<Option<Self>> {
        let Some(list) = obj.get("varInfoList") else {
            return Ok(None);
        };
        let infos: Vec<VarInfo> = serde_json::from_value(list.clone())
            .map_err(|e| Error::Internal(format!("\"varInfoList\" is malformed: {e}")))?;
        let nr_regs: Vec<RegisterCount> = match obj.get("nrRegs") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::Internal(format!("\"nrRegs\" is malformed: {e}")))?,
            None => Vec::new(),
        };
        if infos.is_empty() && nr_regs.is_empty() {
            return Ok(None);
        }
        let total_nr_regs = obj
            .get("totalNrRegs")
            .and_then(Value::as_u64)
            .and_then(|t| RegisterCount::try_from(t).ok())
            .unwrap_or(infos.len() as RegisterCount);
        Ok(Some(Self {
            var_info: infos.into_iter().map(|i| (i.variable_id, i)).collect(),
            nr_regs,
            total_nr_regs,
        }))
    }
}

/// Assigns depths and registers bottom-up. Nested subquery bodies get a plan
/// derived from the enclosing one.
#[derive(Debug)]
struct RegisterPlanner<'a> {
    reg_plan: RegisterPlan,
    depths: &'a mut HashMap<NodeId, u32>,
    members: Vec<NodeId>,
    finished: &'a mut Vec<(RegisterPlan, Vec<NodeId>)>,
}

impl WalkerWorker for RegisterPlanner<'_> {
    fn after(&mut self, plan: &Plan, id: NodeId) {
        let node = plan.node(id);
        let mut depth = node
            .first_dependency()
            .and_then(|d| self.depths.get(&d).copied())
            .unwrap_or_else(|| self.reg_plan.depth());
        if node.is_increase_depth() {
            // The new depth must sit above everything allocated so far.
            while self.reg_plan.depth() <= depth {
                self.reg_plan.increase_depth();
            }
            depth = self.reg_plan.depth();
        }
        for var in node.vars_set_here() {
            self.reg_plan.register_variable(var.id, depth);
        }
        self.depths.insert(id, depth);
        self.members.push(id);
    }

    fn enter_subquery(&mut self, plan: &Plan, _subquery: NodeId, root: NodeId) -> bool {
        let mut derived = self.reg_plan.clone();
        derived.increase_depth();
        let mut inner = RegisterPlanner {
            reg_plan: derived,
            depths: &mut *self.depths,
            members: Vec::new(),
            finished: &mut *self.finished,
        };
        plan.walk(root, &mut inner);
        inner.finish();
        false
    }
}

impl RegisterPlanner<'_> {
    fn finish(self) {
        self.finished.push((self.reg_plan, self.members));
    }
}

impl Plan {
    /// Assign depths, registers, `regsToClear` and `regsToKeepStack` to every
    /// node reachable from the root. Runs the variable usage pass first when
    /// needed.
    pub fn plan_registers(&mut self) -> Result<()> {
        let root = self
            .root()
            .ok_or_else(|| Error::Invariant("plan has no root".into()))?;
        if !self.node(root).is_var_usage_valid() {
            self.find_var_usage()?;
        }

        let mut depths = HashMap::new();
        let mut finished = Vec::new();
        {
            let mut planner = RegisterPlanner {
                reg_plan: RegisterPlan::new(),
                depths: &mut depths,
                members: Vec::new(),
                finished: &mut finished,
            };
            self.walk(root, &mut planner);
            planner.finish();
        }

        for (reg_plan, members) in finished {
            let shared = Arc::new(reg_plan);
            for id in members {
                let node = self.node(id);
                let depth = depths.get(&id).copied().unwrap_or(0);
                let set_here: VarSet = node.vars_set_here().into_iter().collect();
                let (clear, keep) = if node.is_var_usage_valid() {
                    let used_later = node.vars_used_later_stack();
                    let valid = node.vars_valid_stack();
                    let top_valid = valid.last().cloned().unwrap_or_default();
                    let top_used = used_later.last().cloned().unwrap_or_default();
                    let clear: VarSet = top_valid
                        .iter()
                        .filter(|v| !top_used.contains(*v) && !set_here.contains(*v))
                        .cloned()
                        .collect();
                    let mut keep = Vec::with_capacity(valid.len());
                    for (i, frame) in valid.iter().enumerate() {
                        let used = used_later.get(i).cloned().unwrap_or_default();
                        let is_top = i + 1 == valid.len();
                        let vars: VarSet = frame
                            .iter()
                            .filter(|v| used.contains(*v) && !(is_top && set_here.contains(*v)))
                            .cloned()
                            .collect();
                        keep.push(shared.registers_of(&vars));
                    }
                    (shared.registers_of(&clear), keep)
                } else {
                    (RegIdSet::new(), Vec::new())
                };
                let node = self.node_mut(id);
                node.set_depth(depth);
                node.set_register_plan(Arc::clone(&shared));
                node.set_regs_to_clear(clear);
                node.set_regs_to_keep(keep);
            }
        }
        debug!(nodes = depths.len(), "register planning finished");
        Ok(())
    }

    /// Registers in each input row of `id`.
    pub fn nr_input_registers(&self, id: NodeId) -> RegisterCount {
        let node = self.node(id);
        match (node.first_dependency(), node.register_plan()) {
            (Some(dep), Some(rp)) => {
                let depth = self.node(dep).depth() as usize;
                rp.nr_regs.get(depth).copied().unwrap_or(0)
            }
            _ => self.nr_output_registers(id),
        }
    }

    /// Registers in each output row of `id`. A RETURN that is not the plan
    /// root writes a single register.
    pub fn nr_output_registers(&self, id: NodeId) -> RegisterCount {
        let node = self.node(id);
        if node.node_type() == NodeType::Return && self.root() != Some(id) {
            return 1;
        }
        node.register_plan()
            .and_then(|rp| rp.nr_regs.get(node.depth() as usize).copied())
            .unwrap_or(0)
    }

    /// Register of `var` as seen from node `id`.
    pub fn variable_to_register_id(
        &self,
        id: NodeId,
        var: &qgraph_core::variable::Variable,
    ) -> Option<RegisterId> {
        self.node(id).variable_to_register_id(var)
    }
}

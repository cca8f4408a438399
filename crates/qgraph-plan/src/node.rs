//! A single plan node: identity, edges, variant payload and the metadata that
//! register planning and cost estimation store back into it.

use std::cell::{Ref, RefCell};
use std::collections::BTreeSet;
use std::sync::Arc;

use qgraph_core::id::{NodeId, RegisterId};
use qgraph_core::variable::Variable;

use crate::cost::CostEstimate;
use crate::expr::VarSet;
use crate::kind::NodeKind;
use crate::node_type::NodeType;
use crate::registers::RegisterPlan;

/// Ordered set of registers.
pub type RegIdSet = BTreeSet<RegisterId>;

static EMPTY_VARS: VarSet = BTreeSet::new();

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) dependencies: Vec<NodeId>,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) depth: u32,
    pub(crate) var_usage_valid: bool,
    pub(crate) vars_used_later_stack: Vec<VarSet>,
    pub(crate) vars_valid_stack: Vec<VarSet>,
    pub(crate) regs_to_clear: RegIdSet,
    pub(crate) regs_to_keep_stack: Vec<RegIdSet>,
    pub(crate) register_plan: Option<Arc<RegisterPlan>>,
    pub(crate) cost: RefCell<CostEstimate>,
    pub(crate) in_spliced_subquery: bool,
    pub(crate) async_prefetch_enabled: bool,
    pub(crate) callstack_split_enabled: bool,
}

impl PlanNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            dependencies: Vec::new(),
            parents: Vec::new(),
            depth: 0,
            var_usage_valid: false,
            vars_used_later_stack: Vec::new(),
            vars_valid_stack: Vec::new(),
            regs_to_clear: RegIdSet::new(),
            regs_to_keep_stack: Vec::new(),
            register_plan: None,
            cost: RefCell::new(CostEstimate::invalid()),
            in_spliced_subquery: false,
            async_prefetch_enabled: false,
            callstack_split_enabled: false,
        }
    }

    /// Copy of this node under a new id: payload and liveness/register
    /// metadata by value, the register plan shared, no edges, fresh cost.
    pub(crate) fn detached_copy(&self, id: NodeId) -> Self {
        Self {
            id,
            kind: self.kind.clone(),
            dependencies: Vec::new(),
            parents: Vec::new(),
            depth: self.depth,
            var_usage_valid: self.var_usage_valid,
            vars_used_later_stack: self.vars_used_later_stack.clone(),
            vars_valid_stack: self.vars_valid_stack.clone(),
            regs_to_clear: self.regs_to_clear.clone(),
            regs_to_keep_stack: self.regs_to_keep_stack.clone(),
            register_plan: self.register_plan.clone(),
            cost: RefCell::new(CostEstimate::invalid()),
            in_spliced_subquery: self.in_spliced_subquery,
            async_prefetch_enabled: false,
            callstack_split_enabled: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn type_name(&self) -> &'static str {
        self.node_type().type_name()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Mutable payload access for optimizer rewrites. Callers that change
    /// anything cost-relevant must invalidate the cost afterwards.
    pub fn kind_mut(&mut self) -> &mut NodeKind {
        &mut self.kind
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn first_dependency(&self) -> Option<NodeId> {
        self.dependencies.first().copied()
    }

    pub fn first_parent(&self) -> Option<NodeId> {
        self.parents.first().copied()
    }

    /// Exactly one dependency.
    pub fn has_dependency(&self) -> bool {
        self.dependencies.len() == 1
    }

    /// Exactly one parent.
    pub fn has_parent(&self) -> bool {
        self.parents.len() == 1
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn set_depth(&mut self, depth: u32) {
        self.depth = depth;
    }

    pub fn is_increase_depth(&self) -> bool {
        self.node_type().is_increase_depth()
    }

    pub fn always_copies_rows(&self) -> bool {
        self.node_type().always_copies_rows()
    }

    pub fn vars_set_here(&self) -> Vec<Variable> {
        self.kind.vars_set_here()
    }

    pub fn is_var_usage_valid(&self) -> bool {
        self.var_usage_valid
    }

    pub fn set_var_usage_valid(&mut self) {
        self.var_usage_valid = true;
    }

    pub fn invalidate_var_usage(&mut self) {
        self.vars_used_later_stack.clear();
        self.vars_valid_stack.clear();
        self.var_usage_valid = false;
    }

    pub fn vars_used_later_stack(&self) -> &[VarSet] {
        &self.vars_used_later_stack
    }

    pub fn vars_valid_stack(&self) -> &[VarSet] {
        &self.vars_valid_stack
    }

    /// Innermost "used later" frame.
    pub fn vars_used_later(&self) -> &VarSet {
        debug_assert!(self.var_usage_valid, "liveness read before it was computed");
        self.vars_used_later_stack.last().unwrap_or(&EMPTY_VARS)
    }

    /// Innermost "valid" frame.
    pub fn vars_valid(&self) -> &VarSet {
        debug_assert!(self.var_usage_valid, "liveness read before it was computed");
        self.vars_valid_stack.last().unwrap_or(&EMPTY_VARS)
    }

    pub fn set_vars_used_later(&mut self, stack: Vec<VarSet>) {
        debug_assert!(!stack.is_empty());
        self.vars_used_later_stack = stack;
    }

    pub fn set_vars_valid(&mut self, stack: Vec<VarSet>) {
        debug_assert!(!stack.is_empty());
        self.vars_valid_stack = stack;
    }

    pub fn regs_to_clear(&self) -> &RegIdSet {
        &self.regs_to_clear
    }

    pub fn set_regs_to_clear(&mut self, regs: RegIdSet) {
        self.regs_to_clear = regs;
    }

    pub fn regs_to_keep_stack(&self) -> &[RegIdSet] {
        &self.regs_to_keep_stack
    }

    pub fn set_regs_to_keep(&mut self, stack: Vec<RegIdSet>) {
        self.regs_to_keep_stack = stack;
    }

    pub fn register_plan(&self) -> Option<&Arc<RegisterPlan>> {
        self.register_plan.as_ref()
    }

    pub fn set_register_plan(&mut self, plan: Arc<RegisterPlan>) {
        self.register_plan = Some(plan);
    }

    pub fn variable_to_register_id(&self, var: &Variable) -> Option<RegisterId> {
        self.register_plan
            .as_ref()
            .and_then(|p| p.variable_to_register_id(var.id))
    }

    /// Cached estimate as last stored; may be invalid. Use `Plan::get_cost`
    /// to obtain a fresh one.
    pub fn cached_cost(&self) -> Ref<'_, CostEstimate> {
        self.cost.borrow()
    }

    pub fn is_in_spliced_subquery(&self) -> bool {
        self.in_spliced_subquery
    }

    pub fn set_is_in_spliced_subquery(&mut self, value: bool) {
        self.in_spliced_subquery = value;
    }

    pub fn is_async_prefetch_enabled(&self) -> bool {
        self.async_prefetch_enabled
    }

    pub fn is_callstack_split_enabled(&self) -> bool {
        self.callstack_split_enabled
    }

    pub fn enable_callstack_split(&mut self) {
        self.callstack_split_enabled = true;
    }
}

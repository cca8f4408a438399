//! YAML -> `Plan` builder for *linear* pipelines.
//!
//! Example:
//! ```yaml
//! config: { filter_selectivity: 0.25 }
//! collections: { users: 500 }
//! steps:
//!   - op: enumerate_collection
//!     collection: users
//!     as: u
//!   - op: filter
//!     expr: { op: gt, lhs: { ref: u, path: [age] }, rhs: { value: 30 } }
//!   - op: subquery
//!     as: friends
//!     steps:
//!       - { op: enumerate_list, list: { ref: u, path: [friends] }, as: f }
//!       - { op: return, var: f }
//!   - op: limit
//!     limit: 10
//!   - op: return
//!     var: u
//! ```
//!
//! Every pipeline (and every subquery body) starts at an implicit SINGLETON.
//! Expressions that are not a bare variable reference are materialized into
//! a temporary variable by a CALCULATION placed right before their consumer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use qgraph_core::config::PlanConfig;
use qgraph_core::error::{Error, Result};
use qgraph_core::id::NodeId;
use qgraph_core::variable::Variable;

use crate::expr::{BinaryOp, Expr, UnaryOp};
use crate::kind::{
    Aggregate, CalculationNode, CollectMethod, CollectNode, EnumerateCollectionNode,
    EnumerateListNode, FilterNode, GroupVariable, LimitNode, ModificationNode, NodeKind,
    ReturnNode, SortElement, SortNode, SubqueryNode,
};
use crate::plan::{Plan, StaticCollectionStats};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub config: Option<PlanConfig>,
    /// Known collection sizes for cost estimation.
    #[serde(default)]
    pub collections: BTreeMap<String, usize>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Step {
    EnumerateCollection {
        collection: String,
        #[serde(rename = "as")]
        out: String,
        #[serde(default)]
        random: bool,
    },

    EnumerateList {
        list: ExprDef,
        #[serde(rename = "as")]
        out: String,
    },

    Calculation {
        #[serde(rename = "as")]
        out: String,
        expr: ExprDef,
    },

    Filter { expr: ExprDef },

    Limit {
        #[serde(default)]
        offset: u64,
        limit: u64,
        #[serde(default)]
        full_count: bool,
    },

    Sort {
        by: Vec<SortKey>,
        #[serde(default)]
        stable: bool,
    },

    Collect {
        #[serde(default)]
        groups: Vec<GroupDef>,
        #[serde(default)]
        aggregates: Vec<AggregateDef>,
        #[serde(default)]
        into: Option<String>,
        #[serde(default)]
        method: CollectMethod,
    },

    Subquery {
        #[serde(rename = "as")]
        out: String,
        steps: Vec<Step>,
    },

    Insert { collection: String, var: String },

    Remove { collection: String, var: String },

    Return {
        var: String,
        #[serde(default)]
        count: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortKey {
    pub var: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDef {
    #[serde(rename = "as")]
    pub out: String,
    pub var: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateDef {
    #[serde(rename = "as")]
    pub out: String,
    pub function: String,
    #[serde(default)]
    pub var: Option<String>,
}

/// Expression shorthand. Variables are referred to by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprDef {
    Ref {
        r#ref: String,
        #[serde(default)]
        path: Vec<String>,
    },
    Range {
        range: [i64; 2],
    },
    Call {
        call: String,
        #[serde(default)]
        args: Vec<ExprDef>,
        #[serde(default = "default_true")]
        deterministic: bool,
    },
    Not {
        not: Box<ExprDef>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<ExprDef>,
        rhs: Box<ExprDef>,
    },
    Value {
        value: Value,
    },
}

fn default_true() -> bool {
    true
}

struct Builder<'a> {
    plan: &'a mut Plan,
}

impl Builder<'_> {
    fn var(&self, name: &str) -> Result<Variable> {
        self.plan
            .variables()
            .by_name(name)
            .cloned()
            .ok_or_else(|| Error::Parse(format!("unknown variable '{name}'")))
    }

    fn expr(&self, def: &ExprDef) -> Result<Expr> {
        Ok(match def {
            ExprDef::Ref { r#ref, path } => {
                let mut e = Expr::reference(&self.var(r#ref)?);
                for name in path {
                    e = Expr::Attribute {
                        base: Box::new(e),
                        name: name.clone(),
                    };
                }
                e
            }
            ExprDef::Range { range } => Expr::Range {
                low: range[0],
                high: range[1],
            },
            ExprDef::Call {
                call,
                args,
                deterministic,
            } => Expr::call(
                call.clone(),
                args.iter().map(|a| self.expr(a)).collect::<Result<_>>()?,
                *deterministic,
            ),
            ExprDef::Not { not } => Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(self.expr(not)?),
            },
            ExprDef::Binary { op, lhs, rhs } => Expr::binary(*op, self.expr(lhs)?, self.expr(rhs)?),
            ExprDef::Value { value } => Expr::literal(value.clone()),
        })
    }

    fn chain(&mut self, below: NodeId, kind: NodeKind) -> NodeId {
        let id = self.plan.create_node(kind);
        self.plan.add_dependency(id, below);
        id
    }

    /// A variable holding the value of `def`: the variable itself for a bare
    /// reference, otherwise a temporary set by a new CALCULATION.
    fn materialize(&mut self, below: &mut NodeId, def: &ExprDef) -> Result<Variable> {
        if let ExprDef::Ref { r#ref, path } = def {
            if path.is_empty() {
                return self.var(r#ref);
            }
        }
        let expression = self.expr(def)?;
        let out_variable = self.plan.variables_mut().create_temporary();
        *below = self.chain(
            *below,
            NodeKind::Calculation(CalculationNode {
                out_variable: out_variable.clone(),
                expression,
            }),
        );
        Ok(out_variable)
    }

    /// Build `steps` on a fresh SINGLETON and return the last node.
    fn steps(&mut self, steps: &[Step]) -> Result<NodeId> {
        let mut top = self.plan.create_node(NodeKind::Singleton);
        for (i, step) in steps.iter().enumerate() {
            if matches!(step, Step::Return { .. }) && i + 1 != steps.len() {
                return Err(Error::Parse("'return' must be the last step".into()));
            }
            top = self.step(top, step)?;
        }
        Ok(top)
    }

    fn step(&mut self, mut top: NodeId, step: &Step) -> Result<NodeId> {
        let kind = match step {
            Step::EnumerateCollection {
                collection,
                out,
                random,
            } => NodeKind::EnumerateCollection(EnumerateCollectionNode {
                collection: collection.clone(),
                out_variable: self.plan.create_variable(out.clone()),
                random: *random,
                filter: None,
                projections: Vec::new(),
            }),
            Step::EnumerateList { list, out } => {
                let in_variable = self.materialize(&mut top, list)?;
                NodeKind::EnumerateList(EnumerateListNode {
                    in_variable,
                    out_variable: self.plan.create_variable(out.clone()),
                    filter: None,
                })
            }
            Step::Calculation { out, expr } => {
                let expression = self.expr(expr)?;
                NodeKind::Calculation(CalculationNode {
                    out_variable: self.plan.create_variable(out.clone()),
                    expression,
                })
            }
            Step::Filter { expr } => NodeKind::Filter(FilterNode {
                in_variable: self.materialize(&mut top, expr)?,
            }),
            Step::Limit {
                offset,
                limit,
                full_count,
            } => NodeKind::Limit(LimitNode {
                offset: *offset,
                limit: *limit,
                full_count: *full_count,
            }),
            Step::Sort { by, stable } => NodeKind::Sort(SortNode {
                elements: by
                    .iter()
                    .map(|k| {
                        Ok(SortElement {
                            in_variable: self.var(&k.var)?,
                            ascending: k.ascending,
                            path: Vec::new(),
                        })
                    })
                    .collect::<Result<_>>()?,
                stable: *stable,
                limit: None,
            }),
            Step::Collect {
                groups,
                aggregates,
                into,
                method,
            } => {
                // Resolve inputs before any output shadows a name.
                let group_inputs = groups
                    .iter()
                    .map(|g| self.var(&g.var))
                    .collect::<Result<Vec<_>>>()?;
                let agg_inputs = aggregates
                    .iter()
                    .map(|a| a.var.as_deref().map(|v| self.var(v)).transpose())
                    .collect::<Result<Vec<_>>>()?;
                NodeKind::Collect(CollectNode {
                    groups: groups
                        .iter()
                        .zip(group_inputs)
                        .map(|(g, in_variable)| GroupVariable {
                            out_variable: self.plan.create_variable(g.out.clone()),
                            in_variable,
                        })
                        .collect(),
                    aggregates: aggregates
                        .iter()
                        .zip(agg_inputs)
                        .map(|(a, in_variable)| Aggregate {
                            out_variable: self.plan.create_variable(a.out.clone()),
                            in_variable,
                            function: a.function.to_uppercase(),
                        })
                        .collect(),
                    expression_variable: None,
                    out_variable: into.as_ref().map(|n| self.plan.create_variable(n.clone())),
                    keep_variables: Vec::new(),
                    collect_options: *method,
                })
            }
            Step::Subquery { out, steps } => {
                let root = self.steps(steps)?;
                NodeKind::Subquery(SubqueryNode {
                    root,
                    out_variable: self.plan.create_variable(out.clone()),
                })
            }
            Step::Insert { collection, var } => NodeKind::Insert(self.modification(collection, var)?),
            Step::Remove { collection, var } => NodeKind::Remove(self.modification(collection, var)?),
            Step::Return { var, count } => NodeKind::Return(ReturnNode {
                in_variable: self.var(var)?,
                count: *count,
            }),
        };
        Ok(self.chain(top, kind))
    }

    fn modification(&self, collection: &str, var: &str) -> Result<ModificationNode> {
        Ok(ModificationNode {
            collection: collection.to_string(),
            in_doc_variable: self.var(var)?,
            in_key_variable: None,
            out_variable_old: None,
            out_variable_new: None,
            modification_flags: Default::default(),
        })
    }
}

/// Build a plan from an already-parsed pipeline.
pub fn build_plan(pipeline: &Pipeline) -> Result<Plan> {
    let config = pipeline.config.clone().unwrap_or_default();
    config.validate()?;
    if pipeline.steps.is_empty() {
        return Err(Error::Parse("empty pipeline".into()));
    }
    let mut plan = Plan::with_config(config);
    if !pipeline.collections.is_empty() {
        plan.set_collection_stats(Arc::new(StaticCollectionStats {
            counts: pipeline.collections.clone().into_iter().collect(),
        }));
    }
    let root = Builder { plan: &mut plan }.steps(&pipeline.steps)?;
    plan.set_root(root);
    debug!(nodes = plan.len(), "built plan from pipeline");
    Ok(plan)
}

/// Parse YAML source into a `Plan`.
pub fn parse_yaml_pipeline(yaml_src: &str) -> Result<Plan> {
    let doc: Pipeline =
        serde_yaml::from_str(yaml_src).map_err(|e| Error::Parse(e.to_string()))?;
    build_plan(&doc)
}

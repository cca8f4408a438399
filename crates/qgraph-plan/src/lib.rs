#![forbid(unsafe_code)]
//! qgraph-plan: the execution-plan DAG.
//!
//! A [`Plan`] owns every [`PlanNode`] in an arena addressed by [`NodeId`];
//! edges are id lists kept symmetric by the plan. On top of that:
//!
//! - a closed node taxonomy ([`NodeType`], [`NodeKind`]) with per-kind
//!   variable usage, rewrites and payload (de)serialization,
//! - an iterative [`Walker`] with dependency-first, subquery-first and
//!   flattening orders,
//! - lazily cached cost estimates with explicit invalidation,
//! - cloning within and across plans,
//! - variable liveness and a simple register planner,
//! - plan documents with a two-pass, all-or-nothing reader,
//! - subquery splicing and execution hints (async prefetch, call-stack splits),
//! - a YAML pipeline front-end for building plans by hand.
//!
//! [`NodeId`]: qgraph_core::id::NodeId

pub mod clone;
pub mod cost;
pub mod dsl;
pub mod expr;
pub mod kind;
pub mod liveness;
pub mod node;
pub mod node_type;
pub mod plan;
pub mod prefetch;
pub mod properties;
pub mod registers;
pub mod serialize;
pub mod splice;
pub mod walker;

pub use cost::CostEstimate;
pub use dsl::yaml::{build_plan, parse_yaml_pipeline};
pub use expr::{Expr, VarReplacements, VarSet};
pub use kind::NodeKind;
pub use node::{PlanNode, RegIdSet};
pub use node_type::NodeType;
pub use plan::{CollectionStats, Plan, StaticCollectionStats};
pub use prefetch::AsyncPrefetchEligibility;
pub use registers::{RegisterPlan, VarInfo};
pub use serialize::SerializeFlags;
pub use walker::{FlattenMode, NodeFinder, Uniqueness, VisitRecorder, WalkOrder, Walker, WalkerWorker};

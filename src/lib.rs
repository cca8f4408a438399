//! qgraph: execution-plan graph for a query engine.
//!
//! Re-exports the workspace crates under one name.

pub use qgraph_core;
pub use qgraph_plan;

pub use qgraph_core::prelude::*;
pub use qgraph_plan::{parse_yaml_pipeline, NodeKind, NodeType, Plan, SerializeFlags};

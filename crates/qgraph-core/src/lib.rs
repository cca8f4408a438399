#![forbid(unsafe_code)]
//! qgraph-core: ids, variables, configuration, errors, and hashing shared by
//! the plan graph crates.
//!
//! No graph logic lives here; `qgraph-plan` owns nodes and traversal.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod variable;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

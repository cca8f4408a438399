//! Convenient re-exports for downstream crates.

pub use crate::config::PlanConfig;
pub use crate::error::{Error, Result};
pub use crate::hash::{Fingerprint, FingerprintBuilder};
pub use crate::id::{NodeId, RegisterCount, RegisterId, VariableId};
pub use crate::variable::{Variable, VariableGenerator};

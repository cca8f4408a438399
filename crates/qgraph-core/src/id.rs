//! Strongly-typed identifiers used across the plan graph.
//!
//! Node, variable, and register ids are distinct types so that a register id can
//! never be handed to something expecting a plan node id.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident, $repr:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            pub const fn new(v: $repr) -> Self {
                Self(v)
            }
            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(NodeId, u64);
new_id!(VariableId, u64);
new_id!(RegisterId, u32);

impl RegisterId {
    /// Sentinel for "no register", used by optional variables.
    pub const MAX: RegisterId = RegisterId(u32::MAX);
}

/// Number of registers in a row at some depth.
pub type RegisterCount = u32;

//! Plan-scoped variables.
//!
//! The query AST owns the real symbol table; the plan graph only needs the id
//! and a display name. `VariableGenerator` hands out fresh ids the way the
//! symbol table would.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::VariableId;

/// A named value slot referenced by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable {
    pub id: VariableId,
    pub name: String,
}

impl Variable {
    pub fn new(id: VariableId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Temporaries created by the planner carry numeric names.
    pub fn is_user_defined(&self) -> bool {
        self.name
            .chars()
            .next()
            .map(|c| !c.is_ascii_digit())
            .unwrap_or(false)
    }
}

/// Issues variables with unique ids for one plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableGenerator {
    next_id: u64,
    variables: BTreeMap<VariableId, Variable>,
}

impl VariableGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a variable with a fresh id.
    pub fn create(&mut self, name: impl Into<String>) -> Variable {
        let var = Variable::new(VariableId::new(self.next_id), name);
        self.next_id += 1;
        self.variables.insert(var.id, var.clone());
        var
    }

    /// Create a temporary whose name is its id.
    pub fn create_temporary(&mut self) -> Variable {
        let name = self.next_id.to_string();
        self.create(name)
    }

    /// Make an externally created variable known, keeping ids unique. The
    /// largest id is reserved so a fresh id can always be issued after it.
    pub fn register(&mut self, var: &Variable) -> Result<()> {
        let after = var.id.get().checked_add(1).ok_or_else(|| {
            Error::Internal(format!("variable id {} is out of range", var.id.get()))
        })?;
        self.next_id = self.next_id.max(after);
        self.variables
            .entry(var.id)
            .or_insert_with(|| var.clone());
        Ok(())
    }

    pub fn get(&self, id: VariableId) -> Option<&Variable> {
        self.variables.get(&id)
    }

    /// Newest variable called `name`, so later definitions shadow earlier ones.
    pub fn by_name(&self, name: &str) -> Option<&Variable> {
        self.variables.values().rev().find(|v| v.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

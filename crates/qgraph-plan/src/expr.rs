//! Minimal expression tree carried by calculation, filter-like and scan nodes.
//!
//! Evaluation lives elsewhere; the plan graph only needs to know which
//! variables an expression touches, whether it is deterministic, and how to
//! rewrite variable references in place.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use qgraph_core::id::VariableId;
use qgraph_core::variable::Variable;

/// Set of variables, ordered by id for stable output.
pub type VarSet = BTreeSet<Variable>;

/// Old variable id to replacement variable.
pub type VarReplacements = HashMap<VariableId, Variable>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Plus,
    Minus,
    Times,
    Div,
    Mod,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
    },
    Array {
        members: Vec<Expr>,
    },
    /// Inclusive integer range `low..high`.
    Range {
        low: i64,
        high: i64,
    },
    Reference {
        variable: Variable,
    },
    Attribute {
        base: Box<Expr>,
        name: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        #[serde(default = "default_true")]
        deterministic: bool,
    },
}

fn default_true() -> bool {
    true
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn reference(variable: &Variable) -> Self {
        Expr::Reference {
            variable: variable.clone(),
        }
    }

    pub fn attribute(base: Expr, name: impl Into<String>) -> Self {
        Expr::Attribute {
            base: Box::new(base),
            name: name.into(),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>, deterministic: bool) -> Self {
        Expr::Call {
            name: name.into(),
            args,
            deterministic,
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal { .. } | Expr::Range { .. } | Expr::Reference { .. } => Vec::new(),
            Expr::Array { members } => members.iter().collect(),
            Expr::Attribute { base, .. } => vec![base.as_ref()],
            Expr::Unary { operand, .. } => vec![operand.as_ref()],
            Expr::Binary { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Expr::Literal { .. } | Expr::Range { .. } | Expr::Reference { .. } => Vec::new(),
            Expr::Array { members } => members.iter_mut().collect(),
            Expr::Attribute { base, .. } => vec![base.as_mut()],
            Expr::Unary { operand, .. } => vec![operand.as_mut()],
            Expr::Binary { lhs, rhs, .. } => vec![lhs.as_mut(), rhs.as_mut()],
            Expr::Call { args, .. } => args.iter_mut().collect(),
        }
    }

    /// Add every referenced variable to `out`.
    pub fn variables(&self, out: &mut VarSet) {
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if let Expr::Reference { variable } = e {
                out.insert(variable.clone());
            }
            stack.extend(e.children());
        }
    }

    pub fn references(&self, id: VariableId) -> bool {
        let mut vars = VarSet::new();
        self.variables(&mut vars);
        vars.iter().any(|v| v.id == id)
    }

    /// Swap variable references according to `replacements`.
    pub fn replace_variables(&mut self, replacements: &VarReplacements) {
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if let Expr::Reference { variable } = &mut *e {
                if let Some(new_var) = replacements.get(&variable.id) {
                    *variable = new_var.clone();
                }
                continue;
            }
            stack.extend(e.children_mut());
        }
    }

    /// Replace `search.path[0].path[1]...` by a plain reference to `replacement`.
    pub fn replace_attribute_access(
        &mut self,
        search: &Variable,
        path: &[String],
        replacement: &Variable,
    ) {
        if path.is_empty() {
            return;
        }
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if e.matches_attribute_path(search, path) {
                *e = Expr::reference(replacement);
                continue;
            }
            stack.extend(e.children_mut());
        }
    }

    fn matches_attribute_path(&self, search: &Variable, path: &[String]) -> bool {
        let mut current = self;
        for name in path.iter().rev() {
            match current {
                Expr::Attribute { base, name: n } if n == name => current = base.as_ref(),
                _ => return false,
            }
        }
        matches!(current, Expr::Reference { variable } if variable.id == search.id)
    }

    /// False if any function call in the tree is non-deterministic.
    pub fn is_deterministic(&self) -> bool {
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if let Expr::Call {
                deterministic: false,
                ..
            } = e
            {
                return false;
            }
            stack.extend(e.children());
        }
        true
    }

    /// Names of the functions called anywhere in the tree, with their
    /// determinism, in call-site order.
    pub fn functions(&self) -> Vec<(&str, bool)> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            if let Expr::Call {
                name,
                deterministic,
                ..
            } = e
            {
                out.push((name.as_str(), *deterministic));
            }
            let mut children = e.children();
            children.reverse();
            stack.extend(children);
        }
        out
    }

    /// Deterministic and free of variable references.
    pub fn is_constant(&self) -> bool {
        let mut vars = VarSet::new();
        self.variables(&mut vars);
        vars.is_empty() && self.is_deterministic()
    }

    /// Statically known number of elements if this expression yields a list.
    pub fn known_length(&self) -> Option<usize> {
        match self {
            Expr::Array { members } => Some(members.len()),
            Expr::Literal {
                value: Value::Array(items),
            } => Some(items.len()),
            Expr::Range { low, high } => {
                let span = high.abs_diff(*low);
                Some(usize::try_from(span).unwrap_or(usize::MAX).saturating_add(1))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Literal { value } => write!(f, "{value}"),
            Expr::Array { members } => {
                f.write_str("[")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{m}")?;
                }
                f.write_str("]")
            }
            Expr::Range { low, high } => write!(f, "{low}..{high}"),
            Expr::Reference { variable } => f.write_str(&variable.name),
            Expr::Attribute { base, name } => write!(f, "{base}.{name}"),
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{operand}"),
                UnaryOp::Minus => write!(f, "-{operand}"),
            },
            Expr::Binary { op, lhs, rhs } => {
                let sym = match op {
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                    BinaryOp::Plus => "+",
                    BinaryOp::Minus => "-",
                    BinaryOp::Times => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::In => "IN",
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
            Expr::Call { name, args, .. } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(id: u64, name: &str) -> Variable {
        Variable::new(VariableId::new(id), name)
    }

    #[test]
    fn collects_and_replaces_references() {
        let x = var(1, "x");
        let y = var(2, "y");
        let mut e = Expr::binary(BinaryOp::Gt, Expr::reference(&x), Expr::literal(1));
        let mut vars = VarSet::new();
        e.variables(&mut vars);
        assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec![x.clone()]);

        let mut map = VarReplacements::new();
        map.insert(x.id, y.clone());
        e.replace_variables(&map);
        assert!(e.references(y.id));
        assert!(!e.references(x.id));
    }

    #[test]
    fn functions_are_listed_in_call_site_order() {
        let e = Expr::call(
            "OUTER",
            vec![
                Expr::call("LEFT", vec![], true),
                Expr::binary(
                    BinaryOp::Plus,
                    Expr::literal(1),
                    Expr::call("RIGHT", vec![], false),
                ),
            ],
            true,
        );
        assert_eq!(
            e.functions(),
            vec![("OUTER", true), ("LEFT", true), ("RIGHT", false)]
        );
        assert!(Expr::literal(1).functions().is_empty());
    }

    #[test]
    fn attribute_access_is_replaced_only_on_full_path() {
        let doc = var(1, "doc");
        let tmp = var(2, "tmp");
        let path = vec!["a".to_string(), "b".to_string()];
        let mut full = Expr::attribute(Expr::attribute(Expr::reference(&doc), "a"), "b");
        full.replace_attribute_access(&doc, &path, &tmp);
        assert_eq!(full, Expr::reference(&tmp));

        let mut partial = Expr::attribute(Expr::reference(&doc), "a");
        partial.replace_attribute_access(&doc, &path, &tmp);
        assert!(partial.references(doc.id));
    }

    #[test]
    fn determinism_and_constness() {
        let rand = Expr::call("RAND", vec![], false);
        assert!(!rand.is_deterministic());
        assert!(!rand.is_constant());
        let arr = Expr::Array {
            members: vec![Expr::literal(1), Expr::literal(2)],
        };
        assert!(arr.is_constant());
        assert_eq!(arr.known_length(), Some(2));
        assert_eq!(Expr::Range { low: 1, high: 10 }.known_length(), Some(10));
    }

    #[test]
    fn extreme_range_length_saturates() {
        let full = Expr::Range {
            low: i64::MIN,
            high: i64::MAX,
        };
        assert_eq!(full.known_length(), Some(usize::MAX));
        let reversed = Expr::Range { low: 5, high: -5 };
        assert_eq!(reversed.known_length(), Some(11));
    }

    #[test]
    fn serde_shape_is_tagged() {
        let e = Expr::reference(&var(3, "v"));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "reference");
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}

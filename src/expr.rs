//! Expression trees.
//!
//! Expressions are produced by the compiler collaborator and are immutable
//! after construction; the runtime shares them by reference (or `Arc`) and
//! never mutates a validated tree. `Expr::Empty` exists only so an invalid
//! node has a representation; a type-checked tree never contains one.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Built-in binary operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOpKind::Add => "+",
            BinaryOpKind::Sub => "-",
            BinaryOpKind::Mul => "*",
            BinaryOpKind::Div => "/",
            BinaryOpKind::Eq => "==",
            BinaryOpKind::Neq => "!=",
            BinaryOpKind::Lt => "<",
            BinaryOpKind::Lte => "<=",
            BinaryOpKind::Gt => ">",
            BinaryOpKind::Gte => ">=",
            BinaryOpKind::And => "&&",
            BinaryOpKind::Or => "||",
        }
    }
}

/// Built-in unary operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOpKind {
    Plus,
    Neg,
}

impl UnaryOpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOpKind::Plus => "+",
            UnaryOpKind::Neg => "-",
        }
    }
}

/// Reference to a variable, optionally scoped to another agent (`agent.var`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub agent: Option<String>,
    pub var: String,
}

impl VarRef {
    pub fn local(var: impl Into<String>) -> Self {
        Self {
            agent: None,
            var: var.into(),
        }
    }

    pub fn scoped(agent: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            var: var.into(),
        }
    }

    /// Splits a `agent.var` identifier; a bare name stays unscoped.
    pub fn parse(ident: &str) -> Self {
        match ident.split_once('.') {
            Some((agent, var)) => Self::scoped(agent, var),
            None => Self::local(ident),
        }
    }

    /// True when the reference designates a variable of `agent`, either
    /// because it is unscoped or because the scope names it explicitly.
    pub fn is_local_to(&self, agent: &str) -> bool {
        match &self.agent {
            None => true,
            Some(scope) => scope == agent,
        }
    }
}

impl std::fmt::Display for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.agent {
            Some(agent) => write!(f, "{agent}.{}", self.var),
            None => f.write_str(&self.var),
        }
    }
}

/// A named function applied to argument expressions. Doubles as the logic
/// engine's fact shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnCall {
    pub name: String,
    pub args: Vec<Expr>,
}

impl FnCall {
    pub fn new(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// One node of a typed expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    /// Invalid node; never present in a validated tree.
    Empty,
    Const(Value),
    Var(VarRef),
    Call(FnCall),
    Binary {
        op: BinaryOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOpKind,
        subject: Box<Expr>,
    },
}

impl Expr {
    pub fn int(v: i64) -> Self {
        Expr::Const(Value::Int(v))
    }

    pub fn double(v: f64) -> Self {
        Expr::Const(Value::Double(v))
    }

    pub fn bool(v: bool) -> Self {
        Expr::Const(Value::Bool(v))
    }

    pub fn str(v: impl Into<String>) -> Self {
        Expr::Const(Value::Str(v.into()))
    }

    /// Variable reference parsed from `var` or `agent.var` form.
    pub fn var(ident: &str) -> Self {
        Expr::Var(VarRef::parse(ident))
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(FnCall::new(name, args))
    }

    pub fn binary(op: BinaryOpKind, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOpKind, subject: Expr) -> Self {
        Expr::Unary {
            op,
            subject: Box::new(subject),
        }
    }

    pub fn add(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Add, left, right)
    }

    pub fn sub(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Sub, left, right)
    }

    pub fn mul(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Mul, left, right)
    }

    pub fn div(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Div, left, right)
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Eq, left, right)
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::Lt, left, right)
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOpKind::And, left, right)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Expr::Empty)
    }

    /// The constant inside this node, when it is one.
    pub fn as_const(&self) -> Option<&Value> {
        match self {
            Expr::Const(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Empty => f.write_str("<empty>"),
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Var(r) => write!(f, "{r}"),
            Expr::Call(c) => {
                write!(f, "{}(", c.name)?;
                for (i, arg) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Binary { op, left, right } => {
                write!(f, "({left} {} {right})", op.as_str())
            }
            Expr::Unary { op, subject } => write!(f, "{}{subject}", op.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_identifiers_decompose() {
        let r = VarRef::parse("pos.x");
        assert_eq!(r.agent.as_deref(), Some("pos"));
        assert_eq!(r.var, "x");
        assert!(r.is_local_to("pos"));
        assert!(!r.is_local_to("nav"));

        let bare = VarRef::parse("x");
        assert!(bare.agent.is_none());
        assert!(bare.is_local_to("anyone"));
    }

    #[test]
    fn display_is_readable() {
        let e = Expr::eq(
            Expr::var("pos.z"),
            Expr::add(Expr::var("x"), Expr::int(3)),
        );
        assert_eq!(e.to_string(), "(pos.z == (x + 3))");
    }

    #[test]
    fn display_call_form() {
        let e = Expr::call("distance", vec![Expr::var("x"), Expr::var("goal.x")]);
        assert_eq!(e.to_string(), "distance(x, goal.x)");
    }
}

//! Typed values exchanged between agents.
//!
//! A `Value` is the runtime representation of every exported variable,
//! constant and kernel result. Strings and structs are value-copied across
//! the wire; opaque values are carried as tagged JSON the runtime never
//! interprets.

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::expr::{BinaryOpKind, UnaryOpKind};

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Int,
    Double,
    Bool,
    Str,
    Struct,
    Opaque,
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeTag::Int => "int",
            TypeTag::Double => "double",
            TypeTag::Bool => "bool",
            TypeTag::Str => "string",
            TypeTag::Struct => "struct",
            TypeTag::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// One named field of a struct value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

/// Sum of every value kind the runtime understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Double(f64),
    Bool(bool),
    Str(String),
    Struct(Vec<Field>),
    /// User-defined payload the runtime copies without interpreting.
    Opaque {
        ty: String,
        data: serde_json::Value,
    },
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Int(_) => TypeTag::Int,
            Value::Double(_) => TypeTag::Double,
            Value::Bool(_) => TypeTag::Bool,
            Value::Str(_) => TypeTag::Str,
            Value::Struct(_) => TypeTag::Struct,
            Value::Opaque { .. } => TypeTag::Opaque,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn type_mismatch(op: &str, left: &Value, right: &Value) -> ExecError {
        ExecError::InvalidArgument(format!(
            "{op} is not defined on ({}, {})",
            left.tag(),
            right.tag()
        ))
    }

    /// Ordering where defined: numeric variants and strings.
    fn partial_cmp_values(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.value)?;
                }
                write!(f, "}}")
            }
            Value::Opaque { ty, .. } => write!(f, "<{ty}>"),
        }
    }
}

/// Applies a built-in binary kernel, typed per operand.
///
/// Arithmetic is defined on matching numeric variants, comparison on numeric
/// variants and strings, AND/OR on booleans. A division whose right operand
/// is zero reports `InvalidArgument`, never a panic.
pub fn apply_binary(op: BinaryOpKind, left: &Value, right: &Value) -> Result<Value, ExecError> {
    use BinaryOpKind::*;
    match op {
        Add | Sub | Mul | Div => apply_arithmetic(op, left, right),
        Eq => Ok(Value::Bool(left == right)),
        Neq => Ok(Value::Bool(left != right)),
        Lt | Lte | Gt | Gte => {
            let ord = left
                .partial_cmp_values(right)
                .ok_or_else(|| Value::type_mismatch(op.as_str(), left, right))?;
            let b = match op {
                Lt => ord.is_lt(),
                Lte => ord.is_le(),
                Gt => ord.is_gt(),
                Gte => ord.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(b))
        }
        And | Or => match (left, right) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
                And => *a && *b,
                Or => *a || *b,
                _ => unreachable!(),
            })),
            _ => Err(Value::type_mismatch(op.as_str(), left, right)),
        },
    }
}

fn apply_arithmetic(op: BinaryOpKind, left: &Value, right: &Value) -> Result<Value, ExecError> {
    use BinaryOpKind::*;
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => match op {
            Add => Ok(Value::Int(a.wrapping_add(*b))),
            Sub => Ok(Value::Int(a.wrapping_sub(*b))),
            Mul => Ok(Value::Int(a.wrapping_mul(*b))),
            Div => {
                if *b == 0 {
                    Err(ExecError::InvalidArgument("division by zero".to_string()))
                } else {
                    Ok(Value::Int(a / b))
                }
            }
            _ => unreachable!(),
        },
        (Value::Double(a), Value::Double(b)) => match op {
            Add => Ok(Value::Double(a + b)),
            Sub => Ok(Value::Double(a - b)),
            Mul => Ok(Value::Double(a * b)),
            Div => {
                if *b == 0.0 {
                    Err(ExecError::InvalidArgument("division by zero".to_string()))
                } else {
                    Ok(Value::Double(a / b))
                }
            }
            _ => unreachable!(),
        },
        _ => Err(Value::type_mismatch(op.as_str(), left, right)),
    }
}

/// Applies a built-in unary kernel.
pub fn apply_unary(op: UnaryOpKind, subject: &Value) -> Result<Value, ExecError> {
    match (op, subject) {
        (UnaryOpKind::Plus, Value::Int(i)) => Ok(Value::Int(*i)),
        (UnaryOpKind::Plus, Value::Double(d)) => Ok(Value::Double(*d)),
        (UnaryOpKind::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOpKind::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
        _ => Err(ExecError::InvalidArgument(format!(
            "{} is not defined on {}",
            op.as_str(),
            subject.tag()
        ))),
    }
}

//! Asynchronous expression evaluation.
//!
//! Evaluation is dispatched on the node kind: constants copy, variables are
//! refreshed then read (locally) or proxied (remotely), and function calls
//! fan out their argument evaluations in parallel. An empty sub-result makes
//! the containing result empty without being an error; the first error of
//! any sub-evaluation is surfaced as the result.

use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};

use crate::agent::AgentContext;
use crate::error::ExecError;
use crate::expr::{BinaryOpKind, Expr, UnaryOpKind};
use crate::value::{TypeTag, Value, apply_binary, apply_unary};

/// A pure function kernel. Kernels must not block; returning `None` makes
/// the call's result empty.
pub type Kernel = Arc<dyn Fn(&[Value]) -> Result<Option<Value>, ExecError> + Send + Sync>;

/// A registered kernel with its arity.
#[derive(Clone)]
pub struct FunctionDef {
    pub arity: usize,
    kernel: Kernel,
}

impl FunctionDef {
    pub fn new(arity: usize, kernel: Kernel) -> Self {
        Self { arity, kernel }
    }

    pub fn apply(&self, args: &[Value]) -> Result<Option<Value>, ExecError> {
        (self.kernel)(args)
    }
}

/// Registry of function kernels, filled by generated agent code.
#[derive(Default)]
pub struct FunctionMap {
    map: DashMap<String, FunctionDef>,
}

fn typed_binary(op: BinaryOpKind, tag: TypeTag) -> Kernel {
    Arc::new(move |args: &[Value]| {
        let (l, r) = (&args[0], &args[1]);
        if l.tag() != tag || r.tag() != tag {
            return Err(ExecError::InvalidArgument(format!(
                "expected ({tag}, {tag}), got ({}, {})",
                l.tag(),
                r.tag()
            )));
        }
        apply_binary(op, l, r).map(Some)
    })
}

impl FunctionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map pre-populated with kernels for the built-in types: equality on
    /// everything, arithmetic on numerics, comparison on numerics and
    /// strings.
    pub fn with_standard_types() -> Self {
        let map = Self::new();
        for (name, tag) in [
            ("int", TypeTag::Int),
            ("double", TypeTag::Double),
            ("bool", TypeTag::Bool),
            ("string", TypeTag::Str),
        ] {
            map.register_equalable(name, tag);
        }
        for (name, tag) in [("int", TypeTag::Int), ("double", TypeTag::Double)] {
            map.register_numeric(name, tag);
            map.register_comparable(name, tag);
        }
        map.register_comparable("string", TypeTag::Str);
        map
    }

    pub fn add(&self, name: impl Into<String>, def: FunctionDef) {
        self.map.insert(name.into(), def);
    }

    pub fn get(&self, name: &str) -> Option<FunctionDef> {
        self.map.get(name).map(|d| d.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Registers `equal_<ty>` / `not_equal_<ty>`.
    pub fn register_equalable(&self, type_name: &str, tag: TypeTag) {
        self.add(
            format!("equal_{type_name}"),
            FunctionDef::new(2, typed_binary(BinaryOpKind::Eq, tag)),
        );
        self.add(
            format!("not_equal_{type_name}"),
            FunctionDef::new(2, typed_binary(BinaryOpKind::Neq, tag)),
        );
    }

    /// Registers `add_/minus_/times_/divides_/negate_<ty>`.
    pub fn register_numeric(&self, type_name: &str, tag: TypeTag) {
        for (prefix, op) in [
            ("add", BinaryOpKind::Add),
            ("minus", BinaryOpKind::Sub),
            ("times", BinaryOpKind::Mul),
            ("divides", BinaryOpKind::Div),
        ] {
            self.add(
                format!("{prefix}_{type_name}"),
                FunctionDef::new(2, typed_binary(op, tag)),
            );
        }
        self.add(
            format!("negate_{type_name}"),
            FunctionDef::new(
                1,
                Arc::new(move |args: &[Value]| {
                    if args[0].tag() != tag {
                        return Err(ExecError::InvalidArgument(format!(
                            "expected {tag}, got {}",
                            args[0].tag()
                        )));
                    }
                    apply_unary(UnaryOpKind::Neg, &args[0]).map(Some)
                }),
            ),
        );
    }

    /// Registers `less_/less_equal_/greater_/greater_equal_<ty>`.
    pub fn register_comparable(&self, type_name: &str, tag: TypeTag) {
        for (prefix, op) in [
            ("less", BinaryOpKind::Lt),
            ("less_equal", BinaryOpKind::Lte),
            ("greater", BinaryOpKind::Gt),
            ("greater_equal", BinaryOpKind::Gte),
        ] {
            self.add(
                format!("{prefix}_{type_name}"),
                FunctionDef::new(2, typed_binary(op, tag)),
            );
        }
    }
}

/// Evaluates an expression against an agent's symbols.
///
/// `Ok(None)` means the expression is empty (a sub-result was empty), which
/// callers requiring a value must turn into an invalid-argument error.
pub fn async_eval<'a>(
    ctx: &'a Arc<AgentContext>,
    expr: &'a Expr,
) -> BoxFuture<'a, Result<Option<Value>, ExecError>> {
    async move {
        match expr {
            Expr::Empty => Err(ExecError::InvalidArgument(
                "evaluating an empty expression".to_string(),
            )),
            Expr::Const(v) => Ok(Some(v.clone())),
            Expr::Var(r) => {
                if r.is_local_to(ctx.name()) {
                    let locals = [r.var.clone()];
                    crate::updater::update(ctx, &locals, &[])
                        .await
                        .map_err(|e| match e {
                            ExecError::NotFound(v) => {
                                ExecError::InvalidArgument(format!("unknown variable {v}"))
                            }
                            other => other,
                        })?;
                    Ok(Some(ctx.read_cell(&r.var)?))
                } else {
                    let agent = r.agent.as_deref().expect("non-local var has a scope");
                    Ok(Some(ctx.proxy().get(agent, &r.var).await?))
                }
            }
            Expr::Call(call) => {
                let def = ctx
                    .functions()
                    .get(&call.name)
                    .ok_or_else(|| ExecError::NotFound(format!("function {}", call.name)))?;
                if call.args.len() != def.arity {
                    return Err(ExecError::InvalidArgument(format!(
                        "{} expects {} arguments, got {}",
                        call.name,
                        def.arity,
                        call.args.len()
                    )));
                }
                let results =
                    try_join_all(call.args.iter().map(|arg| async_eval(ctx, arg))).await?;
                let mut values = Vec::with_capacity(results.len());
                for r in results {
                    match r {
                        Some(v) => values.push(v),
                        // Poor maybe monad: one empty argument empties the call.
                        None => return Ok(None),
                    }
                }
                def.apply(&values)
            }
            Expr::Binary { op, left, right } => {
                let (l, r) = futures::try_join!(async_eval(ctx, left), async_eval(ctx, right))?;
                match (l, r) {
                    (Some(l), Some(r)) => apply_binary(*op, &l, &r).map(Some),
                    _ => Ok(None),
                }
            }
            Expr::Unary { op, subject } => match async_eval(ctx, subject).await? {
                Some(v) => apply_unary(*op, &v).map(Some),
                None => Ok(None),
            },
        }
    }
    .boxed()
}

/// Evaluates a predicate; empty or non-boolean results are errors.
pub async fn eval_bool(ctx: &Arc<AgentContext>, expr: &Expr) -> Result<bool, ExecError> {
    match async_eval(ctx, expr).await? {
        Some(Value::Bool(b)) => Ok(b),
        Some(v) => Err(ExecError::InvalidArgument(format!(
            "predicate {expr} evaluated to {}",
            v.tag()
        ))),
        None => Err(ExecError::InvalidArgument(format!(
            "predicate {expr} evaluated to empty"
        ))),
    }
}

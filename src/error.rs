//! Error types for the execution layer.
//!
//! The variants mirror the signals exchanged between primitives, sequences
//! and the transport. `TemporaryFailure` and `RunAgain` are not failures in
//! the usual sense: they are the cooperative pause/resume signals a peer
//! emits while a constraint is transiently unsatisfiable.

use thiserror::Error;

use crate::expr::Expr;

/// Execution-layer error taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    /// Cooperative cancellation was observed.
    #[error("interrupted")]
    Interrupted,

    /// A primitive could not start or an infrastructure call failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// A primitive ran to completion but produced a domain failure,
    /// e.g. the peer reported the constraint unsatisfiable.
    #[error("execution ko")]
    ExecutionKo,

    /// The peer cannot currently satisfy the constraint but may later.
    /// Pauses the upstream pipeline instead of tearing it down.
    #[error("temporary failure")]
    TemporaryFailure,

    /// Resume signal paired with `TemporaryFailure`.
    #[error("run again")]
    RunAgain,

    /// Type mismatch, unknown symbol, or an empty value where one is required.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Name resolution failed.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ExecError {
    /// Shorthand used by the transport layer.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn invalid(err: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(err.to_string())
    }

    /// Transport errors convert to `ExecutionFailed` when they cross the
    /// sequence boundary; every other kind passes through unchanged.
    pub fn at_sequence_boundary(self) -> Self {
        match self {
            Self::Transport(msg) => Self::ExecutionFailed(msg),
            other => other,
        }
    }
}

/// Failure report produced by the recipe runner for its caller.
///
/// Identifies the offending primitive's original expression when the body
/// failed, or the list of unsatisfied preconditions when the recipe never
/// started.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("recipe failed: {error}")]
pub struct RuntimeFailure {
    pub error: ExecError,
    /// Expression of the primitive that failed, when known.
    pub blamed: Option<Expr>,
    /// Preconditions that evaluated to false, when that is what stopped us.
    pub unsatisfied: Vec<Expr>,
}

impl RuntimeFailure {
    pub fn new(error: ExecError) -> Self {
        Self {
            error,
            blamed: None,
            unsatisfied: Vec::new(),
        }
    }

    pub fn blaming(error: ExecError, blamed: Option<Expr>) -> Self {
        Self {
            error,
            blamed,
            unsatisfied: Vec::new(),
        }
    }

    pub fn preconditions(unsatisfied: Vec<Expr>) -> Self {
        Self {
            error: ExecError::ExecutionFailed("preconditions unsatisfied".to_string()),
            blamed: None,
            unsatisfied,
        }
    }

    pub fn was_interrupted(&self) -> bool {
        self.error == ExecError::Interrupted
    }
}

//! # hyper-runtime — a constraint-propagating multi-agent runtime
//!
//! Each agent is a process that exports named typed variables, accepts
//! constraints ("make X=Y") and queries ("read Z"), and runs local recipes
//! whose bodies are sequences of asynchronous, abortable primitives. Agents
//! discover each other through a central name server and exchange values
//! and constraint requests over a point-to-point framed transport.
//!
//! The layers, leaves first: typed values and expression trees, the wire
//! codec, the multiplexed transport, the name registry, remote reads and the
//! batched updater, the asynchronous expression evaluator, abortable
//! primitives composed into sequences with pause/resume/interrupt
//! semantics, the recipe runner, and the agent tying it all together.

pub mod agent;
pub mod conditions;
pub mod domain;
pub mod error;
pub mod eval;
pub mod expr;
pub mod logcollect;
pub mod logic;
pub mod nameserver;
pub mod ping;
pub mod primitive;
pub mod primitives;
pub mod proxy;
pub mod recipe;
pub mod sequence;
pub mod transport;
pub mod updater;
pub mod value;
pub mod wire;

pub use crate::agent::{Agent, AgentConfig, AgentContext};
pub use crate::conditions::{ConditionEvaluator, ConditionSet};
pub use crate::domain::AgentName;
pub use crate::error::{ExecError, RuntimeFailure};
pub use crate::eval::{FunctionDef, FunctionMap, async_eval, eval_bool};
pub use crate::expr::{BinaryOpKind, Expr, FnCall, UnaryOpKind, VarRef};
pub use crate::logic::{FactBase, LogicEngine, RecipeTable, Tribool};
pub use crate::nameserver::{NameClient, NameServer, RegistryMap};
pub use crate::primitive::{AbortableFn, Done, Primitive};
pub use crate::primitives::{
    AbortConstraint, ComputeExpr, EnsureConstraint, MakeConstraint, WaitExpr, new_hold,
};
pub use crate::proxy::{RemoteProxy, RemoteVar};
pub use crate::recipe::{Recipe, RecipeDef, RecipeOutcome, RecipeReport, RecipeState};
pub use crate::sequence::{Sequence, SequenceCtl};
pub use crate::transport::{Dispatcher, PeerLink, ReplyHandle, Server};
pub use crate::updater::{Cell, Refresh, Source};
pub use crate::value::{Field, TypeTag, Value};
pub use crate::wire::{ConstraintState, Message, WireCodec};

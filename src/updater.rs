//! Variable cells and the batched refresh machinery.
//!
//! Every exported variable lives in a [`Cell`] owned by its agent. A cell
//! may carry a refresh source (a remote binding or a local computation) and
//! a policy deciding when that source is consulted. The updater refreshes a
//! mixed set of local cells and remote reads in parallel with a single
//! joined completion; ordering between the refreshes is unspecified and the
//! first error wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;

use crate::agent::AgentContext;
use crate::error::ExecError;
use crate::proxy::RemoteVar;
use crate::value::{TypeTag, Value};

/// When a cell's refresh source is consulted.
#[derive(Debug, Clone, Default)]
pub enum Refresh {
    /// Plain export: the value only changes when the owner writes it.
    #[default]
    Constant,
    /// Consult the source on every refresh request.
    OnDemand,
    /// Consult the source only once the value is older than the duration.
    StaleAfter(Duration),
}

/// Local computation producing a fresh value for a cell. Must not block.
pub type ComputeFn = Arc<dyn Fn() -> Result<Value, ExecError> + Send + Sync>;

/// Where a cell's fresh values come from.
#[derive(Clone)]
pub enum Source {
    /// Mirror of a variable owned by another agent.
    Remote { agent: String, var: String },
    /// Value maintained by a local callback.
    Computed(ComputeFn),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Remote { agent, var } => write!(f, "Remote({agent}.{var})"),
            Source::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// A typed variable cell. Mutated only through its owning agent.
#[derive(Debug, Clone)]
pub struct Cell {
    pub tag: TypeTag,
    pub value: Value,
    pub refresh: Refresh,
    pub source: Option<Source>,
    pub last_refresh: Option<Instant>,
}

impl Cell {
    pub fn constant(value: Value) -> Self {
        Self {
            tag: value.tag(),
            value,
            refresh: Refresh::Constant,
            source: None,
            last_refresh: None,
        }
    }

    pub fn with_source(value: Value, refresh: Refresh, source: Source) -> Self {
        Self {
            tag: value.tag(),
            value,
            refresh,
            source: Some(source),
            last_refresh: None,
        }
    }

    /// True when the policy says the source should be consulted now.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        if self.source.is_none() {
            return false;
        }
        match self.refresh {
            Refresh::Constant => false,
            Refresh::OnDemand => true,
            Refresh::StaleAfter(window) => self
                .last_refresh
                .is_none_or(|last| now.duration_since(last) >= window),
        }
    }
}

/// Refreshes local cells and fetches remote variables, in parallel.
///
/// Returns the remote values in input order. A missing local cell reports
/// `NotFound`; the first failure cancels the remaining work.
pub async fn update(
    ctx: &Arc<AgentContext>,
    locals: &[String],
    remotes: &[RemoteVar],
) -> Result<Vec<Value>, ExecError> {
    let local_work = try_join_all(locals.iter().map(|name| ctx.refresh_cell(name)));
    let proxy = ctx.proxy();
    let remote_work = proxy.get_all(remotes);
    let (_, values) = futures::try_join!(local_work, remote_work)?;
    Ok(values)
}

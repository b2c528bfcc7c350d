//! Remote variable reads.
//!
//! A proxy read sends a `RequestVariableValue` frame to the owning agent and
//! decodes the snapshot it answers with. The bulk form issues every read in
//! parallel and joins on completion, surfacing the first error.

use std::sync::Arc;

use futures::future::try_join_all;

use crate::agent::AgentContext;
use crate::error::ExecError;
use crate::value::Value;
use crate::wire::Message;

/// One remote variable designator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVar {
    pub agent: String,
    pub var: String,
}

impl RemoteVar {
    pub fn new(agent: impl Into<String>, var: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            var: var.into(),
        }
    }
}

impl std::fmt::Display for RemoteVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.agent, self.var)
    }
}

/// Reads remote variables on behalf of one agent.
pub struct RemoteProxy {
    ctx: Arc<AgentContext>,
}

impl RemoteProxy {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self { ctx }
    }

    /// Reads one variable from a peer. An unknown variable is an
    /// invalid-argument error, not a transport failure.
    pub async fn get(&self, agent: &str, var: &str) -> Result<Value, ExecError> {
        let link = self.ctx.peer(agent).await?;
        let src = self.ctx.name().to_string();
        let var_owned = var.to_string();
        let answer = link
            .request_terminal(|id| Message::RequestVariableValue {
                id,
                src: src.clone(),
                var: var_owned.clone(),
            })
            .await;
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                if matches!(err, ExecError::Transport(_)) {
                    self.ctx.report_peer_failure(agent);
                }
                return Err(err);
            }
        };
        match answer {
            Message::VariableValue {
                value: Some(value), ..
            } => Ok(value),
            Message::VariableValue { value: None, .. } => Err(ExecError::InvalidArgument(
                format!("unknown variable {agent}.{var}"),
            )),
            other => Err(ExecError::transport(format!(
                "unexpected answer {}",
                other.kind()
            ))),
        }
    }

    /// Fetches a heterogeneous batch in parallel; completes once when every
    /// read has finished, carrying the first error encountered if any.
    pub async fn get_all(&self, vars: &[RemoteVar]) -> Result<Vec<Value>, ExecError> {
        try_join_all(vars.iter().map(|rv| self.get(&rv.agent, &rv.var))).await
    }
}

//! The agent: an addressable process exporting typed variables and recipes.
//!
//! On startup an agent registers with the name server, opens its server on
//! the assigned endpoint and launches the liveness ping. Incoming frames are
//! dispatched to the symbol table (variable reads), to the logic layer
//! (constraint requests select and start a recipe) or to the running-request
//! table (aborts). Exported cells are mutated only through their owning
//! agent; readers get a snapshot at answer time.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::AgentName;
use crate::error::ExecError;
use crate::eval::{FunctionMap, eval_bool};
use crate::expr::Expr;
use crate::logic::LogicEngine;
use crate::nameserver::NameClient;
use crate::ping::{DEFAULT_PING_PERIOD, PingTask};
use crate::proxy::RemoteProxy;
use crate::recipe::Recipe;
use crate::transport::{Dispatcher, PeerLink, ReplyHandle, Server};
use crate::updater::{Cell, Refresh, Source};
use crate::value::Value;
use crate::wire::{ConstraintState, Message};

/// Period of the constraint maintenance / retry loops.
const SERVE_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Shared core of one agent: symbol table, kernels, peer links and the
/// table of constraints currently served. Primitives and evaluators hold an
/// `Arc` of this.
pub struct AgentContext {
    weak: Weak<AgentContext>,
    name: String,
    name_client: Arc<NameClient>,
    cells: DashMap<String, Cell>,
    functions: FunctionMap,
    links: DashMap<String, Arc<PeerLink>>,
    logic: Mutex<Option<Arc<dyn LogicEngine>>>,
    running: DashMap<u64, CancellationToken>,
}

impl AgentContext {
    fn new(name: AgentName, name_client: Arc<NameClient>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            name: name.into_inner(),
            name_client,
            cells: DashMap::new(),
            functions: FunctionMap::with_standard_types(),
            links: DashMap::new(),
            logic: Mutex::new(None),
            running: DashMap::new(),
        })
    }

    /// Context with no live network behind it; local evaluation still works.
    pub fn detached(name: &str) -> Arc<Self> {
        Self::new(
            AgentName::literal(name),
            Arc::new(NameClient::new(
                "127.0.0.1:9".parse().expect("static address"),
            )),
        )
    }

    fn arc(&self) -> Arc<AgentContext> {
        self.weak.upgrade().expect("agent context still referenced")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn functions(&self) -> &FunctionMap {
        &self.functions
    }

    pub fn set_logic(&self, engine: Arc<dyn LogicEngine>) {
        *self.logic.lock().expect("logic slot poisoned") = Some(engine);
    }

    pub fn logic(&self) -> Option<Arc<dyn LogicEngine>> {
        self.logic.lock().expect("logic slot poisoned").clone()
    }

    /// Exports a plain variable: the value only changes when the owner
    /// writes it.
    pub fn export(&self, name: impl Into<String>, value: Value) {
        self.cells.insert(name.into(), Cell::constant(value));
    }

    /// Exports a variable kept fresh through a source under a policy.
    pub fn export_with_source(
        &self,
        name: impl Into<String>,
        value: Value,
        refresh: Refresh,
        source: Source,
    ) {
        self.cells
            .insert(name.into(), Cell::with_source(value, refresh, source));
    }

    /// Snapshot of a cell's value; unknown names are invalid arguments.
    pub fn read_cell(&self, var: &str) -> Result<Value, ExecError> {
        self.cells
            .get(var)
            .map(|c| c.value.clone())
            .ok_or_else(|| ExecError::InvalidArgument(format!("unknown variable {var}")))
    }

    pub fn try_read_cell(&self, var: &str) -> Option<Value> {
        self.cells.get(var).map(|c| c.value.clone())
    }

    /// Writes a cell, enforcing its type tag.
    pub fn write_cell(&self, var: &str, value: Value) -> Result<(), ExecError> {
        let mut cell = self
            .cells
            .get_mut(var)
            .ok_or_else(|| ExecError::InvalidArgument(format!("unknown variable {var}")))?;
        if value.tag() != cell.tag {
            return Err(ExecError::InvalidArgument(format!(
                "variable {var} holds {}, not {}",
                cell.tag,
                value.tag()
            )));
        }
        cell.value = value;
        cell.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Refreshes one cell through its source if its policy says so.
    /// Unknown cells report `NotFound` (the updater's contract).
    pub async fn refresh_cell(&self, var: &str) -> Result<(), ExecError> {
        let source = {
            let cell = self
                .cells
                .get(var)
                .ok_or_else(|| ExecError::NotFound(var.to_string()))?;
            if !cell.needs_refresh(Instant::now()) {
                return Ok(());
            }
            cell.source.clone().expect("needs_refresh implies a source")
        };
        let value = match source {
            Source::Remote { agent, var: rvar } => self.proxy().get(&agent, &rvar).await?,
            Source::Computed(compute) => compute()?,
        };
        let mut cell = self
            .cells
            .get_mut(var)
            .ok_or_else(|| ExecError::NotFound(var.to_string()))?;
        if value.tag() != cell.tag {
            return Err(ExecError::InvalidArgument(format!(
                "refresh of {var} produced {}, expected {}",
                value.tag(),
                cell.tag
            )));
        }
        cell.value = value;
        cell.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Link to a peer, resolved through the name server and cached.
    pub async fn peer(&self, name: &str) -> Result<Arc<PeerLink>, ExecError> {
        if let Some(link) = self.links.get(name) {
            return Ok(link.clone());
        }
        let endpoints = self.name_client.resolve(name).await?;
        let link = Arc::new(PeerLink::new(name, endpoints));
        self.links.insert(name.to_string(), link.clone());
        Ok(link)
    }

    pub fn proxy(&self) -> RemoteProxy {
        RemoteProxy::new(self.arc())
    }

    /// Drops the cached link to a peer and, when the peer turns out to be
    /// really gone, reports its death so the registry can forget it.
    pub fn report_peer_failure(&self, name: &str) {
        self.links.remove(name);
        let ctx = self.arc();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Ok(endpoints) = ctx.name_client.resolve(&name).await {
                for ep in &endpoints {
                    if TcpStream::connect(ep).await.is_ok() {
                        return;
                    }
                }
                debug!(peer = %name, "peer unreachable, informing registry");
                let _ = ctx.name_client.remove(&name).await;
            }
        });
    }

    /// Best-effort forward to the system logger agent, when one is
    /// registered.
    pub async fn send_log(&self, msg: impl Into<String>) {
        if let Ok(link) = self.peer("logger").await {
            let _ = link
                .send(Message::LogMsg {
                    date: Utc::now(),
                    src: self.name().to_string(),
                    msg: msg.into(),
                })
                .await;
        }
    }
}

/// Agent startup parameters.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: AgentName,
    pub nameserver: SocketAddr,
    pub ping_period: Duration,
}

impl AgentConfig {
    pub fn new(name: AgentName, nameserver: SocketAddr) -> Self {
        Self {
            name,
            nameserver,
            ping_period: DEFAULT_PING_PERIOD,
        }
    }
}

/// A running agent process: context, server and ping task.
pub struct Agent {
    ctx: Arc<AgentContext>,
    server: Server,
    ping: PingTask,
}

impl Agent {
    /// Registers with the name server, opens the server on the assigned
    /// endpoint and starts pinging.
    #[instrument(skip(config), fields(agent = %config.name))]
    pub async fn start(config: AgentConfig) -> Result<Self, ExecError> {
        let name_client = Arc::new(NameClient::new(config.nameserver));
        let assigned = name_client.register(&config.name, vec![]).await?;

        let ctx = AgentContext::new(config.name.clone(), name_client.clone());
        let dispatcher = Arc::new(AgentDispatcher { ctx: ctx.clone() });

        let server = match Server::bind(assigned, dispatcher.clone()).await {
            Ok(server) => server,
            Err(e) => {
                // The allocated port was taken by someone else; bind wherever
                // we can and re-register (last-writer-wins).
                debug!(%assigned, error = %e, "assigned endpoint unavailable, rebinding");
                let fallback = SocketAddr::new(assigned.ip(), 0);
                let server = Server::bind(fallback, dispatcher)
                    .await
                    .map_err(ExecError::transport)?;
                name_client
                    .register(&config.name, vec![server.local_addr()])
                    .await?;
                server
            }
        };

        let ping = PingTask::spawn(
            name_client,
            config.name.to_string(),
            config.ping_period,
        );
        info!(addr = %server.local_addr(), "agent started");
        Ok(Self { ctx, server, ping })
    }

    pub fn ctx(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn export(&self, name: impl Into<String>, value: Value) {
        self.ctx.export(name, value);
    }

    pub fn read(&self, var: &str) -> Result<Value, ExecError> {
        self.ctx.read_cell(var)
    }

    /// The owner sets a variable between recipe steps.
    pub fn set(&self, var: &str, value: Value) -> Result<(), ExecError> {
        self.ctx.write_cell(var, value)
    }

    pub fn set_logic(&self, engine: Arc<dyn LogicEngine>) {
        self.ctx.set_logic(engine);
    }

    /// Stops the ping task and the server, then joins both.
    pub async fn shutdown(self) {
        info!(agent = %self.ctx.name(), "shutting down");
        self.ping.stop().await;
        self.server.stop().await;
    }
}

struct AgentDispatcher {
    ctx: Arc<AgentContext>,
}

#[async_trait]
impl Dispatcher for AgentDispatcher {
    async fn dispatch(&self, msg: Message, reply: &ReplyHandle) {
        match msg {
            Message::RequestVariableValue { id, src, var } => {
                let value = self.ctx.try_read_cell(&var);
                if value.is_none() {
                    debug!(%src, %var, "unknown variable requested");
                }
                reply.send(Message::VariableValue { id, var, value });
            }
            Message::RequestConstraint {
                id,
                src,
                constraint,
                repeat,
                unify,
            } => {
                reply.send(Message::RequestConstraintAck { id });
                tokio::spawn(serve_constraint(
                    self.ctx.clone(),
                    reply.clone(),
                    id,
                    src,
                    constraint,
                    repeat,
                    unify,
                ));
            }
            Message::Abort { src, id } => match self.ctx.running.get(&id) {
                Some(cancel) => {
                    debug!(%src, id, "abort requested");
                    cancel.cancel();
                }
                None => debug!(%src, id, "abort for unknown constraint"),
            },
            other => {
                debug!(kind = other.kind(), "ignoring frame");
            }
        }
    }
}

#[instrument(
    skip_all,
    fields(agent = %ctx.name(), id = id, src = %src, constraint = %constraint, repeat = repeat)
)]
async fn serve_constraint(
    ctx: Arc<AgentContext>,
    reply: ReplyHandle,
    id: u64,
    src: String,
    constraint: Expr,
    repeat: bool,
    unify: Vec<(Expr, Expr)>,
) {
    let answer = |state: ConstraintState| Message::RequestConstraintAnswer {
        id,
        state,
        payload: None,
    };

    let Some(logic) = ctx.logic() else {
        warn!("constraint received but no logic engine installed");
        reply.send(answer(ConstraintState::Failure));
        return;
    };
    for (left, right) in &unify {
        logic.add_fact(Expr::eq(left.clone(), right.clone()), &src);
    }
    let Some(def) = logic.select_recipe(&constraint, &unify) else {
        debug!("no recipe fires for this goal");
        reply.send(answer(ConstraintState::Failure));
        return;
    };
    debug!(recipe = def.name(), "recipe selected");

    let recipe = Arc::new(Recipe::new(def, ctx.clone()));
    let cancel = CancellationToken::new();
    ctx.running.insert(id, cancel.clone());

    // Relay an incoming abort frame to the recipe, whenever it arrives.
    let abort_watch = {
        let recipe = recipe.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            recipe.abort();
        })
    };

    let state = drive_constraint(&ctx, &recipe, &cancel, &reply, &answer, &constraint, repeat).await;
    reply.send(answer(state));

    abort_watch.abort();
    ctx.running.remove(&id);
}

/// Achieves the constraint (retrying while preconditions are transiently
/// unsatisfied, with the temporary-failure protocol towards the caller) and,
/// for `repeat` requests, maintains it until aborted.
async fn drive_constraint(
    ctx: &Arc<AgentContext>,
    recipe: &Arc<Recipe>,
    cancel: &CancellationToken,
    reply: &ReplyHandle,
    answer: &impl Fn(ConstraintState) -> Message,
    constraint: &Expr,
    repeat: bool,
) -> ConstraintState {
    let mut announced_temp = false;
    loop {
        if cancel.is_cancelled() {
            return ConstraintState::Interrupted;
        }
        match recipe.execute().await {
            Ok(_) => {
                if announced_temp {
                    reply.send(answer(ConstraintState::RunAgain));
                }
                break;
            }
            Err(failure) if failure.was_interrupted() => return ConstraintState::Interrupted,
            Err(failure) if !failure.unsatisfied.is_empty() => {
                // Cannot fire now, may fire later: pause the caller instead
                // of failing it.
                if !announced_temp {
                    reply.send(answer(ConstraintState::TempFail));
                    announced_temp = true;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return ConstraintState::Interrupted,
                    _ = sleep(SERVE_POLL_PERIOD) => {}
                }
            }
            Err(failure) => {
                debug!(error = %failure, "recipe failed");
                return ConstraintState::Failure;
            }
        }
    }

    if !repeat {
        return ConstraintState::Success;
    }

    // Achieved-and-maintained: report success, then watch the constraint.
    reply.send(answer(ConstraintState::Success));
    let mut broken = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return ConstraintState::Interrupted,
            _ = sleep(SERVE_POLL_PERIOD) => {}
        }
        match eval_bool(ctx, constraint).await {
            Ok(true) => {
                if broken {
                    reply.send(answer(ConstraintState::RunAgain));
                    broken = false;
                }
            }
            Ok(false) => {
                if !broken {
                    debug!("maintained constraint broke");
                    reply.send(answer(ConstraintState::TempFail));
                    broken = true;
                }
                match recipe.execute().await {
                    Ok(_) => {
                        reply.send(answer(ConstraintState::RunAgain));
                        broken = false;
                    }
                    Err(failure) if failure.was_interrupted() => {
                        return ConstraintState::Interrupted;
                    }
                    Err(failure) if !failure.unsatisfied.is_empty() => {
                        // Keep waiting for the preconditions to come back.
                    }
                    Err(_) => return ConstraintState::Failure,
                }
            }
            // Not locally evaluable: nothing to watch, just hold the
            // constraint open until the caller lets go.
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_enforce_their_type_tag() {
        let ctx = AgentContext::detached("pos");
        ctx.export("x", Value::Int(1));
        assert!(ctx.write_cell("x", Value::Int(2)).is_ok());
        let err = ctx.write_cell("x", Value::Bool(true)).unwrap_err();
        assert!(matches!(err, ExecError::InvalidArgument(_)));
    }

    #[test]
    fn reading_an_unknown_cell_is_invalid_argument() {
        let ctx = AgentContext::detached("pos");
        assert!(matches!(
            ctx.read_cell("ghost"),
            Err(ExecError::InvalidArgument(_))
        ));
        assert_eq!(ctx.try_read_cell("ghost"), None);
    }

    #[tokio::test]
    async fn computed_sources_refresh_on_demand() {
        let ctx = AgentContext::detached("pos");
        let hits = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let source_hits = hits.clone();
        ctx.export_with_source(
            "ticks",
            Value::Int(0),
            Refresh::OnDemand,
            Source::Computed(Arc::new(move || {
                let n = source_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(Value::Int(n))
            })),
        );

        ctx.refresh_cell("ticks").await.unwrap();
        ctx.refresh_cell("ticks").await.unwrap();
        assert_eq!(ctx.read_cell("ticks").unwrap(), Value::Int(2));
    }

    #[tokio::test]
    async fn stale_after_skips_fresh_values() {
        let ctx = AgentContext::detached("pos");
        let hits = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let source_hits = hits.clone();
        ctx.export_with_source(
            "slow",
            Value::Int(0),
            Refresh::StaleAfter(Duration::from_secs(3600)),
            Source::Computed(Arc::new(move || {
                let n = source_hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(Value::Int(n))
            })),
        );

        ctx.refresh_cell("slow").await.unwrap();
        ctx.refresh_cell("slow").await.unwrap();
        // Second refresh found the value fresh enough.
        assert_eq!(ctx.read_cell("slow").unwrap(), Value::Int(1));
    }
}

//! Recipe definitions and the recipe runner.
//!
//! A recipe is a named, abortable procedure: preconditions are evaluated
//! first and stop the run when unsatisfied, then the body sequence is
//! driven, then the optional end handler. Concurrent execute calls queue
//! behind the running one and receive its outcome.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, error, instrument};

use crate::agent::AgentContext;
use crate::conditions::{ConditionEvaluator, ConditionSet};
use crate::error::{ExecError, RuntimeFailure};
use crate::expr::Expr;
use crate::sequence::{Sequence, SequenceCtl};

/// Builds one execution's computation sequence. Called once per run so a
/// recipe can be executed repeatedly.
pub type BodyBuilder = Box<dyn Fn(&Arc<AgentContext>) -> Sequence + Send + Sync>;

/// Static description of a recipe, produced by generated agent code.
pub struct RecipeDef {
    name: String,
    expected_error: Option<Expr>,
    required_agents: Vec<String>,
    constraint_domain: Vec<Expr>,
    preconditions: ConditionSet,
    body: BodyBuilder,
    end_handler: Option<BodyBuilder>,
}

impl RecipeDef {
    pub fn new(name: impl Into<String>, body: BodyBuilder) -> Self {
        Self {
            name: name.into(),
            expected_error: None,
            required_agents: Vec::new(),
            constraint_domain: Vec::new(),
            preconditions: ConditionSet::empty(),
            body,
            end_handler: None,
        }
    }

    pub fn with_preconditions(mut self, preconditions: ConditionSet) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn with_end_handler(mut self, handler: BodyBuilder) -> Self {
        self.end_handler = Some(handler);
        self
    }

    pub fn with_expected_error(mut self, expr: Expr) -> Self {
        self.expected_error = Some(expr);
        self
    }

    pub fn with_required_agents(mut self, agents: Vec<String>) -> Self {
        self.required_agents = agents;
        self
    }

    pub fn with_constraint_domain(mut self, domain: Vec<Expr>) -> Self {
        self.constraint_domain = domain;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected_error(&self) -> Option<&Expr> {
        self.expected_error.as_ref()
    }

    pub fn required_agents(&self) -> &[String] {
        &self.required_agents
    }

    pub fn constraint_domain(&self) -> &[Expr] {
        &self.constraint_domain
    }

    pub fn nb_preconditions(&self) -> usize {
        self.preconditions.len()
    }

    pub fn has_end_handler(&self) -> bool {
        self.end_handler.is_some()
    }
}

/// Lifecycle of a recipe instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeState {
    Idle,
    Running,
    Paused,
    Ended,
}

/// What a successful execution reports back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeReport {
    pub end_handler_ran: bool,
    /// An end-handler error does not undo the body's success; it is
    /// reported separately here (and logged).
    pub end_handler_error: Option<ExecError>,
}

pub type RecipeOutcome = Result<RecipeReport, RuntimeFailure>;

struct RecipeShared {
    state: RecipeState,
    ctl: Option<SequenceCtl>,
    waiters: Vec<oneshot::Sender<RecipeOutcome>>,
}

/// A recipe definition bound to one agent, ready to run.
pub struct Recipe {
    def: Arc<RecipeDef>,
    ctx: Arc<AgentContext>,
    preconditions: ConditionEvaluator,
    shared: Arc<Mutex<RecipeShared>>,
}

impl Recipe {
    pub fn new(def: Arc<RecipeDef>, ctx: Arc<AgentContext>) -> Self {
        let preconditions = ConditionEvaluator::new(def.preconditions.clone());
        Self {
            def,
            ctx,
            preconditions,
            shared: Arc::new(Mutex::new(RecipeShared {
                state: RecipeState::Idle,
                ctl: None,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn state(&self) -> RecipeState {
        self.shared.lock().expect("recipe state poisoned").state
    }

    /// Runs the recipe. When an execution is already in progress the call
    /// queues behind it and receives that execution's outcome.
    #[instrument(skip(self), fields(recipe = %self.def.name()))]
    pub async fn execute(&self) -> RecipeOutcome {
        let queued = {
            let mut shared = self.shared.lock().expect("recipe state poisoned");
            match shared.state {
                RecipeState::Running | RecipeState::Paused => {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.push(tx);
                    Some(rx)
                }
                RecipeState::Idle | RecipeState::Ended => {
                    shared.state = RecipeState::Running;
                    None
                }
            }
        };
        if let Some(rx) = queued {
            debug!("execution in progress, queueing");
            return rx.await.unwrap_or_else(|_| {
                Err(RuntimeFailure::new(ExecError::ExecutionFailed(
                    "recipe execution dropped".to_string(),
                )))
            });
        }

        let outcome = self.run_once().await;

        let waiters = {
            let mut shared = self.shared.lock().expect("recipe state poisoned");
            shared.state = RecipeState::Idle;
            shared.ctl = None;
            std::mem::take(&mut shared.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    async fn run_once(&self) -> RecipeOutcome {
        let unsatisfied = self
            .preconditions
            .unsatisfied(&self.ctx)
            .await
            .map_err(|e| RuntimeFailure::new(e.at_sequence_boundary()))?;
        if !unsatisfied.is_empty() {
            debug!(count = unsatisfied.len(), "preconditions unsatisfied");
            return Err(RuntimeFailure::preconditions(unsatisfied));
        }

        let mut body = (self.def.body)(&self.ctx);
        {
            let mut shared = self.shared.lock().expect("recipe state poisoned");
            if shared.state == RecipeState::Paused {
                body.pause_at_start();
            }
            shared.ctl = Some(body.handle());
        }
        let result = body.run().await;
        self.shared.lock().expect("recipe state poisoned").ctl = None;

        if let Err(e) = result {
            return Err(RuntimeFailure::blaming(
                e.at_sequence_boundary(),
                body.blame(),
            ));
        }

        let mut report = RecipeReport::default();
        if let Some(build_end) = &self.def.end_handler {
            let mut end = build_end(&self.ctx);
            report.end_handler_ran = true;
            if let Err(e) = end.run().await {
                error!(recipe = %self.def.name(), error = %e, "end handler failed");
                report.end_handler_error = Some(e.at_sequence_boundary());
            }
        }
        {
            let mut shared = self.shared.lock().expect("recipe state poisoned");
            shared.state = RecipeState::Ended;
        }
        Ok(report)
    }

    pub fn pause(&self) {
        let mut shared = self.shared.lock().expect("recipe state poisoned");
        if shared.state == RecipeState::Running {
            shared.state = RecipeState::Paused;
            if let Some(ctl) = &shared.ctl {
                ctl.pause();
            }
        }
    }

    pub fn resume(&self) {
        let mut shared = self.shared.lock().expect("recipe state poisoned");
        if shared.state == RecipeState::Paused {
            shared.state = RecipeState::Running;
            if let Some(ctl) = &shared.ctl {
                ctl.resume();
            }
        }
    }

    /// Interrupts the current execution, if any.
    pub fn abort(&self) {
        let shared = self.shared.lock().expect("recipe state poisoned");
        if let Some(ctl) = &shared.ctl {
            ctl.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::primitives::ComputeExpr;
    use crate::value::Value;

    fn pos_ctx() -> Arc<AgentContext> {
        let ctx = AgentContext::detached("pos");
        ctx.export("x", Value::Int(42));
        ctx.export("y", Value::Int(3));
        ctx.export("z", Value::Int(0));
        ctx.export("end_handler_called", Value::Bool(false));
        ctx
    }

    fn assign(dest: &'static str, expr: Expr) -> BodyBuilder {
        Box::new(move |ctx| {
            let mut seq = Sequence::new();
            seq.push(Box::new(ComputeExpr::new(ctx.clone(), dest, expr.clone())));
            seq
        })
    }

    #[tokio::test]
    async fn add_recipe_runs_without_end_handler() {
        let ctx = pos_ctx();
        let def = Arc::new(RecipeDef::new(
            "add",
            assign("z", Expr::add(Expr::var("x"), Expr::var("y"))),
        ));
        let recipe = Recipe::new(def, ctx.clone());

        let report = recipe.execute().await.unwrap();
        assert_eq!(ctx.read_cell("z").unwrap(), Value::Int(45));
        assert!(!report.end_handler_ran);
    }

    #[tokio::test]
    async fn mult_recipe_runs_its_end_handler_once() {
        let ctx = pos_ctx();
        let def = Arc::new(
            RecipeDef::new(
                "mult",
                assign("z", Expr::mul(Expr::var("x"), Expr::var("y"))),
            )
            .with_end_handler(assign("end_handler_called", Expr::bool(true))),
        );
        let recipe = Recipe::new(def, ctx.clone());

        let report = recipe.execute().await.unwrap();
        assert_eq!(ctx.read_cell("z").unwrap(), Value::Int(126));
        assert!(report.end_handler_ran);
        assert!(report.end_handler_error.is_none());
        assert_eq!(
            ctx.read_cell("end_handler_called").unwrap(),
            Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn unsatisfied_preconditions_stop_the_run_and_carry_the_list() {
        let ctx = pos_ctx();
        ctx.export("ready", Value::Bool(false));
        let precondition = Expr::var("ready");
        let def = Arc::new(
            RecipeDef::new("guarded", assign("z", Expr::int(1)))
                .with_preconditions(ConditionSet::new(vec![precondition.clone()])),
        );
        let recipe = Recipe::new(def, ctx.clone());

        let failure = recipe.execute().await.unwrap_err();
        assert_eq!(failure.unsatisfied, vec![precondition]);
        // Body never ran.
        assert_eq!(ctx.read_cell("z").unwrap(), Value::Int(0));
    }

    #[tokio::test]
    async fn body_failure_is_blamed_on_the_offending_expression() {
        let ctx = pos_ctx();
        let def = Arc::new(RecipeDef::new(
            "crash",
            assign("z", Expr::div(Expr::var("x"), Expr::int(0))),
        ));
        let recipe = Recipe::new(def, ctx);

        let failure = recipe.execute().await.unwrap_err();
        assert!(matches!(failure.error, ExecError::InvalidArgument(_)));
        assert!(failure.blamed.is_some());
    }

    #[tokio::test]
    async fn end_handler_errors_are_reported_separately() {
        let ctx = pos_ctx();
        let def = Arc::new(
            RecipeDef::new("half", assign("z", Expr::int(9)))
                .with_end_handler(assign("z", Expr::div(Expr::int(1), Expr::int(0)))),
        );
        let recipe = Recipe::new(def, ctx.clone());

        // The body's success stands even though the handler failed.
        let report = recipe.execute().await.unwrap();
        assert!(report.end_handler_ran);
        assert!(matches!(
            report.end_handler_error,
            Some(ExecError::InvalidArgument(_))
        ));
        assert_eq!(ctx.read_cell("z").unwrap(), Value::Int(9));
    }
}

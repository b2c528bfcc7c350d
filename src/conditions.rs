//! Parallel evaluation of precondition sets.
//!
//! All declared inputs (local cells and remote variables) are refreshed
//! through the updater first, then every predicate is evaluated in
//! parallel. The result is the list of predicates that did not hold. A
//! second evaluation requested while one is in flight does not start over:
//! the ongoing run serves every waiter at once.

use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use tokio::sync::oneshot;

use crate::agent::AgentContext;
use crate::error::ExecError;
use crate::eval::eval_bool;
use crate::expr::Expr;
use crate::proxy::RemoteVar;
use crate::updater;

/// Declared inputs and predicates of one precondition set.
#[derive(Clone, Default)]
pub struct ConditionSet {
    pub conditions: Vec<Expr>,
    /// Local cells to refresh before evaluating.
    pub locals: Vec<String>,
    /// Remote variables to fetch before evaluating.
    pub remotes: Vec<RemoteVar>,
}

impl ConditionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(conditions: Vec<Expr>) -> Self {
        Self {
            conditions,
            locals: Vec::new(),
            remotes: Vec::new(),
        }
    }

    pub fn with_locals(mut self, locals: Vec<String>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_remotes(mut self, remotes: Vec<RemoteVar>) -> Self {
        self.remotes = remotes;
        self
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

type CondResult = Result<Vec<Expr>, ExecError>;

struct CondState {
    computing: bool,
    waiters: Vec<oneshot::Sender<CondResult>>,
}

/// Re-entrant evaluator over one condition set.
pub struct ConditionEvaluator {
    set: Arc<ConditionSet>,
    state: Arc<Mutex<CondState>>,
}

impl ConditionEvaluator {
    pub fn new(set: ConditionSet) -> Self {
        Self {
            set: Arc::new(set),
            state: Arc::new(Mutex::new(CondState {
                computing: false,
                waiters: Vec::new(),
            })),
        }
    }

    pub fn set(&self) -> &ConditionSet {
        &self.set
    }

    /// Evaluates the set and returns the expressions of unsatisfied
    /// predicates. Coalesces onto an in-flight evaluation when one exists.
    pub async fn unsatisfied(&self, ctx: &Arc<AgentContext>) -> CondResult {
        let (rx, runner) = {
            let mut st = self.state.lock().expect("condition state poisoned");
            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);
            if st.computing {
                (rx, false)
            } else {
                st.computing = true;
                (rx, true)
            }
        };

        if runner {
            let result = Self::evaluate(ctx, &self.set).await;
            let waiters = {
                let mut st = self.state.lock().expect("condition state poisoned");
                st.computing = false;
                std::mem::take(&mut st.waiters)
            };
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
        rx.await
            .map_err(|_| ExecError::ExecutionFailed("condition evaluation dropped".to_string()))?
    }

    async fn evaluate(ctx: &Arc<AgentContext>, set: &ConditionSet) -> CondResult {
        // One refresh failure cancels the whole evaluation with that error.
        updater::update(ctx, &set.locals, &set.remotes).await?;
        if set.conditions.is_empty() {
            return Ok(Vec::new());
        }
        let flags = try_join_all(set.conditions.iter().map(|c| eval_bool(ctx, c))).await?;
        Ok(set
            .conditions
            .iter()
            .zip(flags)
            .filter_map(|(c, ok)| (!ok).then(|| c.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[tokio::test]
    async fn zero_preconditions_complete_with_an_empty_list() {
        let ctx = AgentContext::detached("pos");
        let eval = ConditionEvaluator::new(ConditionSet::empty());
        assert_eq!(eval.unsatisfied(&ctx).await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn unsatisfied_predicates_are_returned_verbatim() {
        let ctx = AgentContext::detached("pos");
        ctx.export("x", Value::Int(42));
        ctx.export("ready", Value::Bool(false));

        let holds = Expr::eq(Expr::var("x"), Expr::int(42));
        let fails = Expr::var("ready");
        let eval = ConditionEvaluator::new(ConditionSet::new(vec![
            holds.clone(),
            fails.clone(),
        ]));

        let unsat = eval.unsatisfied(&ctx).await.unwrap();
        assert_eq!(unsat, vec![fails]);
    }

    #[tokio::test]
    async fn refresh_failure_cancels_the_evaluation() {
        let ctx = AgentContext::detached("pos");
        let set = ConditionSet::new(vec![Expr::bool(true)])
            .with_locals(vec!["missing".to_string()]);
        let eval = ConditionEvaluator::new(set);

        let err = eval.unsatisfied(&ctx).await.unwrap_err();
        assert_eq!(err, ExecError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_evaluation() {
        let ctx = AgentContext::detached("pos");
        ctx.export("ready", Value::Bool(true));
        let eval = Arc::new(ConditionEvaluator::new(ConditionSet::new(vec![Expr::var(
            "ready",
        )])));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let eval = eval.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move { eval.unsatisfied(&ctx).await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(Vec::new()));
        }
    }
}

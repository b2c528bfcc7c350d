//! Concrete primitives: evaluate, wait, make, ensure, abort.
//!
//! `ComputeExpr` and `WaitExpr` are local and built on [`AbortableFn`];
//! the constraint primitives talk to a peer and implement the contract
//! directly because their abort is a wire frame, not an I/O cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::AgentContext;
use crate::error::ExecError;
use crate::eval::{async_eval, eval_bool};
use crate::expr::Expr;
use crate::primitive::{AbortableFn, Done, ExecFn, Primitive};
use crate::wire::{ConstraintState, Message};

/// Polling period of [`WaitExpr`].
pub const WAIT_POLL_PERIOD: Duration = Duration::from_millis(50);

/// Identifier of a constraint held on a peer, written back by
/// [`EnsureConstraint`] so the holder can later be told to let go.
pub type ConstraintHold = Arc<Mutex<Option<(String, u64)>>>;

pub fn new_hold() -> ConstraintHold {
    Arc::new(Mutex::new(None))
}

/// Evaluates an expression and writes the result into a local cell.
/// An empty result is an invalid-argument error.
pub struct ComputeExpr {
    inner: AbortableFn,
}

impl ComputeExpr {
    pub fn new(ctx: Arc<AgentContext>, dest: impl Into<String>, expr: Expr) -> Self {
        let dest = dest.into();
        let blame = Expr::eq(Expr::var(&dest), expr.clone());
        let exec: ExecFn = Box::new(move |token: CancellationToken| {
            let ctx = ctx.clone();
            let dest = dest.clone();
            let expr = expr.clone();
            Box::pin(async move {
                tokio::select! {
                    _ = token.cancelled() => Err(ExecError::Interrupted),
                    result = async {
                        match async_eval(&ctx, &expr).await? {
                            Some(value) => ctx.write_cell(&dest, value),
                            None => Err(ExecError::InvalidArgument(format!(
                                "{expr} evaluated to empty"
                            ))),
                        }
                    } => result,
                }
            })
        });
        Self {
            inner: AbortableFn::with_blame(exec, blame),
        }
    }
}

impl Primitive for ComputeExpr {
    fn compute(&mut self, done: Done) {
        self.inner.compute(done);
    }

    fn abort(&mut self) -> bool {
        self.inner.abort()
    }

    fn pause(&mut self) {
        self.inner.pause();
    }

    fn resume(&mut self) {
        self.inner.resume();
    }

    fn blame(&self) -> Option<Expr> {
        self.inner.blame()
    }
}

/// Polls a boolean expression until it holds; abortable between polls.
pub struct WaitExpr {
    inner: AbortableFn,
}

impl WaitExpr {
    pub fn new(ctx: Arc<AgentContext>, predicate: Expr) -> Self {
        Self::with_period(ctx, predicate, WAIT_POLL_PERIOD)
    }

    pub fn with_period(ctx: Arc<AgentContext>, predicate: Expr, period: Duration) -> Self {
        let blame = predicate.clone();
        let exec: ExecFn = Box::new(move |token: CancellationToken| {
            let ctx = ctx.clone();
            let predicate = predicate.clone();
            Box::pin(async move {
                loop {
                    if eval_bool(&ctx, &predicate).await? {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = token.cancelled() => return Err(ExecError::Interrupted),
                        _ = sleep(period) => {}
                    }
                }
            })
        });
        Self {
            inner: AbortableFn::with_blame(exec, blame),
        }
    }
}

impl Primitive for WaitExpr {
    fn compute(&mut self, done: Done) {
        self.inner.compute(done);
    }

    fn abort(&mut self) -> bool {
        self.inner.abort()
    }

    fn pause(&mut self) {
        self.inner.pause();
    }

    fn resume(&mut self) {
        self.inner.resume();
    }

    fn blame(&self) -> Option<Expr> {
        self.inner.blame()
    }
}

fn spawn_abort_frame(ctx: Arc<AgentContext>, dst: String, id: u64) {
    tokio::spawn(async move {
        let src = ctx.name().to_string();
        match ctx.peer(&dst).await {
            Ok(link) => {
                if let Err(e) = link.send(Message::Abort { src, id }).await {
                    warn!(peer = %dst, id, error = %e, "abort frame not delivered");
                }
            }
            Err(e) => warn!(peer = %dst, id, error = %e, "abort frame not delivered"),
        }
    });
}

/// Drives the answer stream shared by make and ensure.
///
/// Returns whether the watcher should keep listening after this answer.
fn relay_answer(
    state: ConstraintState,
    id_slot: &Mutex<Option<u64>>,
    done: &Done,
    achieved: &mut bool,
    ensure: bool,
) -> bool {
    match state {
        ConstraintState::Success => {
            if !ensure {
                *id_slot.lock().expect("id slot poisoned") = None;
                done.send(Ok(()));
                return false;
            }
            // Achieved; the peer keeps maintaining it.
            if !*achieved {
                *achieved = true;
                done.send(Ok(()));
            }
            true
        }
        ConstraintState::Failure => {
            *id_slot.lock().expect("id slot poisoned") = None;
            done.send(Err(ExecError::ExecutionKo));
            false
        }
        ConstraintState::Interrupted => {
            *id_slot.lock().expect("id slot poisoned") = None;
            done.send(Err(ExecError::Interrupted));
            false
        }
        ConstraintState::TempFail => {
            done.send(Err(ExecError::TemporaryFailure));
            true
        }
        ConstraintState::RunAgain => {
            done.send(Err(ExecError::RunAgain));
            true
        }
    }
}

/// Sends a one-shot constraint request (`repeat = false`) and completes with
/// the peer's terminal answer. FAILURE maps to `ExecutionKo`.
pub struct MakeConstraint {
    ctx: Arc<AgentContext>,
    dst: String,
    constraint: Expr,
    unify: Vec<(Expr, Expr)>,
    id: Arc<Mutex<Option<u64>>>,
}

impl MakeConstraint {
    pub fn new(
        ctx: Arc<AgentContext>,
        dst: impl Into<String>,
        constraint: Expr,
        unify: Vec<(Expr, Expr)>,
    ) -> Self {
        Self {
            ctx,
            dst: dst.into(),
            constraint,
            unify,
            id: Arc::new(Mutex::new(None)),
        }
    }
}

impl Primitive for MakeConstraint {
    fn compute(&mut self, done: Done) {
        *self.id.lock().expect("id slot poisoned") = None;
        let ctx = self.ctx.clone();
        let dst = self.dst.clone();
        let constraint = self.constraint.clone();
        let unify = self.unify.clone();
        let id_slot = self.id.clone();

        tokio::spawn(async move {
            let link = match ctx.peer(&dst).await {
                Ok(link) => link,
                Err(e) => return done.send(Err(e)),
            };
            let src = ctx.name().to_string();
            let request = link.request(|id| Message::RequestConstraint {
                id,
                src: src.clone(),
                constraint: constraint.clone(),
                repeat: false,
                unify: unify.clone(),
            });
            let mut answers = match request.await {
                Ok(answers) => answers,
                Err(e) => return done.send(Err(e)),
            };
            *id_slot.lock().expect("id slot poisoned") = Some(answers.id());

            let mut achieved = false;
            loop {
                match answers.recv().await {
                    Ok(Message::RequestConstraintAck { .. }) => {}
                    Ok(Message::RequestConstraintAnswer { state, .. }) => {
                        if !relay_answer(state, &id_slot, &done, &mut achieved, false) {
                            return;
                        }
                    }
                    Ok(other) => {
                        warn!(kind = other.kind(), "unexpected constraint answer");
                    }
                    Err(e) => {
                        *id_slot.lock().expect("id slot poisoned") = None;
                        return done.send(Err(e));
                    }
                }
            }
        });
    }

    fn abort(&mut self) -> bool {
        let id = *self.id.lock().expect("id slot poisoned");
        match id {
            Some(id) => {
                spawn_abort_frame(self.ctx.clone(), self.dst.clone(), id);
                true
            }
            None => false,
        }
    }

    fn blame(&self) -> Option<Expr> {
        Some(self.constraint.clone())
    }
}

/// Sends a maintained constraint request (`repeat = true`).
///
/// Completes once the peer first reports the constraint achieved, writing
/// `(peer, id)` into the hold slot so the caller can abort it later. The
/// watcher keeps listening: maintenance breaks surface to the owning
/// sequence as pause/resume signals or as a late failure at this index.
pub struct EnsureConstraint {
    ctx: Arc<AgentContext>,
    dst: String,
    constraint: Expr,
    unify: Vec<(Expr, Expr)>,
    hold: ConstraintHold,
    id: Arc<Mutex<Option<u64>>>,
}

impl EnsureConstraint {
    pub fn new(
        ctx: Arc<AgentContext>,
        dst: impl Into<String>,
        constraint: Expr,
        unify: Vec<(Expr, Expr)>,
        hold: ConstraintHold,
    ) -> Self {
        Self {
            ctx,
            dst: dst.into(),
            constraint,
            unify,
            hold,
            id: Arc::new(Mutex::new(None)),
        }
    }
}

impl Primitive for EnsureConstraint {
    fn compute(&mut self, done: Done) {
        *self.id.lock().expect("id slot poisoned") = None;
        let ctx = self.ctx.clone();
        let dst = self.dst.clone();
        let constraint = self.constraint.clone();
        let unify = self.unify.clone();
        let hold = self.hold.clone();
        let id_slot = self.id.clone();

        tokio::spawn(async move {
            let link = match ctx.peer(&dst).await {
                Ok(link) => link,
                Err(e) => return done.send(Err(e)),
            };
            let src = ctx.name().to_string();
            let request = link.request(|id| Message::RequestConstraint {
                id,
                src: src.clone(),
                constraint: constraint.clone(),
                repeat: true,
                unify: unify.clone(),
            });
            let mut answers = match request.await {
                Ok(answers) => answers,
                Err(e) => return done.send(Err(e)),
            };
            *id_slot.lock().expect("id slot poisoned") = Some(answers.id());
            *hold.lock().expect("hold slot poisoned") = Some((dst.clone(), answers.id()));

            let mut achieved = false;
            loop {
                match answers.recv().await {
                    Ok(Message::RequestConstraintAck { .. }) => {}
                    Ok(Message::RequestConstraintAnswer { state, .. }) => {
                        if !relay_answer(state, &id_slot, &done, &mut achieved, true) {
                            return;
                        }
                    }
                    Ok(other) => {
                        warn!(kind = other.kind(), "unexpected constraint answer");
                    }
                    Err(e) => {
                        *id_slot.lock().expect("id slot poisoned") = None;
                        return done.send(Err(e));
                    }
                }
            }
        });
    }

    fn abort(&mut self) -> bool {
        let id = *self.id.lock().expect("id slot poisoned");
        match id {
            Some(id) => {
                spawn_abort_frame(self.ctx.clone(), self.dst.clone(), id);
                true
            }
            None => false,
        }
    }

    fn blame(&self) -> Option<Expr> {
        Some(self.constraint.clone())
    }
}

/// Tells a peer to drop a previously ensured constraint. Always succeeds
/// locally; the interrupted answer lands on the ensure's subscription.
pub struct AbortConstraint {
    ctx: Arc<AgentContext>,
    target: ConstraintHold,
}

impl AbortConstraint {
    pub fn new(ctx: Arc<AgentContext>, target: ConstraintHold) -> Self {
        Self { ctx, target }
    }
}

impl Primitive for AbortConstraint {
    fn compute(&mut self, done: Done) {
        let target = self.target.lock().expect("hold slot poisoned").clone();
        if let Some((dst, id)) = target {
            spawn_abort_frame(self.ctx.clone(), dst, id);
        }
        done.send(Ok(()));
    }

    fn abort(&mut self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use tokio::sync::mpsc;

    fn done_channel() -> (
        Done,
        mpsc::UnboundedReceiver<(usize, Result<(), ExecError>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Done::new(0, tx), rx)
    }

    #[tokio::test]
    async fn compute_expr_writes_the_destination_cell() {
        let ctx = AgentContext::detached("pos");
        ctx.export("x", Value::Int(42));
        ctx.export("y", Value::Int(3));
        ctx.export("z", Value::Int(0));

        let (done, mut rx) = done_channel();
        let mut p = ComputeExpr::new(ctx.clone(), "z", Expr::add(Expr::var("x"), Expr::var("y")));
        p.compute(done);
        assert_eq!(rx.recv().await.unwrap().1, Ok(()));
        assert_eq!(ctx.read_cell("z").unwrap(), Value::Int(45));
    }

    #[tokio::test]
    async fn compute_expr_type_mismatch_is_invalid_argument() {
        let ctx = AgentContext::detached("pos");
        ctx.export("z", Value::Int(0));

        let (done, mut rx) = done_channel();
        let mut p = ComputeExpr::new(ctx, "z", Expr::bool(true));
        p.compute(done);
        let (_, out) = rx.recv().await.unwrap();
        assert!(matches!(out, Err(ExecError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn wait_expr_completes_once_predicate_holds() {
        let ctx = AgentContext::detached("pos");
        ctx.export("flag", Value::Bool(false));

        let (done, mut rx) = done_channel();
        let mut p = WaitExpr::with_period(
            ctx.clone(),
            Expr::var("flag"),
            Duration::from_millis(5),
        );
        p.compute(done);

        // Not yet satisfied.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), rx.recv())
                .await
                .is_err()
        );
        ctx.write_cell("flag", Value::Bool(true)).unwrap();
        let (_, out) = rx.recv().await.unwrap();
        assert_eq!(out, Ok(()));
    }

    #[tokio::test]
    async fn wait_expr_aborts_between_polls() {
        let ctx = AgentContext::detached("pos");
        ctx.export("flag", Value::Bool(false));

        let (done, mut rx) = done_channel();
        let mut p = WaitExpr::new(ctx, Expr::var("flag"));
        p.compute(done);
        assert!(p.abort());
        let (_, out) = rx.recv().await.unwrap();
        assert_eq!(out, Err(ExecError::Interrupted));
    }

    #[tokio::test]
    async fn abort_constraint_without_target_succeeds() {
        let ctx = AgentContext::detached("pos");
        let (done, mut rx) = done_channel();
        let mut p = AbortConstraint::new(ctx, new_hold());
        p.compute(done);
        assert_eq!(rx.recv().await.unwrap().1, Ok(()));
    }
}

//! Abortable primitives: the smallest schedulable unit of a computation.
//!
//! A primitive's `compute` dispatches work and returns immediately; the
//! outcome is delivered later through a [`Done`] sender. `abort` requests
//! cooperative interruption, `pause` cancels the outstanding I/O without
//! surfacing an error, and `resume` re-issues the work. Exactly one terminal
//! completion (ok, interrupted or a domain error) is delivered per compute;
//! the pause/resume signals `TemporaryFailure` and `RunAgain` may precede it.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::expr::Expr;

/// Completion channel of one primitive inside a sequence. Cloneable because
/// a primitive may emit pause/resume signals before its terminal outcome.
#[derive(Clone)]
pub struct Done {
    idx: usize,
    tx: mpsc::UnboundedSender<(usize, Result<(), ExecError>)>,
}

impl Done {
    pub fn new(idx: usize, tx: mpsc::UnboundedSender<(usize, Result<(), ExecError>)>) -> Self {
        Self { idx, tx }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Delivers an outcome; silently dropped once the sequence is gone.
    pub fn send(&self, outcome: Result<(), ExecError>) {
        let _ = self.tx.send((self.idx, outcome));
    }
}

/// The abortable-unit contract shared by every concrete primitive.
pub trait Primitive: Send {
    /// Starts the work. Must return without blocking; the outcome arrives
    /// on `done`.
    fn compute(&mut self, done: Done);

    /// Requests interruption. Returns true when an interruption is now in
    /// progress (the primitive was running), false otherwise.
    fn abort(&mut self) -> bool;

    /// Suspends by cancelling outstanding I/O without reporting anything.
    /// A no-op on primitives that already terminated.
    fn pause(&mut self) {}

    /// Re-issues the work after a pause. A no-op on terminated primitives.
    fn resume(&mut self) {}

    /// Expression reported to the caller when this primitive fails.
    fn blame(&self) -> Option<Expr> {
        None
    }
}

#[derive(Default)]
struct Flags {
    running: bool,
    must_interrupt: bool,
    must_pause: bool,
}

/// Type of the re-invocable job closure backing an [`AbortableFn`].
///
/// Each invocation receives a fresh cancellation token; the future must
/// observe it and resolve to `Err(Interrupted)` once cancelled.
pub type ExecFn =
    Box<dyn FnMut(CancellationToken) -> BoxFuture<'static, Result<(), ExecError>> + Send>;

/// Closure-backed primitive with the standard pause/interrupt bookkeeping.
///
/// The completion handler applies the flag protocol: an interrupt request
/// turns the outcome into `Interrupted`, a pause swallows the outcome
/// entirely (the job is re-launched by `resume`), otherwise the outcome
/// passes through.
pub struct AbortableFn {
    exec: ExecFn,
    blame: Option<Expr>,
    flags: Arc<Mutex<Flags>>,
    cancel: CancellationToken,
    done: Option<Done>,
}

impl AbortableFn {
    pub fn new(exec: ExecFn) -> Self {
        Self {
            exec,
            blame: None,
            flags: Arc::new(Mutex::new(Flags::default())),
            cancel: CancellationToken::new(),
            done: None,
        }
    }

    pub fn with_blame(exec: ExecFn, blame: Expr) -> Self {
        let mut this = Self::new(exec);
        this.blame = Some(blame);
        this
    }

    fn launch(&mut self, done: Done) {
        let token = CancellationToken::new();
        self.cancel = token.clone();
        let fut = (self.exec)(token);
        let flags = self.flags.clone();
        tokio::spawn(async move {
            let outcome = fut.await;
            let deliver = {
                let mut st = flags.lock().expect("primitive flags poisoned");
                if st.must_interrupt {
                    st.running = false;
                    Some(Err(ExecError::Interrupted))
                } else if st.must_pause {
                    // Swallowed: resume re-launches with the stored callback.
                    None
                } else {
                    st.running = false;
                    Some(outcome)
                }
            };
            if let Some(outcome) = deliver {
                done.send(outcome);
            }
        });
    }
}

impl Primitive for AbortableFn {
    fn compute(&mut self, done: Done) {
        self.done = Some(done.clone());
        let paused = {
            let mut st = self.flags.lock().expect("primitive flags poisoned");
            st.must_interrupt = false;
            st.running = true;
            st.must_pause
        };
        if !paused {
            self.launch(done);
        }
    }

    fn abort(&mut self) -> bool {
        let mut st = self.flags.lock().expect("primitive flags poisoned");
        st.must_interrupt = true;
        if st.running {
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    fn pause(&mut self) {
        let mut st = self.flags.lock().expect("primitive flags poisoned");
        st.must_pause = true;
        if st.running {
            self.cancel.cancel();
        }
    }

    fn resume(&mut self) {
        let running = {
            let mut st = self.flags.lock().expect("primitive flags poisoned");
            st.must_pause = false;
            st.running
        };
        if running {
            if let Some(done) = self.done.clone() {
                self.launch(done);
            }
        }
    }

    fn blame(&self) -> Option<Expr> {
        self.blame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn channel() -> (
        mpsc::UnboundedSender<(usize, Result<(), ExecError>)>,
        mpsc::UnboundedReceiver<(usize, Result<(), ExecError>)>,
    ) {
        mpsc::unbounded_channel()
    }

    fn sleeper(duration: Duration) -> AbortableFn {
        AbortableFn::new(Box::new(move |token: CancellationToken| {
            Box::pin(async move {
                tokio::select! {
                    _ = token.cancelled() => Err(ExecError::Interrupted),
                    _ = sleep(duration) => Ok(()),
                }
            })
        }))
    }

    #[tokio::test]
    async fn completes_once_with_ok() {
        let (tx, mut rx) = channel();
        let mut p = sleeper(Duration::from_millis(5));
        p.compute(Done::new(0, tx));
        let (idx, out) = rx.recv().await.unwrap();
        assert_eq!(idx, 0);
        assert_eq!(out, Ok(()));
        // No second completion.
        assert!(
            tokio::time::timeout(Duration::from_millis(30), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn abort_delivers_interrupted() {
        let (tx, mut rx) = channel();
        let mut p = sleeper(Duration::from_secs(60));
        p.compute(Done::new(3, tx));
        assert!(p.abort());
        let (idx, out) = rx.recv().await.unwrap();
        assert_eq!(idx, 3);
        assert_eq!(out, Err(ExecError::Interrupted));
    }

    #[tokio::test]
    async fn abort_before_compute_reports_not_running() {
        let mut p = sleeper(Duration::from_millis(1));
        assert!(!p.abort());
    }

    #[tokio::test]
    async fn pause_swallows_and_resume_relaunches() {
        let (tx, mut rx) = channel();
        let mut p = sleeper(Duration::from_millis(10));
        p.compute(Done::new(0, tx));
        p.pause();
        // The cancelled run must not surface anything.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        p.resume();
        let (_, out) = rx.recv().await.unwrap();
        assert_eq!(out, Ok(()));
    }

    #[tokio::test]
    async fn pause_after_completion_is_a_no_op() {
        let (tx, mut rx) = channel();
        let mut p = sleeper(Duration::from_millis(1));
        p.compute(Done::new(0, tx));
        let (_, out) = rx.recv().await.unwrap();
        assert_eq!(out, Ok(()));
        p.pause();
        p.resume();
        assert!(
            tokio::time::timeout(Duration::from_millis(30), rx.recv())
                .await
                .is_err()
        );
    }
}

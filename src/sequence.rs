//! Ordered composition of primitives with pause/resume/interrupt semantics.
//!
//! A sequence executes its primitives in order: primitive i+1 does not start
//! before primitive i delivered its completion. Errors terminate the whole
//! sequence; termination aborts every primitive and waits for the in-flight
//! ones to drain before the single final completion is delivered. A
//! temporary failure reported by an earlier primitive pauses everything
//! between it and the current one; the paired run-again signal resumes them
//! in index order.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::expr::Expr;
use crate::primitive::{Done, Primitive};

enum SeqCtl {
    Abort,
    Pause,
    Resume,
    AbortStep(usize, oneshot::Sender<()>),
}

/// Control handle usable while [`Sequence::run`] is in flight.
#[derive(Clone)]
pub struct SequenceCtl {
    tx: mpsc::UnboundedSender<SeqCtl>,
}

impl SequenceCtl {
    /// Interrupts the whole sequence.
    pub fn abort(&self) {
        let _ = self.tx.send(SeqCtl::Abort);
    }

    pub fn pause(&self) {
        let _ = self.tx.send(SeqCtl::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(SeqCtl::Resume);
    }

    /// Requests interruption of the primitive at `idx`. The returned
    /// receiver fires exactly once, after that primitive delivered its
    /// interrupted completion.
    pub fn abort_step(&self, idx: usize) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(SeqCtl::AbortStep(idx, tx));
        rx
    }
}

/// An ordered list of primitives plus the execution state driving them.
pub struct Sequence {
    steps: Vec<Box<dyn Primitive>>,
    events_tx: mpsc::UnboundedSender<(usize, Result<(), ExecError>)>,
    events_rx: Option<mpsc::UnboundedReceiver<(usize, Result<(), ExecError>)>>,
    ctl_tx: mpsc::UnboundedSender<SeqCtl>,
    ctl_rx: Option<mpsc::UnboundedReceiver<SeqCtl>>,
    index: usize,
    error_index: Option<usize>,
    draining: bool,
    drain_pending: HashSet<usize>,
    final_err: Result<(), ExecError>,
    must_pause: bool,
    requested_abort: HashMap<usize, Vec<oneshot::Sender<()>>>,
}

impl Sequence {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        Self {
            steps: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            ctl_tx,
            ctl_rx: Some(ctl_rx),
            index: 0,
            error_index: None,
            draining: false,
            drain_pending: HashSet::new(),
            final_err: Ok(()),
            must_pause: false,
            requested_abort: HashMap::new(),
        }
    }

    pub fn from_steps(steps: Vec<Box<dyn Primitive>>) -> Self {
        let mut seq = Self::new();
        seq.steps = steps;
        seq
    }

    pub fn push(&mut self, step: Box<dyn Primitive>) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Control handle; may be cloned and used from other tasks while the
    /// sequence runs.
    pub fn handle(&self) -> SequenceCtl {
        SequenceCtl {
            tx: self.ctl_tx.clone(),
        }
    }

    /// Starts paused: primitives are computed but held until `resume`.
    pub fn pause_at_start(&mut self) {
        self.must_pause = true;
    }

    /// Expression of the primitive that caused termination, when any.
    pub fn blame(&self) -> Option<Expr> {
        self.error_index.and_then(|i| self.steps[i].blame())
    }

    /// Drives the primitives to the single final completion.
    pub async fn run(&mut self) -> Result<(), ExecError> {
        if self.steps.is_empty() {
            return Ok(());
        }
        self.index = 0;
        self.error_index = None;
        self.draining = false;
        self.final_err = Ok(());

        let mut events_rx = self.events_rx.take().expect("sequence already running");
        let mut ctl_rx = self.ctl_rx.take().expect("sequence already running");

        self.start(0);
        let result = loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let (idx, outcome) = event.expect("events channel never closes");
                    if let Some(result) = self.on_event(idx, outcome) {
                        break result;
                    }
                }
                ctl = ctl_rx.recv() => {
                    let Some(ctl) = ctl else { continue };
                    if let Some(result) = self.on_ctl(ctl) {
                        break result;
                    }
                }
            }
        };
        self.events_rx = Some(events_rx);
        self.ctl_rx = Some(ctl_rx);
        result
    }

    fn start(&mut self, idx: usize) {
        if self.must_pause {
            self.steps[idx].pause();
        }
        let done = Done::new(idx, self.events_tx.clone());
        self.steps[idx].compute(done);
    }

    fn fire_requested_abort(&mut self, idx: usize) -> bool {
        match self.requested_abort.remove(&idx) {
            Some(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                true
            }
            None => false,
        }
    }

    fn on_event(&mut self, idx: usize, outcome: Result<(), ExecError>) -> Option<Result<(), ExecError>> {
        if self.draining {
            if matches!(outcome, Err(ExecError::Interrupted)) {
                self.fire_requested_abort(idx);
            }
            // Pause/resume signals are not completions; anything else from a
            // counted primitive drains it, even if the interruption lost a
            // race against a success or an error already in flight.
            let terminal = !matches!(
                outcome,
                Err(ExecError::TemporaryFailure) | Err(ExecError::RunAgain)
            );
            if terminal && self.drain_pending.remove(&idx) && self.drain_pending.is_empty() {
                return Some(self.final_err.clone());
            }
            return None;
        }

        match outcome {
            Err(ExecError::Interrupted) => {
                // An interruption nobody asked for is spurious; one that was
                // requested fires its callback and stops the pipeline here.
                if !self.fire_requested_abort(idx) {
                    debug!(idx, "spurious interruption");
                }
                None
            }
            Err(ExecError::TemporaryFailure) => {
                // Pause every primitive between the failing one and the
                // current one, exclusive of the failing one itself.
                debug_assert!(idx <= self.index);
                for i in 0..self.index.saturating_sub(idx) {
                    self.steps[self.index - i].pause();
                }
                None
            }
            Err(ExecError::RunAgain) => {
                for i in (idx + 1)..=self.index {
                    self.steps[i].resume();
                }
                None
            }
            Err(e) => {
                self.error_index = Some(idx);
                self.terminate(Err(e))
            }
            Ok(()) => {
                if idx + 1 == self.steps.len() {
                    self.terminate(Ok(()))
                } else {
                    self.index = idx + 1;
                    self.start(self.index);
                    None
                }
            }
        }
    }

    fn on_ctl(&mut self, ctl: SeqCtl) -> Option<Result<(), ExecError>> {
        match ctl {
            SeqCtl::Abort => self.terminate(Err(ExecError::Interrupted)),
            SeqCtl::Pause => {
                self.must_pause = true;
                for i in (0..=self.index.min(self.steps.len() - 1)).rev() {
                    self.steps[i].pause();
                }
                None
            }
            SeqCtl::Resume => {
                self.must_pause = false;
                for i in 0..=self.index.min(self.steps.len() - 1) {
                    self.steps[i].resume();
                }
                None
            }
            SeqCtl::AbortStep(idx, waiter) => {
                if idx >= self.steps.len() {
                    warn!(idx, "abort requested for unknown primitive");
                    return None;
                }
                self.requested_abort.entry(idx).or_default().push(waiter);
                self.steps[idx].abort();
                None
            }
        }
    }

    /// Terminates the run: every primitive is aborted and the in-flight
    /// ones are drained before the final outcome is delivered.
    fn terminate(&mut self, err: Result<(), ExecError>) -> Option<Result<(), ExecError>> {
        if self.draining {
            return None;
        }
        self.draining = true;
        self.final_err = err;
        self.drain_pending = self
            .steps
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.abort().then_some(i))
            .collect();
        if self.drain_pending.is_empty() {
            Some(self.final_err.clone())
        } else {
            None
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

//! Exactly-once completion delivery.
//!
//! A [`Dispatcher`] owns an operation's state, its callback and the arbitration between the
//! work deciding an outcome and a caller cancelling. Every transition happens under one mutex;
//! the callback is always taken out of the lock and called after the guard is gone.
//!
//! Cancelling a Running operation decides the outcome but does not deliver it. The worker
//! delivers `Cancelled` from [`Dispatcher::finish`] once its work has returned and released
//! its connection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use tracing::{error, trace};

use crate::error::OperationError;
use crate::operation::{OperationId, State};
use crate::utils::lock;

/// What an operation hands its callback.
pub type Outcome<T> = Result<T, OperationError>;

/// A completion callback.
pub type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct Slot<T> {
    state: State,
    callback: Option<Callback<T>>,
    registered: bool,
}

/// How [`Dispatcher::start`] resolved.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Started {
    /// The operation is now Running and its work must be run.
    Run,
    /// The operation had been cancelled before it started; the callback got `Cancelled`.
    AlreadyCancelled,
}

pub(crate) struct Dispatcher<T> {
    id: OperationId,
    slot: Mutex<Slot<T>>,
}

impl<T> Dispatcher<T> {
    pub(crate) fn new(id: OperationId) -> Self {
        Dispatcher {
            id,
            slot: Mutex::new(Slot {
                state: State::Idle,
                callback: None,
                registered: false,
            }),
        }
    }

    pub(crate) fn state(&self) -> State {
        lock(&self.slot).state
    }

    /// Registers `callback` and moves Idle to Running in one step.
    pub(crate) fn start(&self, callback: Callback<T>) -> Result<Started, OperationError> {
        let mut slot = lock(&self.slot);
        match (slot.state, slot.registered) {
            (State::Idle, false) => {
                slot.callback = Some(callback);
                slot.registered = true;
                slot.state = State::Running;
                trace!("{}: idle -> running", self.id);
                Ok(Started::Run)
            }
            (State::Cancelled, false) => {
                slot.registered = true;
                drop(slot);
                self.deliver(callback, Err(OperationError::cancelled()));
                Ok(Started::AlreadyCancelled)
            }
            (state, registered) => Err(self.rejected("start", state, registered)),
        }
    }

    /// Registers `callback` without starting.
    ///
    /// Allowed only before the operation has started. An operation cancelled while Idle
    /// delivers `Cancelled` to the callback right away.
    pub(crate) fn register(&self, callback: Callback<T>) -> Result<(), OperationError> {
        let mut slot = lock(&self.slot);
        match (slot.state, slot.registered) {
            (State::Idle, false) => {
                slot.callback = Some(callback);
                slot.registered = true;
                Ok(())
            }
            (State::Cancelled, false) => {
                slot.registered = true;
                drop(slot);
                self.deliver(callback, Err(OperationError::cancelled()));
                Ok(())
            }
            (state, registered) => Err(self.rejected("register a callback on", state, registered)),
        }
    }

    /// Idle to Running without touching the callback. Returns `false` if not Idle.
    pub(crate) fn begin(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.state != State::Idle {
            return false;
        }
        slot.state = State::Running;
        trace!("{}: idle -> running", self.id);
        true
    }

    /// The worker's last word, called once its work has returned.
    ///
    /// Returns `true` if `outcome` won because the operation was still Running. If a cancel got
    /// there first, the callback it withheld receives `Cancelled` here instead.
    pub(crate) fn finish(&self, outcome: Outcome<T>) -> bool {
        let (callback, outcome, won) = {
            let mut slot = lock(&self.slot);
            match slot.state {
                State::Running => {
                    slot.state = State::Finished;
                    trace!(
                        "{}: running -> finished ({})",
                        self.id,
                        if outcome.is_ok() { "ok" } else { "failed" }
                    );
                    (slot.callback.take(), outcome, true)
                }
                State::Cancelled => {
                    trace!("{}: outcome discarded, operation was cancelled", self.id);
                    (slot.callback.take(), Err(OperationError::cancelled()), false)
                }
                state => {
                    trace!("{}: outcome discarded, operation is {:?}", self.id, state);
                    return false;
                }
            }
        };

        if let Some(callback) = callback {
            self.deliver(callback, outcome);
        }
        won
    }

    /// The caller's decision. Wins, returning `true`, only from Idle or Running.
    ///
    /// An Idle operation has no worker, so its callback receives `Cancelled` right here. A
    /// Running operation keeps its callback until the worker calls [`finish`](Self::finish).
    pub(crate) fn cancel(&self) -> bool {
        let callback = {
            let mut slot = lock(&self.slot);
            match slot.state {
                State::Idle => {
                    trace!("{}: idle -> cancelled", self.id);
                    slot.state = State::Cancelled;
                    slot.callback.take()
                }
                State::Running => {
                    trace!("{}: running -> cancelled", self.id);
                    slot.state = State::Cancelled;
                    None
                }
                State::Finished | State::Cancelled => return false,
            }
        };

        if let Some(callback) = callback {
            self.deliver(callback, Err(OperationError::cancelled()));
        }
        true
    }

    fn deliver(&self, callback: Callback<T>, outcome: Outcome<T>) {
        // a panicking callback must not take the worker thread and its bookkeeping down
        if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
            error!("{}: completion callback panicked", self.id);
        }
    }

    fn rejected(&self, what: &str, state: State, registered: bool) -> OperationError {
        let detail = if state == State::Idle && registered {
            format!("cannot {} {}: a callback is already registered", what, self.id)
        } else {
            format!("cannot {} {}: operation is {:?}", what, self.id, state)
        };
        trace!("{}", detail);
        OperationError::invalid_state(detail)
    }
}

//! Bounded concurrent execution of operations.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::OperationError;
use crate::operation::{spawn_worker, Execute, Operation, OperationId, Priority, State, Task};
use crate::utils::lock;

struct Pending {
    priority: Priority,
    seq: u64,
    task: Arc<dyn Task>,
}

// BinaryHeap pops the greatest: highest priority first, then lowest sequence number.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

struct QueueState {
    max_concurrency: usize,
    next_seq: u64,
    pending: BinaryHeap<Pending>,
    running: HashMap<OperationId, Arc<dyn Task>>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    /// Moves pending operations to running while there is room.
    ///
    /// Operations cancelled while pending are dropped here without running.
    fn admit(&mut self) -> Vec<Arc<dyn Task>> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrency {
            let next = match self.pending.pop() {
                Some(next) => next,
                None => break,
            };
            if next.task.begin() {
                trace!(
                    "{} ({}) admitted, {} running",
                    next.task.id(),
                    next.task.name(),
                    self.running.len() + 1
                );
                self.running.insert(next.task.id(), next.task.clone());
                admitted.push(next.task);
            } else {
                trace!("{} left the queue while pending", next.task.id());
            }
        }
        admitted
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    drained: Condvar,
}

impl QueueInner {
    fn launch(self: &Arc<Self>, tasks: Vec<Arc<dyn Task>>) {
        for task in tasks {
            let id = task.id();
            let inner = self.clone();
            let worker_task = task.clone();
            let spawned = spawn_worker(id, move || {
                worker_task.run();
                inner.finished(id);
            });
            if let Err(err) = spawned {
                task.fail(err);
                self.finished(id);
            }
        }
    }

    fn finished(self: &Arc<Self>, id: OperationId) {
        let next = {
            let mut state = lock(&self.state);
            state.running.remove(&id);
            let next = state.admit();
            if state.is_idle() {
                self.drained.notify_all();
            }
            next
        };
        self.launch(next);
    }
}

/// Runs operations with at most `max_concurrency` of them running at once.
///
/// Pending operations are admitted highest [`Priority`] first and in enqueue order within a
/// priority. Admitted operations run on their own worker threads; whenever one stops, by any
/// path, the next pending operation is admitted.
///
/// A queue is an ordinary value: create one and share it (it is a cheap handle) with whatever
/// needs it.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    /// A queue running at most `max_concurrency` operations at once (at least one).
    pub fn new(max_concurrency: usize) -> Self {
        OperationQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    max_concurrency: max_concurrency.max(1),
                    next_seq: 0,
                    pending: BinaryHeap::new(),
                    running: HashMap::new(),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    /// Adds an Idle operation, starting it right away if there is room.
    ///
    /// Register a callback first with [`Operation::on_complete`] or
    /// [`Operation::completion`] to learn the outcome. Fails with
    /// [`ErrorCode::InvalidState`](crate::ErrorCode::InvalidState) if the operation is not
    /// Idle or is already in this queue.
    pub fn enqueue<E: Execute>(&self, operation: &Operation<E>) -> Result<(), OperationError> {
        let task = operation.task();
        let id = task.id();
        let admitted = {
            let mut state = lock(&self.inner.state);
            if task.state() != State::Idle {
                return Err(OperationError::invalid_state(format!(
                    "cannot enqueue {}: operation is {:?}",
                    id,
                    task.state()
                )));
            }
            if state.running.contains_key(&id) || state.pending.iter().any(|p| p.task.id() == id)
            {
                return Err(OperationError::invalid_state(format!(
                    "{} is already queued",
                    id
                )));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            debug!("{} ({}) enqueued", id, task.name());
            state.pending.push(Pending {
                priority: task.priority(),
                seq,
                task,
            });
            state.admit()
        };
        self.inner.launch(admitted);
        Ok(())
    }

    /// Cancels every pending and running operation in the queue.
    pub fn cancel_all(&self) {
        let (pending, running): (Vec<_>, Vec<_>) = {
            let mut state = lock(&self.inner.state);
            let pending = state.pending.drain().map(|p| p.task).collect();
            let running = state.running.values().cloned().collect();
            if state.is_idle() {
                self.inner.drained.notify_all();
            }
            (pending, running)
        };
        debug!(
            "cancelling {} pending and {} running operations",
            pending.len(),
            running.len()
        );

        for task in pending.iter().chain(running.iter()) {
            task.cancel();
        }
    }

    /// Changes the admission limit (at least one).
    ///
    /// Raising it admits pending operations right away. Lowering it never stops running
    /// operations; it only holds back later admissions.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let admitted = {
            let mut state = lock(&self.inner.state);
            state.max_concurrency = max_concurrency.max(1);
            debug!("max concurrency set to {}", state.max_concurrency);
            state.admit()
        };
        self.inner.launch(admitted);
    }

    /// The current admission limit.
    pub fn max_concurrency(&self) -> usize {
        lock(&self.inner.state).max_concurrency
    }

    /// How many operations wait for admission.
    ///
    /// Operations cancelled while pending are not counted.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state)
            .pending
            .iter()
            .filter(|p| p.task.state() == State::Idle)
            .count()
    }

    /// How many admitted operations have not stopped yet.
    pub fn running_count(&self) -> usize {
        lock(&self.inner.state).running.len()
    }

    /// Blocks until nothing is pending or running.
    pub fn wait_idle(&self) {
        let state = lock(&self.inner.state);
        let _state = self
            .inner
            .drained
            .wait_while(state, |state| !state.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `timeout`. Returns whether the
    /// queue is idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.inner.state);
        let (state, _) = self
            .inner
            .drained
            .wait_timeout_while(state, timeout, |state| !state.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("OperationQueue")
            .field("max_concurrency", &state.max_concurrency)
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .finish()
    }
}

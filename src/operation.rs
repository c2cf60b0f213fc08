//! Operations: units of IMAP work with one lifecycle and one completion.
//!
//! An [`Operation`] wraps an [`Execute`] implementation. Starting it moves it from
//! [`State::Idle`] to [`State::Running`] and runs the work on its own worker thread; the work's
//! outcome, or a cancellation, moves it to a terminal state and is delivered to the registered
//! callback exactly once.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use imap_operation::{ClientBuilder, Credentials, Operation, SessionPool};
//! # use imap_operation::ops::SelectFolder;
//! let pool = SessionPool::builder(ClientBuilder::new("imap.example.com", 993))
//!     .credentials(Credentials::login("me", "secret"))
//!     .build();
//! let select = Operation::builder(SelectFolder::new("INBOX"))
//!     .provider(Arc::new(pool))
//!     .build();
//! select
//!     .start(|outcome| match outcome {
//!         Ok(mailbox) => println!("{} messages", mailbox.exists),
//!         Err(e) => eprintln!("select failed: {}", e),
//!     })
//!     .unwrap();
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::client::Session;
use crate::conn::Connection;
use crate::dispatch::{Dispatcher, Outcome, Started};
use crate::error::{ErrorCode, OperationError};
use crate::pool::{ConnectionProvider, Lease};
use crate::utils::lock;

/// Process-unique identity of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        OperationId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Admission priority inside an [`OperationQueue`](crate::OperationQueue).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Admitted after everything else.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Admitted before everything else.
    High,
}

/// Lifecycle state of an [`Operation`].
///
/// Transitions only go forward: `Idle -> Running -> Finished`, `Idle -> Cancelled` and
/// `Running -> Cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, not started.
    Idle,
    /// The work has been handed to a worker.
    Running,
    /// The work decided an outcome, successful or not.
    Finished,
    /// Cancellation won.
    Cancelled,
}

impl State {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Finished | State::Cancelled)
    }
}

/// The work an [`Operation`] performs.
///
/// Implementations talk to the server through [`Context::session`] and report failures as
/// [`OperationError`]s; session errors convert with `?`.
pub trait Execute: Send + 'static {
    /// What a successful run produces.
    type Output: Send + 'static;

    /// A short name for logs.
    fn name(&self) -> &'static str {
        "operation"
    }

    /// Performs the work. Called at most once per operation.
    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Self::Output, OperationError>;
}

/// [`Execute`] for a closure, see [`Operation::from_fn`].
pub struct FromFn<F>(F);

impl<F, T> FromFn<F>
where
    F: FnMut(&mut Context<'_>) -> Result<T, OperationError> + Send + 'static,
    T: Send + 'static,
{
    /// Wrap a closure, for use with [`Operation::builder`].
    pub fn new(f: F) -> Self {
        FromFn(f)
    }
}

impl<F, T> Execute for FromFn<F>
where
    F: FnMut(&mut Context<'_>) -> Result<T, OperationError> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn name(&self) -> &'static str {
        "closure"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<T, OperationError> {
        (self.0)(ctx)
    }
}

/// What a worker thread needs from an operation, with the work type erased.
pub(crate) trait Task: Send + Sync {
    fn id(&self) -> OperationId;
    fn name(&self) -> &'static str;
    fn priority(&self) -> Priority;
    fn state(&self) -> State;
    fn begin(&self) -> bool;
    fn run(&self);
    fn cancel(&self) -> bool;
    fn fail(&self, err: OperationError);
}

struct Shared<E: Execute> {
    id: OperationId,
    name: &'static str,
    work: Mutex<Option<E>>,
    dispatcher: Dispatcher<E::Output>,
    cancel: CancelToken,
    provider: Option<Arc<dyn ConnectionProvider>>,
    timeout: Option<Duration>,
    priority: Priority,
}

impl<E: Execute> Shared<E> {
    fn run(&self) {
        if self.dispatcher.state() != State::Running {
            // cancelled between admission and the worker getting here
            trace!("{}: not running, skipping work", self.id);
            self.dispatcher.finish(Err(OperationError::cancelled()));
            return;
        }
        let work = lock(&self.work).take();
        let mut work = match work {
            Some(work) => work,
            None => {
                self.dispatcher
                    .finish(Err(OperationError::invalid_state(format!(
                        "{} has no work left to run",
                        self.id
                    ))));
                return;
            }
        };

        debug!("{} ({}) running", self.id, self.name);
        let outcome = {
            let mut ctx = Context::new(self);
            let outcome =
                match panic::catch_unwind(AssertUnwindSafe(|| work.execute(&mut ctx))) {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        warn!("{} ({}) panicked", self.id, self.name);
                        Err(OperationError::with_detail(
                            ErrorCode::Unknown,
                            format!("operation panicked: {}", panic_message(&*payload)),
                        ))
                    }
                };
            if let Err(err) = &outcome {
                if err.breaks_connection() {
                    ctx.poison_lease();
                }
            }
            outcome
            // the lease goes back before the outcome is published
        };
        drop(work);

        if self.dispatcher.finish(outcome) {
            debug!("{} ({}) finished", self.id, self.name);
        } else {
            debug!("{} ({}) returned after cancellation", self.id, self.name);
        }
    }

    fn cancel(&self) -> bool {
        if !self.dispatcher.cancel() {
            return false;
        }
        debug!("{} ({}) cancelled", self.id, self.name);
        self.cancel.cancel();
        true
    }
}

impl<E: Execute> Task for Shared<E> {
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn state(&self) -> State {
        self.dispatcher.state()
    }

    fn begin(&self) -> bool {
        self.dispatcher.begin()
    }

    fn run(&self) {
        Shared::run(self)
    }

    fn cancel(&self) -> bool {
        Shared::cancel(self)
    }

    fn fail(&self, err: OperationError) {
        self.dispatcher.finish(Err(err));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

pub(crate) fn spawn_worker<F>(id: OperationId, f: F) -> Result<(), OperationError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("imap-{}", id))
        .spawn(f)
        .map(|_| ())
        .map_err(|e| {
            warn!("{}: cannot spawn worker thread: {}", id, e);
            OperationError::with_detail(
                ErrorCode::Unknown,
                format!("cannot spawn worker thread: {}", e),
            )
        })
}

/// A handle to an asynchronous IMAP operation.
///
/// Handles are cheap to clone; all clones refer to the same operation. The operation lives
/// until its last handle is gone and its worker has returned.
pub struct Operation<E: Execute> {
    shared: Arc<Shared<E>>,
}

impl<E: Execute> Clone for Operation<E> {
    fn clone(&self) -> Self {
        Operation {
            shared: self.shared.clone(),
        }
    }
}

impl<E: Execute> fmt::Debug for Operation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("priority", &self.shared.priority)
            .finish()
    }
}

impl<F, T> Operation<FromFn<F>>
where
    F: FnMut(&mut Context<'_>) -> Result<T, OperationError> + Send + 'static,
    T: Send + 'static,
{
    /// An operation running the given closure.
    pub fn from_fn(f: F) -> Self {
        Operation::new(FromFn::new(f))
    }
}

impl<E: Execute> Operation<E> {
    /// An operation with no connection provider, no timeout and normal priority.
    pub fn new(work: E) -> Self {
        Operation::builder(work).build()
    }

    /// Configure an operation before creating it.
    pub fn builder(work: E) -> OperationBuilder<E> {
        OperationBuilder {
            work,
            provider: None,
            timeout: None,
            priority: Priority::default(),
        }
    }

    /// This operation's identity.
    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    /// The name of the work, for logs.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.dispatcher.state()
    }

    /// The queue admission priority.
    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    /// Whether the operation has not been started or cancelled yet.
    pub fn is_idle(&self) -> bool {
        self.state() == State::Idle
    }

    /// Whether the work has been handed to a worker and no outcome is decided yet.
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Whether the work decided an outcome (success or failure).
    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    /// Whether cancellation decided the outcome.
    pub fn is_cancelled(&self) -> bool {
        self.state() == State::Cancelled
    }

    /// Registers `callback` and starts the work on a new worker thread.
    ///
    /// Fails with [`ErrorCode::InvalidState`] if the operation was already started, or already
    /// has a callback; the rejected callback is dropped without being called and nothing else
    /// changes. An operation cancelled before it was ever started hands `Cancelled` to
    /// `callback` and never runs its work.
    pub fn start<F>(&self, callback: F) -> Result<(), OperationError>
    where
        F: FnOnce(Outcome<E::Output>) + Send + 'static,
    {
        match self.shared.dispatcher.start(Box::new(callback))? {
            Started::Run => {
                let shared = self.shared.clone();
                if let Err(err) = spawn_worker(self.id(), move || shared.run()) {
                    self.shared.dispatcher.finish(Err(err));
                }
            }
            Started::AlreadyCancelled => {
                trace!("{}: started after cancellation", self.id());
            }
        }
        Ok(())
    }

    /// Registers `callback` without starting, for operations a queue will start.
    ///
    /// Follows the same rules as [`start`](Self::start).
    pub fn on_complete<F>(&self, callback: F) -> Result<(), OperationError>
    where
        F: FnOnce(Outcome<E::Output>) + Send + 'static,
    {
        self.shared.dispatcher.register(Box::new(callback))
    }

    /// Registers a one-shot channel as the callback, without starting.
    pub fn completion(&self) -> Result<Completion<E::Output>, OperationError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(Completion { rx })
    }

    /// Starts the operation with a one-shot channel as the callback.
    pub fn spawn(&self) -> Result<Completion<E::Output>, OperationError> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.start(move |outcome| {
            let _ = tx.send(outcome);
        })?;
        Ok(Completion { rx })
    }

    /// Requests cancellation and returns immediately.
    ///
    /// An Idle operation becomes Cancelled at once, its work never runs and a registered
    /// callback receives [`ErrorCode::Cancelled`] on this thread. A Running one becomes
    /// Cancelled unless its work has already decided, and its connection is aborted; the
    /// callback receives `Cancelled` from the worker once the work has returned and its
    /// connection has been released. Terminal operations are left alone.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    pub(crate) fn task(&self) -> Arc<dyn Task> {
        self.shared.clone()
    }
}

/// Configures an [`Operation`].
pub struct OperationBuilder<E: Execute> {
    work: E,
    provider: Option<Arc<dyn ConnectionProvider>>,
    timeout: Option<Duration>,
    priority: Priority,
}

impl<E: Execute> OperationBuilder<E> {
    /// Where the work gets its session from.
    pub fn provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Fail with [`ErrorCode::Timeout`] if the server stays silent for this long.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Queue admission priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Create the operation, Idle.
    pub fn build(self) -> Operation<E> {
        let id = OperationId::next();
        let name = self.work.name();
        trace!("{} ({}) created", id, name);
        Operation {
            shared: Arc::new(Shared {
                id,
                name,
                work: Mutex::new(Some(self.work)),
                dispatcher: Dispatcher::new(id),
                cancel: CancelToken::new(),
                provider: self.provider,
                timeout: self.timeout,
                priority: self.priority,
            }),
        }
    }
}

/// The receiving end of an operation's one-shot completion channel.
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<Outcome<T>>,
}

fn dropped() -> OperationError {
    OperationError::with_detail(ErrorCode::Unknown, "operation dropped before completion")
}

impl<T> Completion<T> {
    /// Blocks until the outcome is delivered.
    pub fn wait(self) -> Outcome<T> {
        self.rx.recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Blocks for at most `timeout`. `None` means the operation has not completed yet.
    ///
    /// The outcome is handed out once.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Outcome<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(dropped())),
        }
    }

    /// Returns the outcome if it has been delivered.
    ///
    /// The outcome is handed out once.
    pub fn try_wait(&mut self) -> Option<Outcome<T>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(dropped())),
        }
    }
}

/// What the work sees of its operation while it runs.
pub struct Context<'a> {
    id: OperationId,
    cancel: &'a CancelToken,
    provider: Option<&'a dyn ConnectionProvider>,
    timeout: Option<Duration>,
    lease: Option<Lease>,
}

impl<'a> Context<'a> {
    fn new<E: Execute>(shared: &'a Shared<E>) -> Self {
        Context {
            id: shared.id,
            cancel: &shared.cancel,
            provider: shared.provider.as_deref(),
            timeout: shared.timeout,
            lease: None,
        }
    }

    /// The running operation's identity.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Whether the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` once the operation has been cancelled.
    pub fn check_cancelled(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::cancelled())
        } else {
            Ok(())
        }
    }

    /// The operation's cancel token, for registering further abort hooks.
    pub fn cancel_token(&self) -> &CancelToken {
        self.cancel
    }

    /// The operation's timeout, if it has one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// An authenticated session, leased from the operation's provider on first use.
    ///
    /// The lease is held until the work returns. Every call checks for cancellation first.
    pub fn session(&mut self) -> Result<&mut Session<Connection>, OperationError> {
        let lease = match self.lease.take() {
            Some(lease) => lease,
            None => self.acquire()?,
        };
        // an aborted connection is closed when the lease drops here, an intact one goes back
        self.check_cancelled()?;
        Ok(&mut **self.lease.insert(lease))
    }

    fn acquire(&self) -> Result<Lease, OperationError> {
        self.check_cancelled()?;
        let provider = self.provider.ok_or_else(|| {
            OperationError::with_detail(
                ErrorCode::NoProvider,
                format!("{} has no connection provider", self.id),
            )
        })?;

        let mut lease = provider.lease(self.cancel, self.timeout)?;
        // dropped here, the lease goes back unless its abort hook already ran
        self.check_cancelled()?;
        lease.arm(self.cancel, self.timeout)?;
        trace!("{}: connection leased", self.id);
        Ok(lease)
    }

    fn poison_lease(&mut self) {
        if let Some(lease) = self.lease.as_mut() {
            lease.poison();
        }
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

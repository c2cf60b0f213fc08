//! Where operations get their sessions from.
//!
//! A [`ConnectionProvider`] hands out [`Lease`]s on authenticated sessions. [`SessionPool`] is
//! the provided implementation: it opens connections with a [`ClientBuilder`], authenticates
//! them with [`Credentials`] and keeps a few idle sessions around for reuse.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace};

use crate::authenticator::Credentials;
use crate::cancel::CancelToken;
use crate::client::Session;
use crate::client_builder::ClientBuilder;
use crate::conn::{Abort, AbortHandle, AbortRegistration, Connection, SetReadTimeout};
use crate::error::{Error, Result};
use crate::utils::lock;

/// A source of authenticated sessions.
///
/// `lease` is called from operation worker threads, possibly many at once.
pub trait ConnectionProvider: Send + Sync {
    /// An authenticated session for exclusive use until the lease is dropped.
    ///
    /// `cancel` and `timeout` belong to the leasing operation. Connecting and authenticating
    /// should honour both, so that a silent server or a cancellation cannot hold the caller
    /// forever; [`Lease::arm`] applies them to a session that already exists.
    fn lease(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<Lease>;
}

/// Exclusive use of a session.
///
/// Dropping the lease hands the session back to the pool it came from, unless the lease was
/// [poisoned](Lease::poison) or its connection was aborted by a cancellation, in which case the
/// connection is closed.
pub struct Lease {
    session: Option<Session<Connection>>,
    home: Option<Arc<PoolInner>>,
    poisoned: bool,
    abort: Option<AbortRegistration>,
}

impl Lease {
    /// A lease that belongs to no pool; the session is closed when the lease is dropped.
    ///
    /// For custom [`ConnectionProvider`]s.
    pub fn detached(session: Session<Connection>) -> Self {
        Lease {
            session: Some(session),
            home: None,
            poisoned: false,
            abort: None,
        }
    }

    fn pooled(session: Session<Connection>, home: Arc<PoolInner>) -> Self {
        Lease {
            session: Some(session),
            home: Some(home),
            poisoned: false,
            abort: None,
        }
    }

    /// Applies an operation's read timeout and aborts the connection when `cancel` fires.
    ///
    /// The abort hook is registered once; arming again only updates the timeout.
    pub fn arm(&mut self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<()> {
        self.set_read_timeout(timeout)?;
        if self.abort.is_none() {
            self.abort = self
                .abort_handle()
                .map(|handle| AbortRegistration::new(cancel, handle));
        }
        Ok(())
    }

    /// Marks the connection as unusable so it is closed instead of reused.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// Whether [`poison`](Self::poison) was called.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// A handle that tears the connection down from another thread.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.session
            .as_ref()
            .and_then(|session| session.get_ref().abort_handle())
    }

    /// Sets the read timeout of the underlying connection.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.get_mut().set_read_timeout(timeout),
            None => Ok(()),
        }
    }
}

impl Deref for Lease {
    type Target = Session<Connection>;

    fn deref(&self) -> &Self::Target {
        // only Drop takes the session out
        self.session.as_ref().expect("lease holds a session until dropped")
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("lease holds a session until dropped")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        let aborted = self.abort.as_mut().map_or(false, AbortRegistration::disarm);
        match &self.home {
            Some(home) if !self.poisoned && !aborted => home.give_back(session),
            _ => trace!(
                poisoned = self.poisoned,
                aborted,
                "closing leased connection"
            ),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pooled", &self.home.is_some())
            .field("poisoned", &self.poisoned)
            .field("armed", &self.abort.is_some())
            .finish()
    }
}

struct PoolInner {
    builder: ClientBuilder,
    credentials: Option<Credentials>,
    idle: Mutex<Vec<Session<Connection>>>,
    max_idle: usize,
    test_on_lease: bool,
}

impl PoolInner {
    fn give_back(&self, mut session: Session<Connection>) {
        if let Err(e) = session.get_mut().set_read_timeout(None) {
            debug!("closing connection that cannot reset its timeout: {}", e);
            return;
        }
        let mut idle = lock(&self.idle);
        if idle.len() < self.max_idle {
            idle.push(session);
            trace!(idle = idle.len(), "connection returned to pool");
        } else {
            trace!("pool full, closing connection");
        }
    }
}

/// A pool of authenticated sessions to one account.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

/// Configures a [`SessionPool`].
#[derive(Debug)]
pub struct SessionPoolBuilder {
    builder: ClientBuilder,
    credentials: Option<Credentials>,
    max_idle: usize,
    test_on_lease: bool,
}

impl SessionPoolBuilder {
    /// How new connections authenticate. Without credentials the pool cannot open sessions.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// How many idle sessions to keep. Defaults to 4.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Whether to `NOOP` an idle session before handing it out again. Defaults to `true`.
    pub fn test_on_lease(mut self, test: bool) -> Self {
        self.test_on_lease = test;
        self
    }

    /// Create the pool. No connection is opened until the first lease.
    pub fn build(self) -> SessionPool {
        SessionPool {
            inner: Arc::new(PoolInner {
                builder: self.builder,
                credentials: self.credentials,
                idle: Mutex::new(Vec::new()),
                max_idle: self.max_idle,
                test_on_lease: self.test_on_lease,
            }),
        }
    }
}

impl SessionPool {
    /// Configure a pool connecting with `builder`.
    pub fn builder(builder: ClientBuilder) -> SessionPoolBuilder {
        SessionPoolBuilder {
            builder,
            credentials: None,
            max_idle: 4,
            test_on_lease: true,
        }
    }

    /// How many sessions sit idle in the pool.
    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }

    /// Opens and authenticates a new session, bypassing the idle list.
    pub fn connect(&self) -> Result<Session<Connection>> {
        self.open(None, None).map(|(session, _)| session)
    }

    fn open(
        &self,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<(Session<Connection>, Option<AbortRegistration>)> {
        let credentials = self
            .inner
            .credentials
            .as_ref()
            .ok_or(Error::NotAuthenticated)?;
        let (client, abort) = self.inner.builder.open(cancel, timeout)?;
        let session = credentials.authenticate(client)?;
        debug!(
            user = credentials.username(),
            domain = self.inner.builder.domain(),
            "new session"
        );
        Ok((session, abort))
    }
}

impl ConnectionProvider for SessionPool {
    fn lease(&self, cancel: &CancelToken, timeout: Option<Duration>) -> Result<Lease> {
        loop {
            // arming an idle session for a cancelled operation would kill it
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let session = lock(&self.inner.idle).pop();
            let mut lease = match session {
                Some(session) => Lease::pooled(session, self.inner.clone()),
                None => break,
            };
            if let Err(e) = lease.arm(cancel, timeout) {
                debug!("dropping pooled connection that cannot be armed: {}", e);
                lease.poison();
                continue;
            }
            if !self.inner.test_on_lease {
                return Ok(lease);
            }
            match lease.noop() {
                Ok(()) => return Ok(lease),
                Err(e) => {
                    debug!("dropping stale pooled connection: {}", e);
                    lease.poison();
                }
            }
        }

        let (session, abort) = self.open(Some(cancel), timeout)?;
        Ok(Lease {
            session: Some(session),
            home: Some(self.inner.clone()),
            poisoned: false,
            abort,
        })
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("builder", &self.inner.builder)
            .field("credentials", &self.inner.credentials)
            .field("idle", &self.idle_count())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::mock_stream::MockStream;

    fn session(script: &[u8]) -> Session<Connection> {
        let mut response = b"a1 OK Logged in\r\n".to_vec();
        response.extend_from_slice(script);
        let stream: Connection = Box::new(MockStream::new(response));
        Client::new(stream).login("u", "p").unwrap()
    }

    fn pool(max_idle: usize) -> SessionPool {
        SessionPool::builder(ClientBuilder::new("localhost", 1))
            .max_idle(max_idle)
            .test_on_lease(false)
            .build()
    }

    #[test]
    fn returned_lease_is_reused() {
        let pool = pool(1);
        drop(Lease::pooled(session(b""), pool.inner.clone()));
        assert_eq!(pool.idle_count(), 1);

        let lease = pool.lease(&CancelToken::new(), None).unwrap();
        assert_eq!(pool.idle_count(), 0);
        drop(lease);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn poisoned_lease_is_discarded() {
        let pool = pool(1);
        let mut lease = Lease::pooled(session(b""), pool.inner.clone());
        lease.poison();
        assert!(lease.is_poisoned());
        drop(lease);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn pool_keeps_at_most_max_idle() {
        let pool = pool(1);
        let a = Lease::pooled(session(b""), pool.inner.clone());
        let b = Lease::pooled(session(b""), pool.inner.clone());
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn mock_connections_cannot_abort() {
        let pool = pool(1);
        let mut lease = Lease::pooled(session(b""), pool.inner.clone());
        lease.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        assert!(lease.abort_handle().is_none());
    }

    #[test]
    fn stale_connection_is_not_handed_out() {
        let pool = SessionPool::builder(ClientBuilder::new("localhost", 1))
            .max_idle(1)
            .build();
        // the NOOP check hits EOF on the mock
        drop(Lease::pooled(session(b""), pool.inner.clone()));
        match pool.lease(&CancelToken::new(), None) {
            Err(Error::NotAuthenticated) => {}
            other => panic!("unexpected lease result: {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn cancelled_operation_leaves_idle_sessions_alone() {
        let pool = pool(1);
        drop(Lease::pooled(session(b""), pool.inner.clone()));

        let token = CancelToken::new();
        token.cancel();
        match pool.lease(&token, None) {
            Err(Error::Cancelled) => {}
            other => panic!("unexpected lease result: {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn cancel_without_abort_keeps_the_session() {
        let pool = pool(1);
        drop(Lease::pooled(session(b""), pool.inner.clone()));

        let token = CancelToken::new();
        let lease = pool.lease(&token, None).unwrap();
        // nothing was armed on the mock, so nothing was torn down
        token.cancel();
        drop(lease);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn detached_lease_derefs_to_session() {
        let mut lease = Lease::detached(session(b"a2 OK NOOP completed\r\n"));
        lease.noop().unwrap();
    }
}

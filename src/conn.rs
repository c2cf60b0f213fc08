use std::fmt::{Debug, Formatter};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use native_tls::TlsStream;
use tracing::{trace, warn};

use crate::cancel::{CancelToken, HookId};
use crate::error::{Error, Result};

/// Must be implemented for a transport in order for operations running over it to honour a
/// timeout.
pub trait SetReadTimeout {
    /// Set the timeout for subsequent reads to the given one.
    ///
    /// If `timeout` is `None`, the read timeout should be removed.
    ///
    /// See also `std::net::TcpStream::set_read_timeout`.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
}

impl SetReadTimeout for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        TcpStream::set_read_timeout(self, timeout).map_err(Error::Io)
    }
}

impl SetReadTimeout for TlsStream<TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        SetReadTimeout::set_read_timeout(self.get_mut(), timeout)
    }
}

/// A handle that can tear down a connection from another thread.
///
/// Aborting shuts the underlying socket down in both directions, so a blocked read on the
/// connection returns immediately with an error.
#[derive(Debug)]
pub struct AbortHandle(TcpStream);

impl AbortHandle {
    /// Make a handle that aborts the given socket.
    pub fn new(socket: &TcpStream) -> Result<Self> {
        Ok(AbortHandle(socket.try_clone()?))
    }

    /// Shut the connection down.
    pub fn abort(&self) {
        match self.0.shutdown(Shutdown::Both) {
            Ok(()) => trace!("connection aborted"),
            // the socket may already be closed
            Err(e) => trace!("abort: {}", e),
        }
    }
}

/// An [`AbortHandle`] armed on a cancel token for as long as a connection is in use.
///
/// Dropping the registration removes the hook.
pub(crate) struct AbortRegistration {
    token: CancelToken,
    hook: Option<HookId>,
    fired: bool,
}

impl AbortRegistration {
    /// Aborts `handle` when `token` is cancelled, right away if it already is.
    pub(crate) fn new(token: &CancelToken, handle: AbortHandle) -> Self {
        let hook = token.on_cancel(move || handle.abort());
        AbortRegistration {
            token: token.clone(),
            fired: hook.is_none(),
            hook,
        }
    }

    /// Removes the hook. Returns whether it ran, in which case the connection is gone.
    pub(crate) fn disarm(&mut self) -> bool {
        if let Some(hook) = self.hook.take() {
            if !self.token.remove(hook) {
                self.fired = true;
            }
        }
        self.fired
    }
}

impl Drop for AbortRegistration {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Transports that can hand out an [`AbortHandle`].
pub trait Abort {
    /// A handle that aborts this transport, if it supports aborting.
    fn abort_handle(&self) -> Option<AbortHandle>;
}

impl Abort for TcpStream {
    fn abort_handle(&self) -> Option<AbortHandle> {
        match AbortHandle::new(self) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("cannot clone socket for aborting: {}", e);
                None
            }
        }
    }
}

impl Abort for TlsStream<TcpStream> {
    fn abort_handle(&self) -> Option<AbortHandle> {
        self.get_ref().abort_handle()
    }
}

/// Imap connection trait of a read/write stream
pub trait ImapConnection: Read + Write + Send + SetReadTimeout + Abort + private::Sealed {}

impl<T> ImapConnection for T where T: Read + Write + Send + SetReadTimeout + Abort {}

impl Debug for dyn ImapConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Imap connection")
    }
}

/// A boxed connection type
pub type Connection = Box<dyn ImapConnection>;

mod private {
    use super::{Abort, Read, SetReadTimeout, Write};

    pub trait Sealed {}

    impl<T> Sealed for T where T: Read + Write + SetReadTimeout + Abort {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::net::TcpListener;

    #[test]
    fn abort_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let handle = client.abort_handle().unwrap();
        let reader = std::thread::spawn(move || {
            let mut client = client;
            let mut buf = [0u8; 16];
            client.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(50));
        handle.abort();
        match reader.join().unwrap() {
            Ok(0) => {}
            Ok(n) => panic!("read {} bytes from an aborted socket", n),
            Err(e) => assert_ne!(e.kind(), ErrorKind::WouldBlock),
        }
    }

    #[test]
    fn registration_reports_whether_it_fired() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let token = CancelToken::new();
        let mut untouched = AbortRegistration::new(&token, client.abort_handle().unwrap());
        assert!(!untouched.disarm());
        token.cancel();
        // removed before the cancel, so the socket is still fine
        assert!(!untouched.disarm());
        let mut buf = [0u8; 1];
        client.set_nonblocking(true).unwrap();
        assert_eq!(
            (&client).read(&mut buf).unwrap_err().kind(),
            ErrorKind::WouldBlock
        );

        let token = CancelToken::new();
        let mut armed = AbortRegistration::new(&token, client.abort_handle().unwrap());
        token.cancel();
        assert!(armed.disarm());

        let late = AbortRegistration::new(&token, client.abort_handle().unwrap());
        assert!(late.fired);
    }

    #[test]
    fn read_timeout_applies_to_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        SetReadTimeout::set_read_timeout(&mut client, Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        ));
    }
}

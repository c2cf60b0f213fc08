use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::client::Client;
use crate::conn::{Abort, AbortRegistration, Connection};
use crate::error::{Error, Result};

/// How the builder secures the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionMode {
    /// TLS on port 993, otherwise `STARTTLS` when the server advertises it, otherwise
    /// plaintext.
    #[default]
    AutoTls,
    /// TLS from the first byte.
    Tls,
    /// A plaintext connection upgraded with `STARTTLS` before anything else is sent.
    StartTls,
    /// No encryption at all.
    Plaintext,
}

/// A convenience builder for [`Client`] structs over the supported transports.
///
/// ```no_run
/// # use imap_operation::{ClientBuilder, ConnectionMode};
/// # fn main() -> Result<(), imap_operation::Error> {
/// let client = ClientBuilder::new("imap.example.com", 143)
///     .mode(ConnectionMode::StartTls)
///     .connect()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ClientBuilder {
    domain: String,
    port: u16,
    mode: ConnectionMode,
    skip_tls_verify: bool,
    connect_timeout: Option<Duration>,
}

impl ClientBuilder {
    /// Make a new `ClientBuilder` using the given domain and port.
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        ClientBuilder {
            domain: domain.into(),
            port,
            mode: ConnectionMode::default(),
            skip_tls_verify: false,
            connect_timeout: None,
        }
    }

    /// Choose how the connection is secured.
    pub fn mode(&mut self, mode: ConnectionMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Accept invalid certificates and host names.
    ///
    /// Only meant for test servers with self-signed certificates.
    pub fn danger_skip_tls_verify(&mut self, skip: bool) -> &mut Self {
        self.skip_tls_verify = skip;
        self
    }

    /// Give up on establishing the TCP connection after `timeout`.
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// The server host name.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Return a new [`Client`] whose greeting has been read.
    pub fn connect(&self) -> Result<Client<Connection>> {
        self.open(None, None).map(|(client, _)| client)
    }

    /// Connects on behalf of an operation.
    ///
    /// `timeout` bounds the TCP connect, unless a connect timeout is configured, and every
    /// read of the handshake. Once the socket exists, cancelling `cancel` shuts it down; the
    /// returned registration keeps that hook in place.
    pub(crate) fn open(
        &self,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<(Client<Connection>, Option<AbortRegistration>)> {
        if cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        let tcp = self.tcp(timeout)?;
        let abort = cancel.and_then(|token| {
            tcp.abort_handle()
                .map(|handle| AbortRegistration::new(token, handle))
        });
        tcp.set_read_timeout(timeout).map_err(Error::Io)?;
        debug!(domain = %self.domain, port = self.port, mode = ?self.mode, "connected");

        Ok((self.handshake(tcp)?, abort))
    }

    fn handshake(&self, tcp: TcpStream) -> Result<Client<Connection>> {
        match self.mode {
            ConnectionMode::Plaintext => greet(Box::new(tcp)),
            ConnectionMode::Tls => greet(Box::new(self.tls(tcp)?)),
            ConnectionMode::StartTls => {
                let mut client = Client::new(tcp);
                client.read_greeting()?;
                self.starttls(client)
            }
            ConnectionMode::AutoTls if self.port == 993 => greet(Box::new(self.tls(tcp)?)),
            ConnectionMode::AutoTls => {
                let mut client = Client::new(tcp);
                client.read_greeting()?;
                if client.capabilities()?.has("STARTTLS") {
                    self.starttls(client)
                } else {
                    debug!("server does not offer STARTTLS, staying in plaintext");
                    client.map_stream(|tcp| Box::new(tcp) as Connection)
                }
            }
        }
    }

    fn tcp(&self, fallback: Option<Duration>) -> Result<TcpStream> {
        let addr = (self.domain.as_str(), self.port);
        match self.connect_timeout.or(fallback) {
            None => TcpStream::connect(addr).map_err(Error::Connect),
            Some(timeout) => {
                let mut last_err = None;
                for addr in addr.to_socket_addrs().map_err(Error::Connect)? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(tcp) => return Ok(tcp),
                        Err(e) => {
                            trace!("cannot connect to {}: {}", addr, e);
                            last_err = Some(e);
                        }
                    }
                }
                Err(Error::Connect(last_err.unwrap_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "host name resolved to no addresses",
                    )
                })))
            }
        }
    }

    fn tls(&self, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .danger_accept_invalid_hostnames(self.skip_tls_verify)
            .build()?;
        Ok(connector.connect(&self.domain, tcp)?)
    }

    fn starttls(&self, mut client: Client<TcpStream>) -> Result<Client<Connection>> {
        client.run_command_and_check_ok("STARTTLS")?;
        let tls = self.tls(client.into_inner()?)?;
        Ok(Client::new(Box::new(tls)))
    }
}

fn greet(stream: Connection) -> Result<Client<Connection>> {
    let mut client = Client::new(stream);
    client.read_greeting()?;
    Ok(client)
}

impl<T: Read + Write> Client<T> {
    /// Swaps the transport while keeping the command tag sequence.
    pub(crate) fn map_stream<U, F>(self, f: F) -> Result<Client<U>>
    where
        U: Read + Write,
        F: FnOnce(T) -> U,
    {
        let (stream, tag) = self.into_parts()?;
        Ok(Client::from_parts(f(stream), tag))
    }
}

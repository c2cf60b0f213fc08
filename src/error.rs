//! IMAP error types.
//!
//! Two layers of errors live here. [`Error`] is what the session and transport layers produce
//! while talking to a server. [`OperationError`] is the immutable `(domain, code, detail)` value
//! an [`Operation`](crate::operation::Operation) delivers to its completion callback; every
//! [`Error`] translates into one.

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::net::TcpStream;
use std::result;
use std::str::Utf8Error;

use base64::DecodeError;
use bufstream::IntoInnerError as BufError;
use native_tls::Error as TlsError;
use native_tls::HandshakeError as TlsHandshakeError;
use thiserror::Error;

/// A convenience wrapper around `Result` for `imap_operation::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while talking to an IMAP server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The TCP connection to the server could not be established.
    #[error("cannot connect to imap server: {0}")]
    Connect(#[source] IoError),
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error(transparent)]
    Io(#[from] IoError),
    /// An error from the `native_tls` library during the TLS handshake.
    #[error(transparent)]
    TlsHandshake(#[from] TlsHandshakeError<TcpStream>),
    /// An error from the `native_tls` library while managing the socket.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// A BAD response from the IMAP server.
    #[error("bad response: {0}")]
    Bad(String),
    /// A NO response from the IMAP server.
    #[error("no response: {0}")]
    No(String),
    /// The server closed the connection with a BYE response.
    #[error("connection closed by server: {0}")]
    Bye(String),
    /// The connection was terminated unexpectedly.
    #[error("connection lost")]
    ConnectionLost,
    /// Error parsing a server response.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Command inputs were not valid [IMAP
    /// strings](https://tools.ietf.org/html/rfc3501#section-4.3).
    #[error(transparent)]
    Validate(#[from] ValidateError),
    /// The server rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// No credentials were available to authenticate a new session.
    #[error("no credentials configured")]
    NotAuthenticated,
    /// The server refused to accept the message literal of an APPEND.
    #[error("could not append mail to mailbox")]
    Append,
    /// The caller's cancel token fired before a connection could be handed out.
    #[error("cancelled while connecting")]
    Cancelled,
}

impl<T> From<BufError<T>> for Error {
    fn from(err: BufError<T>) -> Error {
        Error::Io(err.into())
    }
}

/// An error occured while trying to parse a server response.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Indicates an error parsing the status response. Such as OK, NO, and BAD.
    #[error("unable to parse status response")]
    Invalid(Vec<u8>),
    /// The client could not find or decode the server's authentication challenge.
    #[error("unable to parse authentication response: {0}")]
    Authentication(String, #[source] Option<DecodeError>),
    /// The client received data that was not UTF-8 encoded.
    #[error("unable to parse data as UTF-8 text")]
    DataNotUtf8(Vec<u8>, #[source] Utf8Error),
    /// The server answered with a well-formed response the command does not allow.
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// An [invalid character](https://tools.ietf.org/html/rfc3501#section-4.3) was found in a
/// command argument.
#[derive(Debug, Error)]
#[error("invalid character in input: {0:?}")]
pub struct ValidateError(pub char);

/// The category of an [`OperationError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorDomain {
    /// Transport-level failure.
    Network,
    /// Malformed or unexpected server data, or a command the server refused.
    Protocol,
    /// Credential rejection.
    Auth,
    /// The operation was stopped by a caller request.
    Cancellation,
    /// Uncategorized failures and programming errors.
    Generic,
}

impl fmt::Display for ErrorDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorDomain::Network => "network",
            ErrorDomain::Protocol => "protocol",
            ErrorDomain::Auth => "auth",
            ErrorDomain::Cancellation => "cancellation",
            ErrorDomain::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// The domain-specific discriminator of an [`OperationError`].
///
/// Each code belongs to exactly one [`ErrorDomain`], see [`ErrorCode::domain`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The TCP connection could not be established.
    ConnectionFailed,
    /// The server did not answer within the configured duration.
    Timeout,
    /// TLS could not be negotiated or failed mid-stream.
    TlsFailure,
    /// The connection broke after it was established.
    ConnectionLost,
    /// The server sent data that could not be parsed.
    ParseError,
    /// The server sent a well-formed response the command does not allow.
    UnexpectedResponse,
    /// The server answered BAD, or the command could not be encoded.
    BadCommand,
    /// The server answered NO.
    Rejected,
    /// The server rejected the credentials.
    AuthenticationFailed,
    /// The operation needs an authenticated session but no credentials are configured.
    AuthenticationRequired,
    /// The operation was cancelled.
    Cancelled,
    /// Anything else; the detail text says what.
    Unknown,
    /// An operation was used in a way its current state does not allow.
    InvalidState,
    /// The operation needs a connection but was built without a provider.
    NoProvider,
}

impl ErrorCode {
    /// The domain this code belongs to.
    pub fn domain(self) -> ErrorDomain {
        use self::ErrorCode::*;
        match self {
            ConnectionFailed | Timeout | TlsFailure | ConnectionLost => ErrorDomain::Network,
            ParseError | UnexpectedResponse | BadCommand | Rejected => ErrorDomain::Protocol,
            AuthenticationFailed | AuthenticationRequired => ErrorDomain::Auth,
            Cancelled => ErrorDomain::Cancellation,
            Unknown | InvalidState | NoProvider => ErrorDomain::Generic,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The terminal failure of an operation.
///
/// An `OperationError` is an immutable `(domain, code, detail)` triple. The domain is derived
/// from the code, so the two can never disagree. Cancellation is reported as an
/// `OperationError` too (see [`OperationError::is_cancelled`]), which gives callers a single code
/// path for every terminal outcome.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{domain} error ({code}){}", detail_suffix(.detail))]
pub struct OperationError {
    domain: ErrorDomain,
    code: ErrorCode,
    detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {}", detail),
        None => String::new(),
    }
}

impl OperationError {
    /// Make an error without detail text.
    pub fn new(code: ErrorCode) -> Self {
        OperationError {
            domain: code.domain(),
            code,
            detail: None,
        }
    }

    /// Make an error carrying human-readable detail text.
    pub fn with_detail(code: ErrorCode, detail: impl Into<String>) -> Self {
        OperationError {
            domain: code.domain(),
            code,
            detail: Some(detail.into()),
        }
    }

    /// The error delivered to operations stopped by [`cancel`](crate::Operation::cancel).
    pub fn cancelled() -> Self {
        OperationError::new(ErrorCode::Cancelled)
    }

    pub(crate) fn invalid_state(detail: impl Into<String>) -> Self {
        OperationError::with_detail(ErrorCode::InvalidState, detail)
    }

    /// The failure category.
    pub fn domain(&self) -> ErrorDomain {
        self.domain
    }

    /// The failure discriminator.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Optional human-readable detail.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Whether this error reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    /// Whether the connection that produced this error may be out of step with the server.
    ///
    /// Transport failures leave it dead. A parse failure or an unexpected tag abandons a
    /// response halfway, leaving its remaining lines unread.
    pub(crate) fn breaks_connection(&self) -> bool {
        self.domain == ErrorDomain::Network
            || matches!(
                self.code,
                ErrorCode::ParseError | ErrorCode::UnexpectedResponse
            )
    }
}

impl From<Error> for OperationError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::Connect(_) => ErrorCode::ConnectionFailed,
            Error::Io(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                ErrorCode::Timeout
            }
            Error::Io(_) | Error::Bye(_) | Error::ConnectionLost => ErrorCode::ConnectionLost,
            Error::Tls(_) | Error::TlsHandshake(_) => ErrorCode::TlsFailure,
            Error::Parse(ParseError::Unexpected(_)) => ErrorCode::UnexpectedResponse,
            Error::Parse(_) => ErrorCode::ParseError,
            Error::Bad(_) | Error::Validate(_) => ErrorCode::BadCommand,
            Error::No(_) | Error::Append => ErrorCode::Rejected,
            Error::Authentication(_) => ErrorCode::AuthenticationFailed,
            Error::NotAuthenticated => ErrorCode::AuthenticationRequired,
            Error::Cancelled => ErrorCode::Cancelled,
        };
        OperationError::with_detail(code, err.to_string())
    }
}

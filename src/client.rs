use std::io::{BufRead, Read, Write};
use std::str;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bufstream::BufStream;
use chrono::{DateTime, FixedOffset};
use imap_proto::{Response, Status};
use tracing::{debug, trace};

use super::authenticator::Authenticator;
use super::error::{Error, ParseError, Result, ValidateError};
use super::parse::{
    parse_authenticate_response, parse_capabilities, parse_expunge, parse_fetches,
    parse_mailbox, parse_noop,
};
use super::types::*;
use super::utils::iter_join;

static TAG_PREFIX: &str = "a";
const INITIAL_TAG: u32 = 0;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

macro_rules! quote {
    ($x:expr) => {
        format!("\"{}\"", $x.replace(r"\", r"\\").replace("\"", "\\\""))
    };
}

pub(crate) fn validate_str(value: &str) -> Result<String> {
    let quoted = quote!(value);
    if quoted.contains('\n') {
        return Err(Error::Validate(ValidateError('\n')));
    }
    if quoted.contains('\r') {
        return Err(Error::Validate(ValidateError('\r')));
    }
    Ok(quoted)
}

/// The command stream shared by [`Client`] and [`Session`]: tagging, line I/O and
/// tagged-response collection.
#[derive(Debug)]
struct ImapStream<T: Read + Write> {
    stream: BufStream<T>,
    tag: u32,
    bye: Option<String>,
}

impl<T: Read + Write> ImapStream<T> {
    fn new(stream: T) -> Self {
        ImapStream {
            stream: BufStream::new(stream),
            tag: INITIAL_TAG,
            bye: None,
        }
    }

    fn run_command_and_check_ok(&mut self, command: &str) -> Result<()> {
        self.run_command_and_read_response(command).map(|_| ())
    }

    fn run_command(&mut self, untagged_command: &str) -> Result<()> {
        let command = self.create_command(untagged_command);
        if untagged_command.starts_with("LOGIN ") {
            trace!("C: {}{} LOGIN <redacted>", TAG_PREFIX, self.tag);
        } else {
            trace!("C: {}", command);
        }
        self.write_line(command.as_bytes())
    }

    fn run_command_and_read_response(&mut self, untagged_command: &str) -> Result<Vec<u8>> {
        self.run_command(untagged_command)?;
        self.read_response()
    }

    fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        self.read_response_onto(&mut v)?;
        Ok(v)
    }

    /// Reads lines into `data` until the tagged completion of the last command arrives.
    ///
    /// On `OK` the tagged line is dropped and `data` holds the untagged responses that preceded
    /// it. A line that ends inside a literal is completed by reading further lines.
    fn read_response_onto(&mut self, data: &mut Vec<u8>) -> Result<()> {
        let mut continue_from = None;
        let mut try_first = !data.is_empty();
        let match_tag = format!("{}{}", TAG_PREFIX, self.tag);
        loop {
            let line_start = if try_first {
                try_first = false;
                0
            } else {
                let start_new = data.len();
                self.readline(data)?;
                continue_from.take().unwrap_or(start_new)
            };

            let break_with = {
                let line = &data[line_start..];

                match imap_proto::parser::parse_response(line) {
                    Ok((
                        _,
                        Response::Done {
                            tag,
                            status,
                            information,
                            ..
                        },
                    )) => {
                        let information = information
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "no explanation given".to_string());
                        if tag.0 != match_tag {
                            Some(Err(Error::Parse(ParseError::Unexpected(format!(
                                "response tagged {} while waiting for {}",
                                tag.0, match_tag
                            )))))
                        } else {
                            Some(match status {
                                Status::Ok => Ok(()),
                                Status::Bad => Err(Error::Bad(information)),
                                Status::No => Err(Error::No(information)),
                                status => Err(Error::Parse(ParseError::Unexpected(format!(
                                    "tagged {:?} status",
                                    status
                                )))),
                            })
                        }
                    }
                    Ok((
                        _,
                        Response::Data {
                            status: Status::Bye,
                            information,
                            ..
                        },
                    )) => {
                        let reason = information
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "no reason given".to_string());
                        debug!("server said goodbye: {}", reason);
                        self.bye = Some(reason);
                        None
                    }
                    Ok(..) => None,
                    Err(nom::Err::Incomplete(..)) => {
                        continue_from = Some(line_start);
                        None
                    }
                    Err(_) => Some(Err(Error::Parse(ParseError::Invalid(line.to_vec())))),
                }
            };

            match break_with {
                Some(Ok(())) => {
                    data.truncate(line_start);
                    break Ok(());
                }
                Some(Err(e)) => break Err(e),
                None => {}
            }
        }
    }

    fn readline(&mut self, into: &mut Vec<u8>) -> Result<usize> {
        let read = self.stream.read_until(LF, into)?;
        if read == 0 {
            return Err(match self.bye.take() {
                Some(reason) => Error::Bye(reason),
                None => Error::ConnectionLost,
            });
        }

        let line = &into[into.len() - read..];
        trace!("S: {}", String::from_utf8_lossy(line).trim_end());

        Ok(read)
    }

    fn create_command(&mut self, command: &str) -> String {
        self.tag += 1;
        format!("{}{} {}", TAG_PREFIX, self.tag, command)
    }

    fn write_line(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.write_all(&[CR, LF])?;
        self.stream.flush()?;
        Ok(())
    }
}

/// An unauthenticated connection to an IMAP server.
///
/// Call [`Client::login`] or [`Client::authenticate`] to turn it into a [`Session`].
#[derive(Debug)]
pub struct Client<T: Read + Write> {
    conn: ImapStream<T>,
}

impl<T: Read + Write> Client<T> {
    /// Creates a new client over the given stream.
    ///
    /// The server greeting has not been read yet; see [`Client::read_greeting`].
    pub fn new(stream: T) -> Client<T> {
        Client {
            conn: ImapStream::new(stream),
        }
    }

    /// Reads the server greeting.
    ///
    /// A greeting of `BYE` means the server refuses the connection.
    pub fn read_greeting(&mut self) -> Result<()> {
        let mut v = Vec::new();
        self.conn.readline(&mut v)?;
        match imap_proto::parser::parse_response(&v) {
            Ok((
                _,
                Response::Data {
                    status: Status::Bye,
                    information,
                    ..
                },
            )) => Err(Error::Bye(
                information
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "no reason given".to_string()),
            )),
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Parse(ParseError::Invalid(v.clone()))),
        }
    }

    /// Requests the capabilities the server advertises before authentication.
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        self.conn
            .run_command_and_read_response("CAPABILITY")
            .and_then(|lines| parse_capabilities(&lines))
    }

    pub(crate) fn run_command_and_check_ok(&mut self, command: &str) -> Result<()> {
        self.conn.run_command_and_check_ok(command)
    }

    /// Log in to the IMAP server.
    ///
    /// A `NO` from the server is reported as [`Error::Authentication`].
    pub fn login(mut self, username: &str, password: &str) -> Result<Session<T>> {
        let command = format!(
            "LOGIN {} {}",
            validate_str(username)?,
            validate_str(password)?
        );
        match self.conn.run_command_and_check_ok(&command) {
            Ok(()) => Ok(Session::new(self.conn)),
            Err(Error::No(reason)) => Err(Error::Authentication(reason)),
            Err(e) => Err(e),
        }
    }

    /// Authenticate with the server using the given SASL mechanism.
    ///
    /// Each challenge is base64-decoded before it is handed to the authenticator, and each
    /// response is base64-encoded before it is sent.
    pub fn authenticate<A: Authenticator>(
        mut self,
        auth_type: &str,
        authenticator: &A,
    ) -> Result<Session<T>> {
        self.conn
            .run_command(&format!("AUTHENTICATE {}", auth_type))?;

        loop {
            let mut line = Vec::new();
            self.conn.readline(&mut line)?;

            if line.starts_with(b"+") {
                let line_str = str::from_utf8(&line)
                    .map_err(|e| Error::Parse(ParseError::DataNotUtf8(line.clone(), e)))?;
                let data = parse_authenticate_response(line_str)?;
                let challenge = BASE64.decode(data).map_err(|e| {
                    Error::Parse(ParseError::Authentication(data.to_string(), Some(e)))
                })?;

                let raw_response = authenticator.process(&challenge);
                let auth_response = BASE64.encode(raw_response.as_ref());
                trace!("C: <sasl response>");
                self.conn.write_line(auth_response.as_bytes())?;
            } else {
                return match self.conn.read_response_onto(&mut line) {
                    Ok(()) => Ok(Session::new(self.conn)),
                    Err(Error::No(reason)) => Err(Error::Authentication(reason)),
                    Err(e) => Err(e),
                };
            }
        }
    }

    /// Unwraps the client, returning the underlying stream.
    ///
    /// Fails if buffered output cannot be flushed.
    pub fn into_inner(self) -> Result<T> {
        Ok(self.conn.stream.into_inner()?)
    }

    pub(crate) fn into_parts(self) -> Result<(T, u32)> {
        let tag = self.conn.tag;
        Ok((self.conn.stream.into_inner()?, tag))
    }

    pub(crate) fn from_parts(stream: T, tag: u32) -> Self {
        let mut conn = ImapStream::new(stream);
        conn.tag = tag;
        Client { conn }
    }
}

/// An authenticated IMAP session.
#[derive(Debug)]
pub struct Session<T: Read + Write> {
    conn: ImapStream<T>,
}

impl<T: Read + Write> Session<T> {
    fn new(conn: ImapStream<T>) -> Self {
        Session { conn }
    }

    /// Capability requests a listing of capabilities that the server supports.
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        self.conn
            .run_command_and_read_response("CAPABILITY")
            .and_then(|lines| parse_capabilities(&lines))
    }

    /// Noop always succeeds, and it does nothing.
    ///
    /// Unilateral server data that arrives with the reply is skipped.
    pub fn noop(&mut self) -> Result<()> {
        self.conn
            .run_command_and_read_response("NOOP")
            .and_then(|lines| parse_noop(&lines))
    }

    /// Selects a mailbox
    pub fn select(&mut self, mailbox_name: &str) -> Result<Mailbox> {
        self.conn
            .run_command_and_read_response(&format!("SELECT {}", validate_str(mailbox_name)?))
            .and_then(|lines| parse_mailbox(&lines))
    }

    /// Examine is identical to Select, but the selected mailbox is identified as read-only
    pub fn examine(&mut self, mailbox_name: &str) -> Result<Mailbox> {
        self.conn
            .run_command_and_read_response(&format!("EXAMINE {}", validate_str(mailbox_name)?))
            .and_then(|lines| parse_mailbox(&lines))
    }

    /// Fetch retrieves data associated with a set of messages in the selected mailbox.
    pub fn fetch(&mut self, sequence_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.conn
            .run_command_and_read_response(&format!("FETCH {} {}", sequence_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// Equivalent to [`Session::fetch`], except that all identifiers in `uid_set` are [`Uid`]s.
    pub fn uid_fetch(&mut self, uid_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.conn
            .run_command_and_read_response(&format!("UID FETCH {} {}", uid_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// Store alters data associated with a message in the mailbox.
    pub fn store(&mut self, sequence_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.conn
            .run_command_and_read_response(&format!("STORE {} {}", sequence_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// Equivalent to [`Session::store`], except that all identifiers in `uid_set` are [`Uid`]s.
    pub fn uid_store(&mut self, uid_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.conn
            .run_command_and_read_response(&format!("UID STORE {} {}", uid_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// Copy copies the specified messages to the end of the specified destination mailbox.
    pub fn copy(&mut self, sequence_set: &str, mailbox_name: &str) -> Result<()> {
        self.conn.run_command_and_check_ok(&format!(
            "COPY {} {}",
            sequence_set,
            validate_str(mailbox_name)?
        ))
    }

    /// Equivalent to [`Session::copy`], except that all identifiers in `uid_set` are [`Uid`]s.
    pub fn uid_copy(&mut self, uid_set: &str, mailbox_name: &str) -> Result<()> {
        self.conn.run_command_and_check_ok(&format!(
            "UID COPY {} {}",
            uid_set,
            validate_str(mailbox_name)?
        ))
    }

    /// The APPEND command adds a mail to a mailbox.
    ///
    /// `flags` are set on the new message, and `date` becomes its internal date when given.
    pub fn append(
        &mut self,
        mailbox_name: &str,
        content: &[u8],
        flags: &[Flag],
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        let mut command = format!("APPEND {}", validate_str(mailbox_name)?);
        if !flags.is_empty() {
            command.push_str(&format!(" ({})", iter_join(flags, " ")));
        }
        if let Some(date) = date {
            command.push_str(&format!(" \"{}\"", date.format("%d-%b-%Y %H:%M:%S %z")));
        }
        command.push_str(&format!(" {{{}}}", content.len()));

        self.conn.run_command(&command)?;
        let mut v = Vec::new();
        self.conn.readline(&mut v)?;
        if !v.starts_with(b"+") {
            // a tagged NO or BAD is more informative than a bare refusal
            self.conn.read_response_onto(&mut v)?;
            return Err(Error::Append);
        }
        self.conn.stream.write_all(content)?;
        self.conn.write_line(b"")?;
        self.conn.read_response().map(|_| ())
    }

    /// Expunge permanently removes all messages that have the \Deleted flag set from the currently
    /// selected mailbox.
    ///
    /// Returns the sequence numbers reported as expunged, in the order the server sent them.
    pub fn expunge(&mut self) -> Result<Vec<Seq>> {
        self.conn
            .run_command_and_read_response("EXPUNGE")
            .and_then(|lines| parse_expunge(&lines))
    }

    /// Create creates a mailbox with the given name.
    pub fn create(&mut self, mailbox_name: &str) -> Result<()> {
        self.conn
            .run_command_and_check_ok(&format!("CREATE {}", validate_str(mailbox_name)?))
    }

    /// Delete permanently removes the mailbox with the given name.
    pub fn delete(&mut self, mailbox_name: &str) -> Result<()> {
        self.conn
            .run_command_and_check_ok(&format!("DELETE {}", validate_str(mailbox_name)?))
    }

    /// Rename changes the name of a mailbox.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.conn.run_command_and_check_ok(&format!(
            "RENAME {} {}",
            validate_str(from)?,
            validate_str(to)?
        ))
    }

    /// Logout informs the server that the client is done with the connection.
    pub fn logout(&mut self) -> Result<()> {
        self.conn.run_command_and_check_ok("LOGOUT")
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &T {
        self.conn.stream.get_ref()
    }

    /// The underlying stream.
    ///
    /// Reading from or writing to it directly desynchronizes the session.
    pub fn get_mut(&mut self) -> &mut T {
        self.conn.stream.get_mut()
    }
}

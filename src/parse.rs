use imap_proto::{MailboxDatum, Response, ResponseCode, Status};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{trace, warn};

use super::error::{Error, ParseError, Result};
use super::types::*;

lazy_static! {
    static ref AUTH_RESP_REGEX: Regex = Regex::new("^\\+ ?(.*)\r\n").unwrap();
}

pub(crate) fn parse_authenticate_response(line: &str) -> Result<&str> {
    if let Some(cap) = AUTH_RESP_REGEX.captures(line) {
        let data = cap.get(1).map(|x| x.as_str()).unwrap_or("");
        return Ok(data);
    }

    Err(Error::Parse(ParseError::Authentication(line.to_string(), None)))
}

enum MapOrNot<'a, T> {
    Map(T),
    Not(Response<'a>),
}

fn parse_many<'a, T, F>(mut lines: &'a [u8], mut map: F) -> Result<Vec<T>>
where
    F: FnMut(Response<'a>) -> Result<MapOrNot<'a, T>>,
{
    let mut things = Vec::new();
    loop {
        if lines.is_empty() {
            break Ok(things);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, resp)) => {
                lines = rest;

                match map(resp)? {
                    MapOrNot::Map(t) => things.push(t),
                    MapOrNot::Not(resp) => {
                        if let Some(resp) = handle_unilateral(resp) {
                            break Err(unexpected(&resp));
                        }
                    }
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

pub(crate) fn parse_fetches(lines: &[u8]) -> Result<Vec<Fetch>> {
    parse_many(lines, |resp| match resp {
        Response::Fetch(num, attrs) => Ok(MapOrNot::Map(Fetch::from_attributes(num, attrs))),
        resp => Ok(MapOrNot::Not(resp)),
    })
}

pub(crate) fn parse_expunge(lines: &[u8]) -> Result<Vec<Seq>> {
    parse_many(lines, |resp| match resp {
        Response::Expunge(id) => Ok(MapOrNot::Map(id)),
        resp => Ok(MapOrNot::Not(resp)),
    })
}

pub(crate) fn parse_noop(lines: &[u8]) -> Result<()> {
    parse_many::<(), _>(lines, |resp| Ok(MapOrNot::Not(resp))).map(|_| ())
}

pub(crate) fn parse_capabilities(mut lines: &[u8]) -> Result<Capabilities> {
    let mut caps = Capabilities::default();
    loop {
        if lines.is_empty() {
            break Ok(caps);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::Capabilities(c))) => {
                lines = rest;
                caps.extend_from(c);
            }
            Ok((rest, data)) => {
                lines = rest;
                if let Some(resp) = handle_unilateral(data) {
                    break Err(unexpected(&resp));
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

pub(crate) fn parse_mailbox(mut lines: &[u8]) -> Result<Mailbox> {
    let mut mailbox = Mailbox::default();

    loop {
        if lines.is_empty() {
            break Ok(mailbox);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::Data { status, code, .. })) => {
                lines = rest;

                if status != Status::Ok {
                    warn!("ignoring untagged {:?} while selecting mailbox", status);
                    continue;
                }

                match code {
                    Some(ResponseCode::UidValidity(uid)) => {
                        mailbox.uid_validity = Some(uid);
                    }
                    Some(ResponseCode::UidNext(unext)) => {
                        mailbox.uid_next = Some(unext);
                    }
                    Some(ResponseCode::Unseen(n)) => {
                        mailbox.unseen = Some(n);
                    }
                    Some(ResponseCode::PermanentFlags(flags)) => {
                        mailbox.permanent_flags.extend(Flag::from_strs(flags));
                    }
                    _ => {}
                }
            }
            Ok((rest, Response::MailboxData(m))) => {
                lines = rest;

                match m {
                    MailboxDatum::Exists(e) => {
                        mailbox.exists = e;
                    }
                    MailboxDatum::Recent(r) => {
                        mailbox.recent = r;
                    }
                    MailboxDatum::Flags(flags) => {
                        mailbox.flags.extend(Flag::from_strs(flags));
                    }
                    other => trace!("ignoring mailbox data {:?}", other),
                }
            }
            Ok((rest, Response::Expunge(n))) => {
                lines = rest;
                trace!("ignoring expunge of message {} while selecting mailbox", n);
            }
            Ok((_, resp)) => {
                break Err(unexpected(&resp));
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

// check if this is simply a unilateral server response
// (see Section 7 of RFC 3501):
fn handle_unilateral(res: Response<'_>) -> Option<Response<'_>> {
    match res {
        Response::MailboxData(MailboxDatum::Status { .. })
        | Response::MailboxData(MailboxDatum::Recent(_))
        | Response::MailboxData(MailboxDatum::Exists(_))
        | Response::Expunge(_)
        | Response::Fetch(..)
        | Response::Data {
            status: Status::Ok, ..
        } => {
            trace!("ignoring unilateral response {:?}", res);
            None
        }
        res => Some(res),
    }
}

fn unexpected(resp: &Response<'_>) -> Error {
    Error::Parse(ParseError::Unexpected(format!("{:?}", resp)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capability_test() {
        let expected_capabilities = vec!["IMAP4rev1", "STARTTLS", "AUTH=GSSAPI", "LOGINDISABLED"];
        let lines = b"* CAPABILITY IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n";
        let capabilities = parse_capabilities(lines).unwrap();
        assert_eq!(capabilities.len(), 4);
        for e in expected_capabilities {
            assert!(capabilities.has(e));
        }
        assert!(capabilities.has_auth("GSSAPI"));
    }

    #[test]
    fn parse_capability_invalid_test() {
        let lines = b"* JUNK IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n";
        assert!(parse_capabilities(lines).is_err());
    }

    #[test]
    fn parse_capabilities_w_unilateral() {
        let lines = b"\
                    * CAPABILITY IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n\
                    * STATUS dev.github (MESSAGES 10 UIDNEXT 11 UIDVALIDITY 1408806928 UNSEEN 0)\r\n\
                    * 4 EXISTS\r\n";
        let capabilities = parse_capabilities(lines).unwrap();
        assert_eq!(capabilities.len(), 4);
    }

    #[test]
    fn parse_fetches_empty() {
        let lines = b"";
        let fetches = parse_fetches(lines).unwrap();
        assert!(fetches.is_empty());
    }

    #[test]
    fn parse_fetches_test() {
        let lines = b"\
                    * 24 FETCH (FLAGS (\\Seen) UID 4827943)\r\n\
                    * 25 FETCH (FLAGS (\\Seen))\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 2);
        assert_eq!(fetches[0].message, 24);
        assert_eq!(fetches[0].flags(), &[Flag::Seen]);
        assert_eq!(fetches[0].uid, Some(4827943));
        assert_eq!(fetches[0].body(), None);
        assert_eq!(fetches[0].header(), None);
        assert_eq!(fetches[1].message, 25);
        assert_eq!(fetches[1].flags(), &[Flag::Seen]);
        assert_eq!(fetches[1].uid, None);
    }

    #[test]
    fn parse_fetches_body() {
        let lines = b"* 2 FETCH (UID 7 RFC822.SIZE 3 BODY[] {3}\r\nfoo)\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].uid, Some(7));
        assert_eq!(fetches[0].size, Some(3));
        assert_eq!(fetches[0].body(), Some(&b"foo"[..]));
    }

    #[test]
    fn parse_fetches_w_unilateral() {
        // https://github.com/mattnenterprise/rust-imap/issues/81
        let lines = b"\
            * 37 FETCH (UID 74)\r\n\
            * 1 RECENT\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].message, 37);
        assert_eq!(fetches[0].uid, Some(74));
    }

    #[test]
    fn parse_fetches_rejects_foreign_data() {
        let lines = b"* CAPABILITY IMAP4rev1\r\n";
        match parse_fetches(lines) {
            Err(Error::Parse(ParseError::Unexpected(_))) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn parse_expunge_test() {
        let lines = b"* 3 EXPUNGE\r\n* 3 EXPUNGE\r\n* 5 EXPUNGE\r\n";
        assert_eq!(parse_expunge(lines).unwrap(), vec![3, 3, 5]);
    }

    #[test]
    fn parse_mailbox_test() {
        let lines = b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
            * OK [PERMANENTFLAGS (\\* \\Answered \\Flagged \\Deleted \\Draft \\Seen)] Limited\r\n\
            * 1 EXISTS\r\n\
            * 1 RECENT\r\n\
            * OK [UNSEEN 1] First unseen.\r\n\
            * OK [UIDVALIDITY 1257842737] UIDs valid\r\n\
            * OK [UIDNEXT 2] Predicted next UID\r\n";
        let mailbox = parse_mailbox(lines).unwrap();
        assert_eq!(mailbox.exists, 1);
        assert_eq!(mailbox.recent, 1);
        assert_eq!(mailbox.unseen, Some(1));
        assert_eq!(mailbox.uid_next, Some(2));
        assert_eq!(mailbox.uid_validity, Some(1257842737));
        assert_eq!(mailbox.flags.len(), 5);
        assert_eq!(mailbox.permanent_flags[0], Flag::MayCreate);
    }

    #[test]
    fn parse_authenticate_challenge() {
        assert_eq!(parse_authenticate_response("+ Zm9v\r\n").unwrap(), "Zm9v");
        assert_eq!(parse_authenticate_response("+\r\n").unwrap(), "");
        assert!(parse_authenticate_response("a1 OK\r\n").is_err());
    }
}

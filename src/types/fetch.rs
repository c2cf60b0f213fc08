use super::{Flag, Seq, Uid};

use imap_proto::types::{AttributeValue, MessageSection, SectionPath};

/// An IMAP [`FETCH` response](https://tools.ietf.org/html/rfc3501#section-7.4.2) that contains
/// data about a particular message. This response occurs as the result of a `FETCH` or `STORE`
/// command, as well as by unilateral server decision (e.g., flag updates).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Fetch {
    /// The ordinal number of this message in its containing mailbox.
    pub message: Seq,

    /// A number expressing the unique identifier of the message.
    pub uid: Option<Uid>,

    /// A number expressing the [RFC-2822](https://tools.ietf.org/html/rfc2822) size of the
    /// message.
    pub size: Option<u32>,

    pub(crate) flags: Vec<Flag>,
    pub(crate) header: Option<Vec<u8>>,
    pub(crate) body: Option<Vec<u8>>,
    pub(crate) text: Option<Vec<u8>>,
    pub(crate) internal_date: Option<String>,
}

impl Fetch {
    pub(crate) fn from_attributes(message: Seq, attrs: Vec<AttributeValue<'_>>) -> Self {
        let mut fetch = Fetch {
            message,
            ..Fetch::default()
        };

        for attr in attrs {
            match attr {
                AttributeValue::Flags(flags) => {
                    fetch.flags.extend(Flag::from_strs(flags));
                }
                AttributeValue::Uid(uid) => fetch.uid = Some(uid),
                AttributeValue::Rfc822Size(sz) => fetch.size = Some(sz),
                AttributeValue::InternalDate(date) => {
                    fetch.internal_date = Some(date.into_owned())
                }
                AttributeValue::Rfc822(Some(body))
                | AttributeValue::BodySection {
                    section: None,
                    data: Some(body),
                    ..
                } => fetch.body = Some(body.into_owned()),
                AttributeValue::Rfc822Header(Some(header))
                | AttributeValue::BodySection {
                    section: Some(SectionPath::Full(MessageSection::Header)),
                    data: Some(header),
                    ..
                } => fetch.header = Some(header.into_owned()),
                AttributeValue::Rfc822Text(Some(text))
                | AttributeValue::BodySection {
                    section: Some(SectionPath::Full(MessageSection::Text)),
                    data: Some(text),
                    ..
                } => fetch.text = Some(text.into_owned()),
                _ => {}
            }
        }

        fetch
    }

    /// A list of flags that are set for this message.
    pub fn flags(&self) -> &[Flag] {
        &self.flags[..]
    }

    /// The bytes that make up the header of this message, if `BODY[HEADER]`, `BODY.PEEK[HEADER]`,
    /// or `RFC822.HEADER` was included in the `query` argument to `FETCH`.
    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// The bytes that make up this message, included if `BODY[]` or `RFC822` are included in the
    /// `query` argument to `FETCH`. The bytes SHOULD be interpreted by the client according to the
    /// content transfer encoding, body type, and subtype.
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// The bytes that make up the text of this message, included if `BODY[TEXT]`, `RFC822.TEXT`,
    /// or `BODY.PEEK[TEXT]` are included in the `query` argument to `FETCH`.
    pub fn text(&self) -> Option<&[u8]> {
        self.text.as_deref()
    }

    /// The internal date of this message, as sent by the server.
    pub fn internal_date(&self) -> Option<&str> {
        self.internal_date.as_deref()
    }
}

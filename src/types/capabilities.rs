use std::collections::hash_set::Iter;
use std::collections::HashSet;

use imap_proto::types::Capability;

/// From [section 7.2.1 of RFC 3501](https://tools.ietf.org/html/rfc3501#section-7.2.1).
///
/// A list of capabilities that the server supports.
/// The capability list will include the atom "IMAP4rev1".
///
/// A capability name which begins with `AUTH=` indicates that the server supports that particular
/// authentication mechanism.
///
/// The `LOGINDISABLED` capability indicates that the `LOGIN` command is disabled, and that the
/// server will respond with a `NO` response to any attempt to use the `LOGIN` command even if the
/// user name and password are valid.  An IMAP client MUST NOT issue the `LOGIN` command if the
/// server advertises the `LOGINDISABLED` capability.
///
/// Client implementations SHOULD NOT require any capability name other than `IMAP4rev1`, and MUST
/// ignore any unknown capability names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(pub(crate) HashSet<String>);

impl Capabilities {
    pub(crate) fn extend_from(&mut self, caps: Vec<Capability<'_>>) {
        self.0.extend(caps.into_iter().map(|cap| match cap {
            Capability::Imap4rev1 => "IMAP4rev1".to_string(),
            Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
            Capability::Atom(atom) => atom.into_owned(),
            #[allow(unreachable_patterns)]
            other => format!("{:?}", other),
        }));
    }

    /// Check if the server has the given capability.
    pub fn has(&self, s: &str) -> bool {
        self.0.contains(s)
    }

    /// Check if the server supports the given `AUTHENTICATE` mechanism.
    pub fn has_auth(&self, mechanism: &str) -> bool {
        self.0.contains(&format!("AUTH={}", mechanism))
    }

    /// Iterate over all the server's capabilities
    pub fn iter(&self) -> Iter<'_, String> {
        self.0.iter()
    }

    /// Returns how many capabilities the server has.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the server purports to have no capabilities.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

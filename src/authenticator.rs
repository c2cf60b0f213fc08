use std::fmt;
use std::io::{Read, Write};

use crate::client::{Client, Session};
use crate::error::Result;

/// This trait allows for pluggable authentication schemes. It is used by [`Client::authenticate`]
/// to [authenticate using SASL](https://tools.ietf.org/html/rfc3501#section-6.2.2).
pub trait Authenticator {
    /// The type of the response to the challenge. This will usually be a `Vec<u8>` or `String`.
    type Response: AsRef<[u8]>;

    /// Each base64-decoded server challenge is passed to `process`.
    /// The returned byte-string is base64-encoded and then sent back to the server.
    fn process(&self, challenge: &[u8]) -> Self::Response;
}

/// The `XOAUTH2` SASL mechanism used by Gmail and Outlook.
pub struct XOAuth2<'a> {
    /// The account to log in to.
    pub user: &'a str,
    /// A bearer token for that account.
    pub access_token: &'a str,
}

impl Authenticator for XOAuth2<'_> {
    type Response = String;

    fn process(&self, _: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// How a [`SessionPool`](crate::SessionPool) authenticates the connections it opens.
#[derive(Clone)]
pub enum Credentials {
    /// Plain `LOGIN` with a password.
    Login {
        /// The account name.
        username: String,
        /// The account password.
        password: String,
    },
    /// SASL `XOAUTH2` with a bearer token.
    XOAuth2 {
        /// The account name.
        username: String,
        /// The bearer token.
        access_token: String,
    },
}

impl Credentials {
    /// Credentials for `LOGIN`.
    pub fn login(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Login {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials for `AUTHENTICATE XOAUTH2`.
    pub fn xoauth2(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Credentials::XOAuth2 {
            username: username.into(),
            access_token: access_token.into(),
        }
    }

    /// The account these credentials log in to.
    pub fn username(&self) -> &str {
        match self {
            Credentials::Login { username, .. } | Credentials::XOAuth2 { username, .. } => username,
        }
    }

    /// Turns a freshly connected client into an authenticated session.
    pub fn authenticate<T: Read + Write>(&self, client: Client<T>) -> Result<Session<T>> {
        match self {
            Credentials::Login { username, password } => client.login(username, password),
            Credentials::XOAuth2 {
                username,
                access_token,
            } => client.authenticate(
                "XOAUTH2",
                &XOAuth2 {
                    user: username,
                    access_token,
                },
            ),
        }
    }
}

// secrets stay out of logs and panic messages
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::XOAuth2 { username, .. } => f
                .debug_struct("XOAuth2")
                .field("username", username)
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

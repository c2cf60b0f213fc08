//! IMAP operation kinds.
//!
//! Each type here implements [`Execute`] on top of a leased [`Session`](crate::Session). Wrap
//! one in an [`Operation`](crate::Operation) with a provider to run it:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use imap_operation::{ClientBuilder, Credentials, Operation, SessionPool};
//! # use imap_operation::ops::FetchMessages;
//! # let pool = Arc::new(SessionPool::builder(ClientBuilder::new("imap.example.com", 993))
//! #     .credentials(Credentials::login("me", "secret"))
//! #     .build());
//! let fetch = Operation::builder(FetchMessages::new("INBOX", "1:10", "(UID FLAGS)"))
//!     .provider(pool)
//!     .build();
//! for message in fetch.spawn()?.wait()? {
//!     println!("{} {:?}", message.message, message.flags());
//! }
//! # Ok::<(), imap_operation::OperationError>(())
//! ```
//!
//! Every kind that needs a selected mailbox selects it first, and checks for cancellation
//! before each command it sends.

use chrono::{DateTime, FixedOffset};

use crate::error::OperationError;
use crate::operation::{Context, Execute};
use crate::types::{Capabilities, Fetch, Flag, Mailbox, Seq};
use crate::utils::iter_join;

/// `CAPABILITY`.
#[derive(Clone, Debug, Default)]
pub struct FetchCapabilities;

impl Execute for FetchCapabilities {
    type Output = Capabilities;

    fn name(&self) -> &'static str {
        "capability"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Capabilities, OperationError> {
        Ok(ctx.session()?.capabilities()?)
    }
}

/// `NOOP`, which also lets the server deliver pending updates.
#[derive(Clone, Debug, Default)]
pub struct Noop;

impl Execute for Noop {
    type Output = ();

    fn name(&self) -> &'static str {
        "noop"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        Ok(ctx.session()?.noop()?)
    }
}

/// `SELECT`, or `EXAMINE` when read-only.
#[derive(Clone, Debug)]
pub struct SelectFolder {
    /// The mailbox to open.
    pub mailbox: String,
    /// Use `EXAMINE` instead of `SELECT`.
    pub read_only: bool,
}

impl SelectFolder {
    /// Select `mailbox` read-write.
    pub fn new(mailbox: impl Into<String>) -> Self {
        SelectFolder {
            mailbox: mailbox.into(),
            read_only: false,
        }
    }

    /// Open the mailbox read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

impl Execute for SelectFolder {
    type Output = Mailbox;

    fn name(&self) -> &'static str {
        if self.read_only {
            "examine"
        } else {
            "select"
        }
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Mailbox, OperationError> {
        let session = ctx.session()?;
        let mailbox = if self.read_only {
            session.examine(&self.mailbox)?
        } else {
            session.select(&self.mailbox)?
        };
        Ok(mailbox)
    }
}

/// `FETCH` (or `UID FETCH`) in a mailbox opened read-only.
#[derive(Clone, Debug)]
pub struct FetchMessages {
    /// The mailbox holding the messages.
    pub mailbox: String,
    /// Sequence set, e.g. `1:10` or `2,4,7:*`.
    pub set: String,
    /// Data items, e.g. `(UID FLAGS BODY.PEEK[HEADER])`.
    pub query: String,
    /// Whether `set` holds UIDs.
    pub uid: bool,
}

impl FetchMessages {
    /// Fetch by sequence numbers.
    pub fn new(
        mailbox: impl Into<String>,
        set: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        FetchMessages {
            mailbox: mailbox.into(),
            set: set.into(),
            query: query.into(),
            uid: false,
        }
    }

    /// Treat the set as UIDs.
    pub fn uid(mut self) -> Self {
        self.uid = true;
        self
    }
}

impl Execute for FetchMessages {
    type Output = Vec<Fetch>;

    fn name(&self) -> &'static str {
        "fetch"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Vec<Fetch>, OperationError> {
        ctx.session()?.examine(&self.mailbox)?;
        let session = ctx.session()?;
        let fetches = if self.uid {
            session.uid_fetch(&self.set, &self.query)?
        } else {
            session.fetch(&self.set, &self.query)?
        };
        Ok(fetches)
    }
}

/// How [`StoreFlags`] changes the flags of each message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// `+FLAGS`
    Add,
    /// `-FLAGS`
    Remove,
    /// `FLAGS`
    Replace,
}

impl StoreMode {
    fn item(self) -> &'static str {
        match self {
            StoreMode::Add => "+FLAGS",
            StoreMode::Remove => "-FLAGS",
            StoreMode::Replace => "FLAGS",
        }
    }
}

/// `STORE` (or `UID STORE`) of flags. Yields the updated flags the server reports.
#[derive(Clone, Debug)]
pub struct StoreFlags {
    /// The mailbox holding the messages.
    pub mailbox: String,
    /// Sequence set.
    pub set: String,
    /// Add, remove or replace.
    pub mode: StoreMode,
    /// The flags to store.
    pub flags: Vec<Flag>,
    /// Whether `set` holds UIDs.
    pub uid: bool,
}

impl StoreFlags {
    /// Change flags by sequence numbers.
    pub fn new(
        mailbox: impl Into<String>,
        set: impl Into<String>,
        mode: StoreMode,
        flags: Vec<Flag>,
    ) -> Self {
        StoreFlags {
            mailbox: mailbox.into(),
            set: set.into(),
            mode,
            flags,
            uid: false,
        }
    }

    /// Treat the set as UIDs.
    pub fn uid(mut self) -> Self {
        self.uid = true;
        self
    }

    fn query(&self) -> String {
        format!("{} ({})", self.mode.item(), iter_join(&self.flags, " "))
    }
}

impl Execute for StoreFlags {
    type Output = Vec<Fetch>;

    fn name(&self) -> &'static str {
        "store"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Vec<Fetch>, OperationError> {
        ctx.session()?.select(&self.mailbox)?;
        let query = self.query();
        let session = ctx.session()?;
        let fetches = if self.uid {
            session.uid_store(&self.set, &query)?
        } else {
            session.store(&self.set, &query)?
        };
        Ok(fetches)
    }
}

/// `COPY` (or `UID COPY`) to another mailbox.
#[derive(Clone, Debug)]
pub struct CopyMessages {
    /// The mailbox holding the messages.
    pub mailbox: String,
    /// Sequence set.
    pub set: String,
    /// Where the copies go.
    pub destination: String,
    /// Whether `set` holds UIDs.
    pub uid: bool,
}

impl CopyMessages {
    /// Copy by sequence numbers.
    pub fn new(
        mailbox: impl Into<String>,
        set: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        CopyMessages {
            mailbox: mailbox.into(),
            set: set.into(),
            destination: destination.into(),
            uid: false,
        }
    }

    /// Treat the set as UIDs.
    pub fn uid(mut self) -> Self {
        self.uid = true;
        self
    }
}

impl Execute for CopyMessages {
    type Output = ();

    fn name(&self) -> &'static str {
        "copy"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        ctx.session()?.examine(&self.mailbox)?;
        let session = ctx.session()?;
        if self.uid {
            session.uid_copy(&self.set, &self.destination)?;
        } else {
            session.copy(&self.set, &self.destination)?;
        }
        Ok(())
    }
}

/// `APPEND` of a complete RFC 822 message.
#[derive(Clone, Debug)]
pub struct AppendMessage {
    /// The mailbox to add the message to.
    pub mailbox: String,
    /// The raw message.
    pub content: Vec<u8>,
    /// Flags to set on the new message.
    pub flags: Vec<Flag>,
    /// The internal date to give the message.
    pub date: Option<DateTime<FixedOffset>>,
}

impl AppendMessage {
    /// Append `content` to `mailbox` with no flags and the server's current time.
    pub fn new(mailbox: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        AppendMessage {
            mailbox: mailbox.into(),
            content: content.into(),
            flags: Vec::new(),
            date: None,
        }
    }

    /// Set a flag on the new message.
    pub fn flag(mut self, flag: Flag) -> Self {
        self.flags.push(flag);
        self
    }

    /// Give the new message an internal date.
    pub fn internal_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.date = Some(date);
        self
    }
}

impl Execute for AppendMessage {
    type Output = ();

    fn name(&self) -> &'static str {
        "append"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        Ok(ctx
            .session()?
            .append(&self.mailbox, &self.content, &self.flags, self.date)?)
    }
}

/// `EXPUNGE` of a mailbox. Yields the expunged sequence numbers.
#[derive(Clone, Debug)]
pub struct ExpungeFolder {
    /// The mailbox to expunge.
    pub mailbox: String,
}

impl ExpungeFolder {
    /// Expunge `mailbox`.
    pub fn new(mailbox: impl Into<String>) -> Self {
        ExpungeFolder {
            mailbox: mailbox.into(),
        }
    }
}

impl Execute for ExpungeFolder {
    type Output = Vec<Seq>;

    fn name(&self) -> &'static str {
        "expunge"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<Vec<Seq>, OperationError> {
        ctx.session()?.select(&self.mailbox)?;
        Ok(ctx.session()?.expunge()?)
    }
}

/// `CREATE`.
#[derive(Clone, Debug)]
pub struct CreateFolder(pub String);

impl Execute for CreateFolder {
    type Output = ();

    fn name(&self) -> &'static str {
        "create"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        Ok(ctx.session()?.create(&self.0)?)
    }
}

/// `DELETE`.
#[derive(Clone, Debug)]
pub struct DeleteFolder(pub String);

impl Execute for DeleteFolder {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        Ok(ctx.session()?.delete(&self.0)?)
    }
}

/// `RENAME`.
#[derive(Clone, Debug)]
pub struct RenameFolder {
    /// The current name.
    pub from: String,
    /// The new name.
    pub to: String,
}

impl RenameFolder {
    /// Rename `from` to `to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        RenameFolder {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl Execute for RenameFolder {
    type Output = ();

    fn name(&self) -> &'static str {
        "rename"
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> Result<(), OperationError> {
        Ok(ctx.session()?.rename(&self.from, &self.to)?)
    }
}

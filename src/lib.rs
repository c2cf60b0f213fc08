//! Asynchronous IMAP operations.
//!
//! This crate runs IMAP commands as [`Operation`]s: units of work with a small lifecycle
//! (`Idle`, `Running`, `Finished`, `Cancelled`), a single completion callback that fires exactly
//! once, and cooperative cancellation that also tears down a connection blocked on the server.
//! Operations run on worker threads, either started one by one or admitted by an
//! [`OperationQueue`] that bounds how many run at once.
//!
//! Operations get their connections from a [`ConnectionProvider`]. [`SessionPool`] is the one
//! this crate provides: it connects with a [`ClientBuilder`], authenticates with
//! [`Credentials`] and reuses idle sessions.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use imap_operation::ops::{FetchMessages, SelectFolder};
//! use imap_operation::{ClientBuilder, Credentials, Operation, OperationQueue, SessionPool};
//!
//! let pool = Arc::new(
//!     SessionPool::builder(ClientBuilder::new("imap.example.com", 993))
//!         .credentials(Credentials::login("me@example.com", "password"))
//!         .build(),
//! );
//!
//! let queue = OperationQueue::new(2);
//!
//! let select = Operation::builder(SelectFolder::new("INBOX").read_only())
//!     .provider(pool.clone())
//!     .timeout(Duration::from_secs(30))
//!     .build();
//! select.on_complete(|outcome| match outcome {
//!     Ok(mailbox) => println!("INBOX: {}", mailbox),
//!     Err(e) => eprintln!("select failed: {}", e),
//! })?;
//! queue.enqueue(&select)?;
//!
//! let fetch = Operation::builder(FetchMessages::new("INBOX", "1:*", "(UID FLAGS)"))
//!     .provider(pool)
//!     .build();
//! let fetched = fetch.completion()?;
//! queue.enqueue(&fetch)?;
//!
//! match fetched.wait() {
//!     Ok(messages) => println!("{} messages", messages.len()),
//!     Err(e) if e.is_cancelled() => println!("cancelled"),
//!     Err(e) => eprintln!("fetch failed: {}", e),
//! }
//! queue.wait_idle();
//! # Ok::<(), imap_operation::OperationError>(())
//! ```
//!
//! Custom work implements [`Execute`], or is a closure passed to [`Operation::from_fn`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use imap_operation::{ClientBuilder, Credentials, Operation, SessionPool};
//! # let pool = Arc::new(SessionPool::builder(ClientBuilder::new("imap.example.com", 993))
//! #     .credentials(Credentials::login("me", "secret"))
//! #     .build());
//! let count = Operation::builder(imap_operation::FromFn::new(|ctx| {
//!     let inbox = ctx.session()?.examine("INBOX")?;
//!     ctx.check_cancelled()?;
//!     let archive = ctx.session()?.examine("Archive")?;
//!     Ok(inbox.exists + archive.exists)
//! }))
//! .provider(pool)
//! .build();
//! println!("{} messages", count.spawn()?.wait()?);
//! # Ok::<(), imap_operation::OperationError>(())
//! ```
//!
//! # Logging
//!
//! The crate logs through [`tracing`]: operation lifecycle at `debug`, protocol traffic and
//! state transitions at `trace`, and contained callback panics at `error`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod parse;
mod utils;

pub mod types;

mod authenticator;
mod cancel;
mod client;
mod client_builder;
mod conn;
mod dispatch;
pub mod error;
mod operation;
pub mod ops;
mod pool;
mod queue;

pub use crate::authenticator::{Authenticator, Credentials, XOAuth2};
pub use crate::cancel::{CancelToken, HookId};
pub use crate::client::{Client, Session};
pub use crate::client_builder::{ClientBuilder, ConnectionMode};
pub use crate::conn::{Abort, AbortHandle, Connection, ImapConnection, SetReadTimeout};
pub use crate::dispatch::{Callback, Outcome};
pub use crate::error::{
    Error, ErrorCode, ErrorDomain, OperationError, ParseError, Result, ValidateError,
};
pub use crate::operation::{
    Completion, Context, Execute, FromFn, Operation, OperationBuilder, OperationId, Priority,
    State,
};
pub use crate::pool::{ConnectionProvider, Lease, SessionPool, SessionPoolBuilder};
pub use crate::queue::OperationQueue;
pub use crate::types::*;

#[cfg(test)]
mod mock_stream;

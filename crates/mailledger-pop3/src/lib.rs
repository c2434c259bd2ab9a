//! # mailledger-pop3
//!
//! A POP3 client library (RFC 1939, STLS per RFC 2595) for inspecting and
//! pruning a remote mailbox without downloading it into a local store.
//!
//! ## Features
//!
//! - **Sans-I/O state machine**: the whole command sequence lives in
//!   [`protocol::Protocol`], driven by complete lines and blocks
//! - **Header listing**: `TOP n 0` for every message, with subject, sender
//!   and display date extracted for a message list
//! - **Selective deletion**: batches of `DELE`, one in flight at a time
//! - **Capability fallbacks**: UIDL, then LAST, then neither
//! - **TLS via rustls**: implicit TLS or an in-place STLS upgrade
//! - **APOP** challenge-response as well as USER/PASS
//!
//! ## Quick Start
//!
//! ```no_run
//! use mailledger_pop3::{CollectingHandler, Config, Security, Session};
//!
//! #[tokio::main]
//! async fn main() -> mailledger_pop3::Result<()> {
//!     let config = Config::builder("pop.example.com")
//!         .security(Security::StartTls)
//!         .username("alice")
//!         .secret("password")
//!         .build();
//!
//!     let handle = Session::new(config).spawn(CollectingHandler::new());
//!     handle.delete(vec![1])?;
//!     handle.close();
//!     handle.wait().await
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! Ready → Greeting → [Stls →] AuthUser → AuthPass ─┐
//!                          └→ AuthApop ────────────┤
//!                                                  ▼
//!         RangeStat → RangeUidl (→ RangeLast) → SizeList → Top ⇄ TopRecv
//!                                                               │
//!                    Delete ⇄ Idle ⇄ Retr ←──────────────────────┘
//!                               │
//!                               ▼
//!                            Logout → Done
//! ```
//!
//! ## Modules
//!
//! - [`command`]: POP3 command builders
//! - [`connection`]: Configuration, transport and the session driver
//! - [`handler`]: The mailbox browser interface
//! - [`header`]: Header parsing and display rendering
//! - [`parser`]: Status-line classification and listing parsers
//! - [`protocol`]: Sans-I/O reader and state machine
//! - [`types`]: Credentials, message records and the deletion queue

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod handler;
pub mod header;
pub mod parser;
pub mod protocol;
pub mod time;
pub mod types;

pub use command::Command;
pub use connection::{Config, ConfigBuilder, Pop3Stream, Secret, Security, Session, SessionHandle};
pub use error::{Error, Result};
pub use handler::{
    ChannelHandler, CollectingHandler, LoggingHandler, MailboxEvent, MailboxHandler, NoopHandler,
};
pub use header::HeaderSummary;
pub use protocol::{Protocol, ProtocolEvent, State};
pub use types::{AuthMethod, Credentials, Mailbox, MessageRecord};

/// Default port for plaintext and STLS sessions.
pub const POP3_PORT: u16 = 110;

/// Default port for implicit TLS sessions.
pub const POP3S_PORT: u16 = 995;

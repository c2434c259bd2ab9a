//! Sans-I/O POP3 session state machine.
//!
//! [`Protocol`] decides every command of a remote-mailbox inspection run
//! without touching a socket. The driver:
//!
//! - reads what [`ResponseReceiver::read_mode`] asks for (a status line, a
//!   buffered block or a spooled block) and hands it to the matching
//!   `on_*` method
//! - writes everything [`Protocol::poll_transmit`] yields
//! - forwards [`Protocol::poll_event`] results to the mailbox browser
//!
//! POP3 is half-duplex: at most one transmit is ever queued, and only after
//! the previous reply was fully consumed.
//!
//! # Example
//!
//! ```
//! use mailledger_pop3::protocol::{Protocol, ProtocolEvent, ResponseReceiver};
//! use mailledger_pop3::types::Credentials;
//!
//! let mut protocol = Protocol::new(Credentials::user("alice", "secret"), false);
//! protocol.start().unwrap();
//!
//! protocol.on_line("+OK POP3 server ready").unwrap();
//! let transmit = protocol.poll_transmit().unwrap();
//! assert_eq!(transmit.data(), b"USER alice\r\n");
//! ```

#![allow(clippy::missing_const_for_fn)]

mod cancel;
pub mod reader;
mod state;
mod transmit;

use std::collections::VecDeque;
use std::io::{BufRead, Read};
use std::sync::Arc;

use bytes::Bytes;

pub use cancel::CancelHandle;
pub use reader::{LineReader, MAX_BLOCK_SIZE, MAX_LINE_LENGTH, ReadError};
pub use state::{ReadMode, State};
pub use transmit::Transmit;

use crate::command::Command;
use crate::header::{HeaderSummary, Headers};
use crate::parser::{self, Outcome};
use crate::time::{Clock, SystemClock};
use crate::types::{AuthMethod, Credentials, DeletionQueue, Mailbox, MessageRecord};
use crate::{Error, Result};

/// Largest message count accepted from STAT.
pub const MAX_MESSAGES: u32 = 1_000_000;

/// Events produced by the protocol state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Progress text for a status bar.
    Status(String),
    /// STLS was accepted; the driver must upgrade the transport and then
    /// call [`Protocol::tls_established`].
    UpgradeTls,
    /// STAT result.
    MailboxSize {
        /// Number of messages.
        count: u32,
        /// Maildrop size in octets.
        total_bytes: u64,
    },
    /// Nothing to list; the session is logging out.
    MailboxEmpty,
    /// Headers of one message were parsed.
    HeaderReady(HeaderSummary),
    /// Every header was listed; the session is idle.
    ListingComplete(u32),
    /// One DELE was acknowledged.
    MessageDeleted(u32),
    /// A deletion batch finished; carries the number of messages deleted.
    DeletionBatchComplete(usize),
    /// A RETR completed.
    MessageReady {
        /// Message ordinal.
        ordinal: u32,
        /// Raw message, dot-transparency undone.
        raw: Bytes,
    },
    /// QUIT was answered; the driver must close the transport.
    Closed,
}

/// Receiver of complete server responses.
///
/// The driver asks [`read_mode`](Self::read_mode) how to read next and calls
/// exactly one of the three `on_*` methods with the result. An `Err` return
/// is fatal unless [`Error::is_fatal`] says otherwise.
pub trait ResponseReceiver {
    /// How the next response must be read.
    fn read_mode(&self) -> ReadMode;

    /// Handles a status line, terminator stripped.
    fn on_line(&mut self, line: &str) -> Result<()>;

    /// Handles a buffered dot-terminated block.
    fn on_block(&mut self, block: &[u8]) -> Result<()>;

    /// Handles a dot-terminated block that was spooled to storage.
    fn on_spooled_block(&mut self, block: &mut dyn BufRead) -> Result<()>;
}

/// Sans-I/O POP3 session state machine.
pub struct Protocol {
    state: State,
    credentials: Credentials,
    /// Negotiate STLS before authenticating.
    starttls: bool,
    tls_pending: bool,
    /// APOP timestamp from the greeting.
    timestamp: Option<String>,
    mailbox: Mailbox,
    /// Ordinal of the TOP in flight, or the next one to fetch.
    cur_msg: u32,
    deletion: Option<DeletionQueue>,
    deleted: usize,
    retrieving: Option<u32>,
    cancel: CancelHandle,
    clock: Arc<dyn Clock>,
    outbound: VecDeque<Transmit>,
    events: VecDeque<ProtocolEvent>,
}

impl Protocol {
    /// Creates a protocol instance in the [`State::Ready`] state.
    #[must_use]
    pub fn new(credentials: Credentials, starttls: bool) -> Self {
        Self {
            state: State::Ready,
            credentials,
            starttls,
            tls_pending: false,
            timestamp: None,
            mailbox: Mailbox::default(),
            cur_msg: 0,
            deletion: None,
            deleted: 0,
            retrieving: None,
            cancel: CancelHandle::new(),
            clock: Arc::new(SystemClock),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Replaces the clock used for deletion timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares an existing cancellation flag.
    #[must_use]
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns the per-message table.
    #[must_use]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Returns the current message cursor.
    #[must_use]
    pub fn cur_msg(&self) -> u32 {
        self.cur_msg
    }

    /// Returns a handle to the cancellation flag.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Marks the transport connected; the next line is the greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the session already started.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Ready {
            return Err(Error::InvalidState(format!(
                "session already started ({:?})",
                self.state
            )));
        }
        self.set_state(State::Greeting);
        Ok(())
    }

    /// Returns the next command to send, if any.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbound.pop_front()
    }

    /// Returns the next event for the browser, if any.
    pub fn poll_event(&mut self) -> Option<ProtocolEvent> {
        self.events.pop_front()
    }

    /// Continues after the transport was upgraded following STLS.
    ///
    /// The authentication branch is chosen exactly as it would have been
    /// straight from the greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no upgrade is pending, or
    /// [`Error::Malformed`] if APOP is configured and the greeting carried
    /// no timestamp.
    pub fn tls_established(&mut self) -> Result<()> {
        if !self.tls_pending || self.state != State::Stls {
            return Err(Error::InvalidState("no TLS upgrade pending".to_string()));
        }
        self.tls_pending = false;
        let result = self.begin_auth();
        self.check(result)
    }

    /// Queues a batch of deletions.
    ///
    /// Ordinals already marked deleted, and repeats, are dropped. An empty
    /// batch completes immediately with a count of zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is idle, or
    /// [`Error::InvalidOrdinal`] if any ordinal is outside the mailbox. In
    /// both cases nothing is queued and the session is unaffected.
    pub fn request_delete(&mut self, ordinals: &[u32]) -> Result<()> {
        self.expect_idle("delete")?;
        for &ordinal in ordinals {
            self.mailbox.check(ordinal)?;
        }

        let mut batch = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            let deleted = self
                .mailbox
                .get(ordinal)
                .is_some_and(MessageRecord::is_deleted);
            if !deleted && !batch.contains(&ordinal) {
                batch.push(ordinal);
            }
        }

        self.deleted = 0;
        let Some(queue) = DeletionQueue::new(batch) else {
            self.events.push_back(ProtocolEvent::DeletionBatchComplete(0));
            return Ok(());
        };
        if let Some(first) = queue.current() {
            self.send(Command::Dele { msg: first });
            self.set_state(State::Delete);
        }
        self.deletion = Some(queue);
        Ok(())
    }

    /// Requests the full text of one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is idle or if the
    /// message is marked deleted, or [`Error::InvalidOrdinal`].
    pub fn open(&mut self, ordinal: u32) -> Result<()> {
        self.expect_idle("open a message")?;
        self.mailbox.check(ordinal)?;
        if self
            .mailbox
            .get(ordinal)
            .is_some_and(MessageRecord::is_deleted)
        {
            return Err(Error::InvalidState(format!(
                "message {ordinal} is marked deleted"
            )));
        }
        self.retrieving = Some(ordinal);
        self.send(Command::Retr { msg: ordinal });
        self.set_state(State::Retr);
        Ok(())
    }

    /// Ends the session.
    ///
    /// Idle sessions send QUIT right away. Active sessions are cancelled and
    /// log out at their next loop decision. Finished sessions are left alone.
    pub fn close(&mut self) {
        match self.state {
            State::Idle => self.logout(),
            State::Done | State::Error => {}
            _ => self.cancel.cancel(),
        }
    }

    fn expect_idle(&self, action: &str) -> Result<()> {
        if self.state == State::Idle {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "cannot {action} in {:?} state",
                self.state
            )))
        }
    }

    fn set_state(&mut self, next: State) {
        tracing::trace!(from = ?self.state, to = ?next, "POP3 state");
        self.state = next;
    }

    fn send(&mut self, command: Command) {
        self.outbound.push_back(Transmit::new(command));
    }

    fn status(&mut self, text: impl Into<String>) {
        self.events.push_back(ProtocolEvent::Status(text.into()));
    }

    /// Moves to [`State::Error`] on a fatal error.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            tracing::error!(error = %e, state = ?self.state, "POP3 session failed");
            self.set_state(State::Error);
            self.outbound.clear();
            self.deletion = None;
            self.retrieving = None;
        }
        result
    }

    fn unexpected(&self, what: &str) -> Error {
        Error::ProtocolViolation(format!("unexpected {what} in {:?} state", self.state))
    }

    fn rejection(&self, message: &str) -> Error {
        if self.state.is_auth() {
            Error::Auth(message.to_string())
        } else {
            Error::Server {
                command: self.state.command(),
                message: message.to_string(),
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        match self.state {
            State::Ready | State::Idle | State::Done | State::Error => {
                return Err(self.unexpected(&format!("response {line:?}")));
            }
            State::RangeUidlRecv | State::SizeListRecv | State::TopRecv | State::RetrRecv => {
                return Err(self.unexpected("status line"));
            }
            State::Logout => {
                self.finish_logout(line);
                return Ok(());
            }
            _ => {}
        }

        let reply = parser::classify(line, self.state.tolerates_rejection())?;
        match reply.outcome {
            Outcome::Locked => return Err(Error::Locked(reply.body.to_string())),
            Outcome::Failure => return Err(self.rejection(reply.body)),
            Outcome::Success | Outcome::NotSupported => {}
        }
        let supported = reply.outcome.is_success();

        match self.state {
            State::Greeting => self.on_greeting(reply.body),
            State::Stls => {
                self.tls_pending = true;
                self.events.push_back(ProtocolEvent::UpgradeTls);
                Ok(())
            }
            State::AuthUser => {
                self.send(Command::Pass {
                    password: self.credentials.secret.clone(),
                });
                self.set_state(State::AuthPass);
                Ok(())
            }
            State::AuthPass | State::AuthApop => {
                self.status("Getting the number of messages...");
                self.send(Command::Stat);
                self.set_state(State::RangeStat);
                Ok(())
            }
            State::RangeStat => self.on_stat(reply.body),
            State::RangeUidl if supported => {
                self.set_state(State::RangeUidlRecv);
                Ok(())
            }
            State::RangeUidl => {
                tracing::warn!(reply = reply.body, "UIDL not supported, trying LAST");
                self.send(Command::Last);
                self.set_state(State::RangeLast);
                Ok(())
            }
            State::RangeLast if supported => self.on_last(reply.body),
            State::RangeLast => {
                tracing::warn!(reply = reply.body, "LAST not supported");
                self.request_sizes();
                Ok(())
            }
            State::SizeList => {
                self.set_state(State::SizeListRecv);
                Ok(())
            }
            State::Top => {
                self.set_state(State::TopRecv);
                Ok(())
            }
            State::Retr => {
                self.set_state(State::RetrRecv);
                Ok(())
            }
            State::Delete => self.on_deleted(),
            _ => Err(self.unexpected("status line")),
        }
    }

    fn on_greeting(&mut self, body: &str) -> Result<()> {
        self.timestamp = parser::greeting_timestamp(body).map(str::to_string);
        if self.starttls {
            self.send(Command::Stls);
            self.set_state(State::Stls);
            Ok(())
        } else {
            self.begin_auth()
        }
    }

    fn begin_auth(&mut self) -> Result<()> {
        let (command, next) = match self.credentials.method {
            AuthMethod::User => (
                Command::User {
                    username: self.credentials.username.clone(),
                },
                State::AuthUser,
            ),
            AuthMethod::Apop => {
                let timestamp = self.timestamp.as_deref().ok_or_else(|| {
                    Error::Malformed("required APOP timestamp not found".to_string())
                })?;
                (
                    Command::apop(
                        self.credentials.username.clone(),
                        timestamp,
                        &self.credentials.secret,
                    ),
                    State::AuthApop,
                )
            }
        };
        self.status("Authenticating...");
        self.send(command);
        self.set_state(next);
        Ok(())
    }

    fn on_stat(&mut self, body: &str) -> Result<()> {
        let (count, total_bytes) = parser::parse_stat(body)?;
        if count > MAX_MESSAGES {
            return Err(Error::Malformed(format!(
                "STAT reports {count} messages, more than {MAX_MESSAGES}"
            )));
        }
        self.mailbox = Mailbox::new(count, total_bytes);
        self.cur_msg = 1;
        self.events
            .push_back(ProtocolEvent::MailboxSize { count, total_bytes });

        if count == 0 {
            self.no_message();
        } else {
            self.send(Command::Uidl);
            self.set_state(State::RangeUidl);
        }
        Ok(())
    }

    fn on_last(&mut self, body: &str) -> Result<()> {
        let last = parser::parse_last(body)?;
        if last == self.mailbox.count() {
            self.cur_msg = 0;
            self.no_message();
        } else {
            self.cur_msg = last.saturating_add(1);
            self.request_sizes();
        }
        Ok(())
    }

    fn no_message(&mut self) {
        self.status("No message");
        self.events.push_back(ProtocolEvent::MailboxEmpty);
        self.logout();
    }

    fn logout(&mut self) {
        self.send(Command::Quit);
        self.set_state(State::Logout);
    }

    fn finish_logout(&mut self, line: &str) {
        if line.starts_with('-') {
            tracing::warn!(reply = line, "QUIT rejected");
        }
        self.set_state(State::Done);
        self.events.push_back(ProtocolEvent::Closed);
    }

    fn request_sizes(&mut self) {
        if self.is_cancelled() {
            tracing::debug!("listing cancelled before LIST");
            self.logout();
            return;
        }
        self.send(Command::List);
        self.set_state(State::SizeList);
    }

    fn fetch_header(&mut self) {
        self.send(Command::Top {
            msg: self.cur_msg,
            lines: 0,
        });
        self.set_state(State::Top);
    }

    fn handle_block(&mut self, block: &[u8]) -> Result<()> {
        match self.state {
            State::RangeUidlRecv => {
                for (ordinal, uid) in parser::parse_uidl_listing(block, self.mailbox.count()) {
                    self.mailbox.set_uid(ordinal, uid);
                }
                self.request_sizes();
                Ok(())
            }
            State::SizeListRecv => {
                for (ordinal, size) in parser::parse_size_listing(block)? {
                    self.mailbox.set_size(ordinal, size);
                }
                self.cur_msg = 1;
                if self.is_cancelled() {
                    tracing::debug!("listing cancelled before TOP");
                    self.logout();
                } else if self.mailbox.is_empty() {
                    self.no_message();
                } else {
                    self.fetch_header();
                }
                Ok(())
            }
            _ => Err(self.unexpected("block")),
        }
    }

    fn handle_spooled_block(&mut self, block: &mut dyn BufRead) -> Result<()> {
        match self.state {
            State::TopRecv => {
                let headers = Headers::read_from(block)?;
                let ordinal = self.cur_msg;
                let size = self.mailbox.get(ordinal).map_or(0, |m| m.size);
                self.events.push_back(ProtocolEvent::HeaderReady(
                    HeaderSummary::from_headers(ordinal, size, &headers),
                ));

                let count = self.mailbox.count();
                self.status(format!("Retrieving message headers ({ordinal} / {count})"));
                if self.is_cancelled() {
                    tracing::debug!(ordinal, "listing cancelled");
                    self.logout();
                } else if ordinal < count {
                    self.cur_msg += 1;
                    self.fetch_header();
                } else {
                    self.set_state(State::Idle);
                    self.status(format!("Retrieved {count} message headers"));
                    self.events.push_back(ProtocolEvent::ListingComplete(count));
                }
                Ok(())
            }
            State::RetrRecv => {
                let mut raw = Vec::new();
                block.read_to_end(&mut raw)?;
                let ordinal = self
                    .retrieving
                    .take()
                    .ok_or_else(|| self.unexpected("message"))?;
                self.set_state(State::Idle);
                self.events.push_back(ProtocolEvent::MessageReady {
                    ordinal,
                    raw: Bytes::from(raw),
                });
                Ok(())
            }
            _ => Err(self.unexpected("spooled block")),
        }
    }

    fn on_deleted(&mut self) -> Result<()> {
        let Some(ordinal) = self.deletion.as_ref().and_then(DeletionQueue::current) else {
            return Err(self.unexpected("DELE reply"));
        };
        let next = self.deletion.as_mut().and_then(DeletionQueue::advance);

        self.mailbox.mark_deleted(ordinal, self.clock.now())?;
        self.deleted += 1;
        self.events.push_back(ProtocolEvent::MessageDeleted(ordinal));

        if let Some(next) = next {
            self.send(Command::Dele { msg: next });
        } else {
            self.deletion = None;
            self.set_state(State::Idle);
            self.status(format!("Deleted {} messages", self.deleted));
            self.events
                .push_back(ProtocolEvent::DeletionBatchComplete(self.deleted));
        }
        Ok(())
    }
}

impl ResponseReceiver for Protocol {
    fn read_mode(&self) -> ReadMode {
        self.state.read_mode()
    }

    fn on_line(&mut self, line: &str) -> Result<()> {
        let result = self.handle_line(line);
        self.check(result)
    }

    fn on_block(&mut self, block: &[u8]) -> Result<()> {
        let result = self.handle_block(block);
        self.check(result)
    }

    fn on_spooled_block(&mut self, block: &mut dyn BufRead) -> Result<()> {
        let result = self.handle_spooled_block(block);
        self.check(result)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::time::MockClock;
    use proptest::prelude::*;

    const APOP_GREETING: &str = "+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>";

    fn started(credentials: Credentials, starttls: bool) -> Protocol {
        let mut protocol = Protocol::new(credentials, starttls).with_clock(MockClock::shared());
        protocol.start().unwrap();
        protocol
    }

    fn sent(protocol: &mut Protocol) -> Vec<String> {
        std::iter::from_fn(|| protocol.poll_transmit())
            .map(|t| String::from_utf8(t.data().to_vec()).unwrap())
            .collect()
    }

    fn events(protocol: &mut Protocol) -> Vec<ProtocolEvent> {
        std::iter::from_fn(|| protocol.poll_event()).collect()
    }

    fn browser_events(protocol: &mut Protocol) -> Vec<ProtocolEvent> {
        events(protocol)
            .into_iter()
            .filter(|e| !matches!(e, ProtocolEvent::Status(_)))
            .collect()
    }

    fn spool(protocol: &mut Protocol, text: &str) -> Result<()> {
        let mut reader = text.as_bytes();
        protocol.on_spooled_block(&mut reader)
    }

    /// Drives a USER/PASS session up to the STAT reply.
    fn authenticated(stat: &str) -> Protocol {
        let mut p = started(Credentials::user("alice", "secret"), false);
        p.on_line("+OK ready").unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK logged in").unwrap();
        sent(&mut p);
        events(&mut p);
        p.on_line(stat).unwrap();
        p
    }

    /// Drives a session with `count` messages through the whole listing.
    fn idle_with(count: u32) -> Protocol {
        let mut p = authenticated(&format!("+OK {count} {}", count * 100));
        p.on_line("+OK").unwrap();
        let uidl: String = (1..=count).map(|n| format!("{n} uid-{n}\r\n")).collect();
        p.on_block(uidl.as_bytes()).unwrap();
        p.on_line("+OK").unwrap();
        let list: String = (1..=count).map(|n| format!("{n} 100\r\n")).collect();
        p.on_block(list.as_bytes()).unwrap();
        for n in 1..=count {
            p.on_line("+OK").unwrap();
            spool(&mut p, &format!("Subject: message {n}\r\n\r\n")).unwrap();
        }
        assert_eq!(p.state(), State::Idle);
        sent(&mut p);
        events(&mut p);
        p
    }

    #[test]
    fn test_start_only_once() {
        let mut p = Protocol::new(Credentials::user("a", "b"), false);
        assert_eq!(p.state(), State::Ready);
        p.start().unwrap();
        assert_eq!(p.state(), State::Greeting);
        assert!(matches!(p.start(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_user_pass_sequence() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        p.on_line("+OK POP3 ready").unwrap();
        assert_eq!(sent(&mut p), vec!["USER alice\r\n"]);
        assert_eq!(p.state(), State::AuthUser);

        p.on_line("+OK").unwrap();
        assert_eq!(sent(&mut p), vec!["PASS secret\r\n"]);
        assert_eq!(p.state(), State::AuthPass);

        p.on_line("+OK maildrop ready").unwrap();
        assert_eq!(sent(&mut p), vec!["STAT\r\n"]);
        assert_eq!(p.state(), State::RangeStat);
        assert!(events(&mut p).contains(&ProtocolEvent::Status(
            "Getting the number of messages...".to_string()
        )));
    }

    #[test]
    fn test_full_listing() {
        let mut p = authenticated("+OK 3 1500");
        assert_eq!(p.mailbox().count(), 3);
        assert_eq!(sent(&mut p), vec!["UIDL\r\n"]);

        p.on_line("+OK unique-id listing follows").unwrap();
        assert_eq!(p.read_mode(), ReadMode::Block);
        p.on_block(b"1 whqtswO00WBw418f9t5JxYwZ\r\n2 QhdPYR:00WBw1Ph7x7\r\n3 abc\r\n")
            .unwrap();
        assert_eq!(sent(&mut p), vec!["LIST\r\n"]);

        p.on_line("+OK scan listing follows").unwrap();
        p.on_block(b"1 500\r\n2 400\r\n3 600\r\n").unwrap();

        for n in 1..=3u32 {
            assert_eq!(sent(&mut p), vec![format!("TOP {n} 0\r\n")]);
            p.on_line("+OK").unwrap();
            assert_eq!(p.read_mode(), ReadMode::Spool);
            spool(
                &mut p,
                &format!("From: a{n}@example.com\r\nSubject: hello {n}\r\n\r\n"),
            )
            .unwrap();
        }
        assert!(sent(&mut p).is_empty());
        assert_eq!(p.state(), State::Idle);

        let events = browser_events(&mut p);
        assert_eq!(
            events[0],
            ProtocolEvent::MailboxSize {
                count: 3,
                total_bytes: 1500
            }
        );
        let ordinals: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::HeaderReady(h) => Some(h.ordinal),
                _ => None,
            })
            .collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
        assert_eq!(events.last(), Some(&ProtocolEvent::ListingComplete(3)));

        let ProtocolEvent::HeaderReady(second) = &events[2] else {
            panic!("expected header");
        };
        assert_eq!(second.subject, "hello 2");
        assert_eq!(second.from, "a2@example.com");
        assert_eq!(second.size, 400);

        assert_eq!(p.mailbox().get(2).unwrap().uid.as_deref(), Some("QhdPYR:00WBw1Ph7x7"));
    }

    #[test]
    fn test_status_messages_during_listing() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 a\r\n2 b\r\n").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"1 100\r\n2 100\r\n").unwrap();
        p.on_line("+OK").unwrap();
        spool(&mut p, "\r\n").unwrap();
        p.on_line("+OK").unwrap();
        spool(&mut p, "\r\n").unwrap();

        let statuses: Vec<String> = events(&mut p)
            .into_iter()
            .filter_map(|e| match e {
                ProtocolEvent::Status(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                "Retrieving message headers (1 / 2)",
                "Retrieving message headers (2 / 2)",
                "Retrieved 2 message headers",
            ]
        );
    }

    #[test]
    fn test_header_progress_follows_parsed_header() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 a\r\n2 b\r\n").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"1 100\r\n2 100\r\n").unwrap();
        assert_eq!(sent(&mut p).last().map(String::as_str), Some("TOP 1 0\r\n"));
        assert!(
            !events(&mut p)
                .iter()
                .any(|e| matches!(e, ProtocolEvent::Status(_)))
        );

        p.on_line("+OK").unwrap();
        spool(&mut p, "Subject: first\r\n\r\n").unwrap();
        let events = events(&mut p);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ProtocolEvent::HeaderReady(h) if h.ordinal == 1));
        assert_eq!(
            events[1],
            ProtocolEvent::Status("Retrieving message headers (1 / 2)".to_string())
        );
    }

    #[test]
    fn test_stat_count_above_limit_is_malformed() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        p.on_line("+OK ready").unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK logged in").unwrap();
        sent(&mut p);

        let result = p.on_line("+OK 4294967295 0");
        assert!(matches!(result, Err(Error::Malformed(_))));
        assert_eq!(p.state(), State::Error);
        assert_eq!(p.mailbox().count(), 0);
        assert!(sent(&mut p).is_empty());
    }

    #[test]
    fn test_empty_mailbox_logs_out() {
        let mut p = authenticated("+OK 0 0");
        assert_eq!(sent(&mut p), vec!["QUIT\r\n"]);
        assert_eq!(p.state(), State::Logout);
        assert_eq!(
            browser_events(&mut p),
            vec![
                ProtocolEvent::MailboxSize {
                    count: 0,
                    total_bytes: 0
                },
                ProtocolEvent::MailboxEmpty,
            ]
        );

        p.on_line("+OK bye").unwrap();
        assert_eq!(p.state(), State::Done);
        assert_eq!(events(&mut p), vec![ProtocolEvent::Closed]);
    }

    #[test]
    fn test_uidl_and_last_unsupported() {
        let mut p = authenticated("+OK 4 400");
        assert_eq!(sent(&mut p), vec!["UIDL\r\n"]);

        p.on_line("-ERR unknown command").unwrap();
        assert_eq!(sent(&mut p), vec!["LAST\r\n"]);
        assert_eq!(p.state(), State::RangeLast);

        p.on_line("-ERR unknown command").unwrap();
        assert_eq!(sent(&mut p), vec!["LIST\r\n"]);
        assert_eq!(p.state(), State::SizeList);

        p.on_line("+OK").unwrap();
        p.on_block(b"1 10\r\n2 20\r\n3 30\r\n4 40\r\n").unwrap();
        assert_eq!(sent(&mut p), vec!["TOP 1 0\r\n"]);
        assert_eq!(p.cur_msg(), 1);
        assert!(p.mailbox().iter().all(|m| m.uid.is_none()));
        assert_eq!(p.mailbox().get(4).unwrap().size, 40);
    }

    #[test]
    fn test_last_equal_to_count_means_no_message() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("-ERR no UIDL").unwrap();
        sent(&mut p);
        p.on_line("+OK 2").unwrap();
        assert_eq!(p.cur_msg(), 0);
        assert_eq!(sent(&mut p), vec!["QUIT\r\n"]);
        assert!(browser_events(&mut p).contains(&ProtocolEvent::MailboxEmpty));
    }

    #[test]
    fn test_last_below_count_lists_sizes() {
        let mut p = authenticated("+OK 5 500");
        p.on_line("-ERR no UIDL").unwrap();
        sent(&mut p);
        p.on_line("+OK 2").unwrap();
        assert_eq!(p.cur_msg(), 3);
        assert_eq!(sent(&mut p), vec!["LIST\r\n"]);
    }

    #[test]
    fn test_bad_uidl_lines_are_skipped() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 first\r\ngarbage\r\n9 out-of-range\r\n2 second\r\n")
            .unwrap();
        assert_eq!(p.mailbox().get(1).unwrap().uid.as_deref(), Some("first"));
        assert_eq!(p.mailbox().get(2).unwrap().uid.as_deref(), Some("second"));
        assert_eq!(p.state(), State::SizeList);
    }

    #[test]
    fn test_malformed_list_is_fatal() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 a\r\n2 b\r\n").unwrap();
        p.on_line("+OK").unwrap();
        sent(&mut p);
        let err = p.on_block(b"1 100\r\ntwo hundred\r\n").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert_eq!(p.state(), State::Error);
        assert!(p.poll_transmit().is_none());
    }

    #[test]
    fn test_malformed_stat_is_fatal() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        let err = p.on_line("+OK lots").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert_eq!(p.state(), State::Error);
    }

    #[test]
    fn test_stls_then_apop() {
        let mut p = started(Credentials::apop("mrose", "tanstaaf"), true);
        p.on_line(APOP_GREETING).unwrap();
        assert_eq!(sent(&mut p), vec!["STLS\r\n"]);
        assert_eq!(p.state(), State::Stls);

        p.on_line("+OK begin TLS negotiation").unwrap();
        assert!(sent(&mut p).is_empty());
        assert_eq!(events(&mut p), vec![ProtocolEvent::UpgradeTls]);

        p.tls_established().unwrap();
        assert_eq!(
            sent(&mut p),
            vec!["APOP mrose c4c9334bac560ecc979e58001b3e22fb\r\n"]
        );
        assert_eq!(p.state(), State::AuthApop);

        p.on_line("+OK maildrop has 1 message").unwrap();
        assert_eq!(sent(&mut p), vec!["STAT\r\n"]);
    }

    #[test]
    fn test_stls_then_user() {
        let mut p = started(Credentials::user("alice", "secret"), true);
        p.on_line("+OK ready").unwrap();
        assert_eq!(sent(&mut p), vec!["STLS\r\n"]);
        p.on_line("+OK").unwrap();
        p.tls_established().unwrap();
        assert_eq!(sent(&mut p), vec!["USER alice\r\n"]);
    }

    #[test]
    fn test_tls_established_without_upgrade() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        assert!(matches!(p.tls_established(), Err(Error::InvalidState(_))));
        assert_eq!(p.state(), State::Greeting);
    }

    #[test]
    fn test_stls_rejected_is_fatal() {
        let mut p = started(Credentials::user("alice", "secret"), true);
        p.on_line("+OK ready").unwrap();
        let err = p.on_line("-ERR TLS unavailable").unwrap_err();
        assert!(matches!(err, Error::Server { command: "STLS", .. }));
        assert_eq!(p.state(), State::Error);
    }

    #[test]
    fn test_apop_without_timestamp() {
        let mut p = started(Credentials::apop("alice", "secret"), false);
        let err = p.on_line("+OK no timestamp here").unwrap_err();
        assert!(matches!(err, Error::Malformed(msg) if msg.contains("APOP timestamp")));
        assert_eq!(p.state(), State::Error);
        assert!(p.poll_transmit().is_none());
    }

    #[test]
    fn test_auth_failure() {
        let mut p = started(Credentials::user("alice", "wrong"), false);
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        let err = p.on_line("-ERR invalid password").unwrap_err();
        assert!(matches!(err, Error::Auth(msg) if msg == "invalid password"));
        assert_eq!(p.state(), State::Error);
    }

    #[test]
    fn test_locked_mailbox() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        let err = p.on_line("-ERR [IN-USE] maildrop is locked").unwrap_err();
        assert!(matches!(err, Error::Locked(_)));
        assert_eq!(p.state(), State::Error);
    }

    #[test]
    fn test_garbage_status_line() {
        let mut p = started(Credentials::user("alice", "secret"), false);
        let err = p.on_line("* OK IMAP4rev1").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert_eq!(p.state(), State::Error);
    }

    #[test]
    fn test_top_failure_is_fatal() {
        let mut p = authenticated("+OK 1 100");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 a\r\n").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"1 100\r\n").unwrap();
        let err = p.on_line("-ERR no such message").unwrap_err();
        assert!(matches!(err, Error::Server { command: "TOP", .. }));
    }

    #[test]
    fn test_response_after_done_is_violation() {
        let mut p = authenticated("+OK 0 0");
        p.on_line("+OK bye").unwrap();
        assert_eq!(p.state(), State::Done);
        let err = p.on_line("+OK extra").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert_eq!(p.state(), State::Error);
        assert!(matches!(
            p.on_line("+OK more"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unsolicited_line_while_idle() {
        let mut p = idle_with(1);
        assert!(matches!(
            p.on_line("+OK hello?"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_wrong_read_mode_is_violation() {
        let mut p = authenticated("+OK 1 100");
        assert!(matches!(
            p.on_block(b"1 a\r\n"),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_cancel_during_header_loop() {
        let mut p = authenticated("+OK 3 300");
        p.on_line("+OK").unwrap();
        p.on_block(b"1 a\r\n2 b\r\n3 c\r\n").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"1 100\r\n2 100\r\n3 100\r\n").unwrap();
        assert_eq!(sent(&mut p), vec!["TOP 1 0\r\n"]);

        p.on_line("+OK").unwrap();
        p.cancel_handle().cancel();
        spool(&mut p, "Subject: first\r\n\r\n").unwrap();

        assert_eq!(sent(&mut p), vec!["QUIT\r\n"]);
        assert_eq!(p.state(), State::Logout);
        let events = browser_events(&mut p);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, ProtocolEvent::HeaderReady(_)))
                .count(),
            1
        );
        assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::ListingComplete(_))));
    }

    #[test]
    fn test_cancel_before_size_listing() {
        let mut p = authenticated("+OK 2 200");
        p.on_line("+OK").unwrap();
        p.close();
        assert!(p.is_cancelled());
        p.on_block(b"1 a\r\n2 b\r\n").unwrap();
        assert_eq!(sent(&mut p), vec!["UIDL\r\n", "QUIT\r\n"]);
    }

    #[test]
    fn test_delete_batch() {
        let clock = MockClock::shared();
        let mut p = Protocol::new(Credentials::user("alice", "secret"), false)
            .with_clock(clock.clone());
        p.start().unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK").unwrap();
        p.on_line("+OK 7 700").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"").unwrap();
        p.on_line("+OK").unwrap();
        p.on_block(b"").unwrap();
        for _ in 1..=7 {
            p.on_line("+OK").unwrap();
            spool(&mut p, "\r\n").unwrap();
        }
        assert_eq!(p.state(), State::Idle);
        sent(&mut p);
        events(&mut p);

        p.request_delete(&[2, 5, 7]).unwrap();
        assert_eq!(p.state(), State::Delete);
        assert_eq!(sent(&mut p), vec!["DELE 2\r\n"]);
        p.on_line("+OK message 2 deleted").unwrap();
        assert_eq!(sent(&mut p), vec!["DELE 5\r\n"]);
        p.on_line("+OK message 5 deleted").unwrap();
        assert_eq!(sent(&mut p), vec!["DELE 7\r\n"]);
        p.on_line("+OK message 7 deleted").unwrap();
        assert!(sent(&mut p).is_empty());
        assert_eq!(p.state(), State::Idle);

        let events = events(&mut p);
        assert_eq!(
            events
                .iter()
                .filter(|e| !matches!(e, ProtocolEvent::Status(_)))
                .cloned()
                .collect::<Vec<_>>(),
            vec![
                ProtocolEvent::MessageDeleted(2),
                ProtocolEvent::MessageDeleted(5),
                ProtocolEvent::MessageDeleted(7),
                ProtocolEvent::DeletionBatchComplete(3),
            ]
        );
        assert!(events.contains(&ProtocolEvent::Status("Deleted 3 messages".to_string())));

        let deleted: Vec<u32> = p
            .mailbox()
            .iter()
            .filter(|m| m.is_deleted())
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(deleted, vec![2, 5, 7]);
        assert_eq!(p.mailbox().get(5).unwrap().deleted_at(), Some(clock.now()));
    }

    #[test]
    fn test_delete_skips_already_deleted() {
        let mut p = idle_with(3);
        p.request_delete(&[1]).unwrap();
        p.on_line("+OK").unwrap();
        sent(&mut p);
        events(&mut p);

        p.request_delete(&[1, 3, 3]).unwrap();
        assert_eq!(sent(&mut p), vec!["DELE 3\r\n"]);
        p.on_line("+OK").unwrap();
        assert!(sent(&mut p).is_empty());
        assert!(browser_events(&mut p).contains(&ProtocolEvent::DeletionBatchComplete(1)));
    }

    #[test]
    fn test_delete_empty_batch() {
        let mut p = idle_with(2);
        p.request_delete(&[]).unwrap();
        assert!(sent(&mut p).is_empty());
        assert_eq!(p.state(), State::Idle);
        assert_eq!(
            events(&mut p),
            vec![ProtocolEvent::DeletionBatchComplete(0)]
        );
    }

    #[test]
    fn test_delete_out_of_range() {
        let mut p = idle_with(2);
        let err = p.request_delete(&[1, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidOrdinal(3)));
        assert!(!err.is_fatal());
        assert_eq!(p.state(), State::Idle);
        assert!(sent(&mut p).is_empty());
        assert_eq!(p.mailbox().deleted_count(), 0);
    }

    #[test]
    fn test_delete_requires_idle() {
        let mut p = authenticated("+OK 2 200");
        let err = p.request_delete(&[1]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(p.state(), State::RangeUidl);
    }

    #[test]
    fn test_delete_ignores_cancel() {
        let mut p = idle_with(3);
        p.request_delete(&[1, 2]).unwrap();
        p.close();
        assert!(p.is_cancelled());
        p.on_line("+OK").unwrap();
        assert_eq!(sent(&mut p), vec!["DELE 1\r\n", "DELE 2\r\n"]);
        p.on_line("+OK").unwrap();
        assert_eq!(p.state(), State::Idle);
    }

    #[test]
    fn test_dele_failure_is_fatal() {
        let mut p = idle_with(2);
        p.request_delete(&[2]).unwrap();
        let err = p.on_line("-ERR message 2 already deleted").unwrap_err();
        assert!(matches!(err, Error::Server { command: "DELE", .. }));
        assert_eq!(p.state(), State::Error);
        assert!(!p.mailbox().get(2).unwrap().is_deleted());
    }

    #[test]
    fn test_open_message() {
        let mut p = idle_with(2);
        p.open(2).unwrap();
        assert_eq!(sent(&mut p), vec!["RETR 2\r\n"]);
        p.on_line("+OK 100 octets").unwrap();
        assert_eq!(p.read_mode(), ReadMode::Spool);
        spool(&mut p, "Subject: x\r\n\r\nbody\r\n").unwrap();
        assert_eq!(p.state(), State::Idle);
        assert_eq!(
            events(&mut p),
            vec![ProtocolEvent::MessageReady {
                ordinal: 2,
                raw: Bytes::from_static(b"Subject: x\r\n\r\nbody\r\n"),
            }]
        );
    }

    #[test]
    fn test_open_deleted_message() {
        let mut p = idle_with(2);
        p.request_delete(&[1]).unwrap();
        p.on_line("+OK").unwrap();
        assert!(matches!(p.open(1), Err(Error::InvalidState(_))));
        assert!(matches!(p.open(9), Err(Error::InvalidOrdinal(9))));
    }

    #[test]
    fn test_close_when_idle_sends_quit() {
        let mut p = idle_with(1);
        p.close();
        assert_eq!(sent(&mut p), vec!["QUIT\r\n"]);
        assert!(!p.is_cancelled());
        p.on_line("+OK bye").unwrap();
        assert_eq!(p.state(), State::Done);
    }

    #[test]
    fn test_close_when_finished_is_noop() {
        let mut p = authenticated("+OK 0 0");
        p.on_line("+OK").unwrap();
        sent(&mut p);
        p.close();
        assert!(!p.is_cancelled());
        assert!(sent(&mut p).is_empty());
        assert_eq!(p.state(), State::Done);
    }

    #[test]
    fn test_quit_rejection_still_closes() {
        let mut p = idle_with(1);
        p.close();
        p.on_line("-ERR some deleted messages not removed").unwrap();
        assert_eq!(p.state(), State::Done);
        assert_eq!(events(&mut p), vec![ProtocolEvent::Closed]);
    }

    #[test]
    fn test_shared_cancel_handle() {
        let handle = CancelHandle::new();
        let p = Protocol::new(Credentials::user("a", "b"), false).with_cancel_handle(handle.clone());
        handle.cancel();
        assert!(p.is_cancelled());
    }

    proptest! {
        #[test]
        fn prop_header_events_ascending(count in 1u32..25) {
            let mut p = authenticated(&format!("+OK {count} 0"));
            p.on_line("-ERR").unwrap();
            p.on_line("-ERR").unwrap();
            p.on_line("+OK").unwrap();
            p.on_block(b"").unwrap();
            for _ in 0..count {
                p.on_line("+OK").unwrap();
                spool(&mut p, "Subject: s\r\n\r\n").unwrap();
            }
            let events = browser_events(&mut p);
            let ordinals: Vec<u32> = events
                .iter()
                .filter_map(|e| match e {
                    ProtocolEvent::HeaderReady(h) => Some(h.ordinal),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(ordinals, (1..=count).collect::<Vec<_>>());
            prop_assert_eq!(events.last(), Some(&ProtocolEvent::ListingComplete(count)));
            prop_assert_eq!(p.state(), State::Idle);
        }
    }
}

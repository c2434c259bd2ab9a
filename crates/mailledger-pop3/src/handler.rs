//! Mailbox browser interface.
//!
//! The session reports everything a message-list window needs through
//! [`MailboxHandler`]: one header per message in ordinal order, listing and
//! deletion progress, and exactly one terminal callback (done or error).
//!
//! # Example
//!
//! ```
//! use mailledger_pop3::handler::MailboxHandler;
//! use mailledger_pop3::HeaderSummary;
//!
//! struct Rows(Vec<String>);
//!
//! impl MailboxHandler for Rows {
//!     fn on_header_ready(&mut self, header: &HeaderSummary) {
//!         self.0.push(format!("{} {}", header.ordinal, header.subject));
//!     }
//! }
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Error;
use crate::header::HeaderSummary;
use crate::protocol::ProtocolEvent;

/// Receiver of session events.
///
/// Every method has a no-op default.
pub trait MailboxHandler: Send {
    /// Headers of one message were parsed. Called in ascending ordinal order.
    fn on_header_ready(&mut self, header: &HeaderSummary) {
        let _ = header;
    }

    /// All `count` headers were listed; opening and deleting are now allowed.
    fn on_listing_complete(&mut self, count: u32) {
        let _ = count;
    }

    /// The server reported nothing to list.
    fn on_mailbox_empty(&mut self) {}

    /// STAT result, before any header is fetched.
    fn on_mailbox_size(&mut self, count: u32, total_bytes: u64) {
        let _ = (count, total_bytes);
    }

    /// One deletion was acknowledged by the server.
    fn on_message_deleted(&mut self, ordinal: u32) {
        let _ = ordinal;
    }

    /// A deletion batch finished.
    fn on_deletion_batch_complete(&mut self, deleted: usize) {
        let _ = deleted;
    }

    /// The full text of an opened message arrived.
    fn on_message_ready(&mut self, ordinal: u32, raw: &Bytes) {
        let _ = (ordinal, raw);
    }

    /// Progress text for a status bar.
    fn on_status(&mut self, text: &str) {
        let _ = text;
    }

    /// The session ended normally. Called at most once.
    fn on_session_done(&mut self) {}

    /// The session failed. Called at most once, and never together with
    /// [`on_session_done`](Self::on_session_done).
    fn on_session_error(&mut self, error: &Error) {
        let _ = error;
    }
}

/// Routes a protocol event to the handler.
///
/// Returns `false` for events the driver consumes itself (TLS upgrade and
/// transport close).
pub(crate) fn dispatch(handler: &mut dyn MailboxHandler, event: &ProtocolEvent) -> bool {
    match event {
        ProtocolEvent::Status(text) => handler.on_status(text),
        ProtocolEvent::MailboxSize { count, total_bytes } => {
            handler.on_mailbox_size(*count, *total_bytes);
        }
        ProtocolEvent::MailboxEmpty => handler.on_mailbox_empty(),
        ProtocolEvent::HeaderReady(header) => handler.on_header_ready(header),
        ProtocolEvent::ListingComplete(count) => handler.on_listing_complete(*count),
        ProtocolEvent::MessageDeleted(ordinal) => handler.on_message_deleted(*ordinal),
        ProtocolEvent::DeletionBatchComplete(deleted) => {
            handler.on_deletion_batch_complete(*deleted);
        }
        ProtocolEvent::MessageReady { ordinal, raw } => handler.on_message_ready(*ordinal, raw),
        ProtocolEvent::UpgradeTls | ProtocolEvent::Closed => return false,
    }
    true
}

/// A handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MailboxHandler for NoopHandler {}

/// A handler that logs events using tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MailboxHandler for LoggingHandler {
    fn on_header_ready(&mut self, header: &HeaderSummary) {
        tracing::debug!(
            ordinal = header.ordinal,
            subject = %header.subject,
            from = %header.from,
            size = header.size,
            "header"
        );
    }

    fn on_listing_complete(&mut self, count: u32) {
        tracing::info!(count, "listing complete");
    }

    fn on_mailbox_empty(&mut self) {
        tracing::info!("mailbox empty");
    }

    fn on_mailbox_size(&mut self, count: u32, total_bytes: u64) {
        tracing::debug!(count, total_bytes, "STAT");
    }

    fn on_message_deleted(&mut self, ordinal: u32) {
        tracing::debug!(ordinal, "deleted");
    }

    fn on_deletion_batch_complete(&mut self, deleted: usize) {
        tracing::info!(deleted, "deletion batch complete");
    }

    fn on_message_ready(&mut self, ordinal: u32, raw: &Bytes) {
        tracing::debug!(ordinal, len = raw.len(), "message retrieved");
    }

    fn on_status(&mut self, text: &str) {
        tracing::trace!(text, "status");
    }

    fn on_session_done(&mut self) {
        tracing::info!("session done");
    }

    fn on_session_error(&mut self, error: &Error) {
        tracing::error!(%error, "session error");
    }
}

/// An event recorded by [`CollectingHandler`] or sent by [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxEvent {
    /// See [`MailboxHandler::on_header_ready`].
    HeaderReady(HeaderSummary),
    /// See [`MailboxHandler::on_listing_complete`].
    ListingComplete(u32),
    /// See [`MailboxHandler::on_mailbox_empty`].
    MailboxEmpty,
    /// See [`MailboxHandler::on_mailbox_size`].
    MailboxSize {
        /// Number of messages.
        count: u32,
        /// Maildrop size in octets.
        total_bytes: u64,
    },
    /// See [`MailboxHandler::on_message_deleted`].
    MessageDeleted(u32),
    /// See [`MailboxHandler::on_deletion_batch_complete`].
    DeletionBatchComplete(usize),
    /// See [`MailboxHandler::on_message_ready`].
    MessageReady {
        /// Message ordinal.
        ordinal: u32,
        /// Raw message.
        raw: Bytes,
    },
    /// See [`MailboxHandler::on_status`].
    Status(String),
    /// See [`MailboxHandler::on_session_done`].
    SessionDone,
    /// See [`MailboxHandler::on_session_error`]; carries the error text.
    SessionError(String),
}

impl MailboxEvent {
    /// Returns `true` for `SessionDone` and `SessionError`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionDone | Self::SessionError(_))
    }
}

/// Forwards every callback as a [`MailboxEvent`] to `record`.
macro_rules! record_events {
    () => {
        fn on_header_ready(&mut self, header: &HeaderSummary) {
            self.record(MailboxEvent::HeaderReady(header.clone()));
        }

        fn on_listing_complete(&mut self, count: u32) {
            self.record(MailboxEvent::ListingComplete(count));
        }

        fn on_mailbox_empty(&mut self) {
            self.record(MailboxEvent::MailboxEmpty);
        }

        fn on_mailbox_size(&mut self, count: u32, total_bytes: u64) {
            self.record(MailboxEvent::MailboxSize { count, total_bytes });
        }

        fn on_message_deleted(&mut self, ordinal: u32) {
            self.record(MailboxEvent::MessageDeleted(ordinal));
        }

        fn on_deletion_batch_complete(&mut self, deleted: usize) {
            self.record(MailboxEvent::DeletionBatchComplete(deleted));
        }

        fn on_message_ready(&mut self, ordinal: u32, raw: &Bytes) {
            self.record(MailboxEvent::MessageReady {
                ordinal,
                raw: raw.clone(),
            });
        }

        fn on_status(&mut self, text: &str) {
            self.record(MailboxEvent::Status(text.to_string()));
        }

        fn on_session_done(&mut self) {
            self.record(MailboxEvent::SessionDone);
        }

        fn on_session_error(&mut self, error: &Error) {
            self.record(MailboxEvent::SessionError(error.to_string()));
        }
    };
}

/// A handler that collects events for later processing.
///
/// Useful for testing or batch processing of events.
#[derive(Debug, Default, Clone)]
pub struct CollectingHandler {
    /// Collected events.
    pub events: Vec<MailboxEvent>,
}

impl CollectingHandler {
    /// Creates a new collecting handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all collected events.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Takes all collected events, leaving the handler empty.
    pub fn take(&mut self) -> Vec<MailboxEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, event: MailboxEvent) {
        self.events.push(event);
    }
}

impl MailboxHandler for CollectingHandler {
    record_events!();
}

/// A handler that sends events over a tokio channel.
///
/// Lets a browser running on another task consume the session's events.
/// Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<MailboxEvent>,
}

impl ChannelHandler {
    /// Creates a handler and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MailboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn record(&self, event: MailboxEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("mailbox event receiver dropped");
        }
    }
}

impl MailboxHandler for ChannelHandler {
    record_events!();
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

    fn summary(ordinal: u32) -> HeaderSummary {
        HeaderSummary {
            ordinal,
            subject: "Hello".to_string(),
            from: "alice@example.com".to_string(),
            date: "(No Date)".to_string(),
            size: 1024,
        }
    }

    #[test]
    fn test_noop_handler() {
        let mut handler = NoopHandler;
        // Should not panic
        handler.on_header_ready(&summary(1));
        handler.on_listing_complete(1);
        handler.on_session_error(&Error::ConnectionClosed);
    }

    #[test]
    fn test_logging_handler() {
        let mut handler = LoggingHandler;
        handler.on_mailbox_size(2, 2048);
        handler.on_message_ready(1, &Bytes::from_static(b"x"));
        handler.on_session_done();
    }

    #[test]
    fn test_collecting_handler() {
        let mut handler = CollectingHandler::new();

        handler.on_header_ready(&summary(1));
        handler.on_listing_complete(1);
        handler.on_session_error(&Error::Locked("busy".to_string()));

        assert_eq!(handler.events.len(), 3);
        assert_eq!(handler.events[0], MailboxEvent::HeaderReady(summary(1)));
        assert_eq!(handler.events[1], MailboxEvent::ListingComplete(1));
        assert_eq!(
            handler.events[2],
            MailboxEvent::SessionError("Mailbox is locked: busy".to_string())
        );
        assert!(handler.events[2].is_terminal());

        let taken = handler.take();
        assert_eq!(taken.len(), 3);
        assert!(handler.events.is_empty());
    }

    #[test]
    fn test_collecting_handler_clear() {
        let mut handler = CollectingHandler::new();
        handler.on_message_deleted(2);
        handler.on_deletion_batch_complete(1);
        assert_eq!(handler.events.len(), 2);

        handler.clear();
        assert!(handler.events.is_empty());
    }

    #[test]
    fn test_dispatch() {
        let mut handler = CollectingHandler::new();
        assert!(dispatch(&mut handler, &ProtocolEvent::MailboxEmpty));
        assert!(dispatch(
            &mut handler,
            &ProtocolEvent::Status("No message".to_string())
        ));
        assert!(!dispatch(&mut handler, &ProtocolEvent::UpgradeTls));
        assert!(!dispatch(&mut handler, &ProtocolEvent::Closed));
        assert_eq!(
            handler.events,
            vec![
                MailboxEvent::MailboxEmpty,
                MailboxEvent::Status("No message".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_channel_handler() {
        let (mut handler, mut rx) = ChannelHandler::new();
        handler.on_mailbox_size(3, 1500);
        handler.on_session_done();

        assert_eq!(
            rx.recv().await,
            Some(MailboxEvent::MailboxSize {
                count: 3,
                total_bytes: 1500
            })
        );
        assert_eq!(rx.recv().await, Some(MailboxEvent::SessionDone));
    }

    #[test]
    fn test_channel_handler_receiver_dropped() {
        let (mut handler, rx) = ChannelHandler::new();
        drop(rx);
        handler.on_listing_complete(1);
    }
}

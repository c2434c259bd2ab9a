//! Protocol state.
//!
//! One enumeration covers both the RFC 1939 exchange and the browsing phase
//! that follows it (header listing, idle, deletion), since they are
//! sequential and mutually exclusive.

/// Session state. Each variant names the reply the session is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// Connected, nothing received yet.
    #[default]
    Ready,
    /// Waiting for the server greeting.
    Greeting,
    /// STLS sent.
    Stls,
    /// USER sent.
    AuthUser,
    /// PASS sent.
    AuthPass,
    /// APOP sent.
    AuthApop,
    /// STAT sent.
    RangeStat,
    /// LAST sent (UIDL fallback).
    RangeLast,
    /// UIDL sent, waiting for the status line.
    RangeUidl,
    /// Reading the UIDL block.
    RangeUidlRecv,
    /// LIST sent, waiting for the status line.
    SizeList,
    /// Reading the LIST block.
    SizeListRecv,
    /// `TOP n 0` sent, waiting for the status line.
    Top,
    /// Reading the header block of the current message.
    TopRecv,
    /// Listing done; waiting for a browser request.
    Idle,
    /// RETR sent, waiting for the status line.
    Retr,
    /// Reading the message block.
    RetrRecv,
    /// DELE sent.
    Delete,
    /// QUIT sent.
    Logout,
    /// Session finished normally.
    Done,
    /// Session failed.
    Error,
}

impl State {
    /// Returns `true` for `Done` and `Error`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Returns `true` while the session is still working through the
    /// protocol on its own, i.e. neither idle nor finished.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Done | Self::Error)
    }

    /// Returns `true` if a rejection of the in-flight command means the
    /// capability is absent rather than failure.
    #[must_use]
    pub const fn tolerates_rejection(self) -> bool {
        matches!(self, Self::RangeLast | Self::RangeUidl)
    }

    /// Returns `true` for the authentication exchanges.
    #[must_use]
    pub const fn is_auth(self) -> bool {
        matches!(self, Self::AuthUser | Self::AuthPass | Self::AuthApop)
    }

    /// How the next inbound data must be read.
    #[must_use]
    pub const fn read_mode(self) -> ReadMode {
        match self {
            Self::RangeUidlRecv | Self::SizeListRecv => ReadMode::Block,
            Self::TopRecv | Self::RetrRecv => ReadMode::Spool,
            _ => ReadMode::Line,
        }
    }

    /// Verb of the command whose reply this state waits for.
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::Ready | Self::Greeting => "greeting",
            Self::Stls => "STLS",
            Self::AuthUser => "USER",
            Self::AuthPass => "PASS",
            Self::AuthApop => "APOP",
            Self::RangeStat => "STAT",
            Self::RangeLast => "LAST",
            Self::RangeUidl | Self::RangeUidlRecv => "UIDL",
            Self::SizeList | Self::SizeListRecv => "LIST",
            Self::Top | Self::TopRecv => "TOP",
            Self::Retr | Self::RetrRecv => "RETR",
            Self::Delete => "DELE",
            Self::Logout => "QUIT",
            Self::Idle | Self::Done | Self::Error => "none",
        }
    }
}

/// How the driver must read the next response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// A single status line.
    Line,
    /// A dot-terminated block, buffered in memory.
    Block,
    /// A dot-terminated block, streamed to storage as it arrives.
    Spool,
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

    #[test]
    fn test_state_default() {
        assert_eq!(State::default(), State::Ready);
    }

    #[test]
    fn test_terminal_and_active() {
        assert!(State::Done.is_terminal());
        assert!(State::Error.is_terminal());
        assert!(!State::Idle.is_terminal());

        assert!(State::TopRecv.is_active());
        assert!(State::Delete.is_active());
        assert!(!State::Idle.is_active());
        assert!(!State::Done.is_active());
        assert!(!State::Error.is_active());
    }

    #[test]
    fn test_read_modes() {
        assert_eq!(State::RangeUidlRecv.read_mode(), ReadMode::Block);
        assert_eq!(State::SizeListRecv.read_mode(), ReadMode::Block);
        assert_eq!(State::TopRecv.read_mode(), ReadMode::Spool);
        assert_eq!(State::RetrRecv.read_mode(), ReadMode::Spool);
        assert_eq!(State::RangeUidl.read_mode(), ReadMode::Line);
    }

    #[test]
    fn test_tolerated_rejections() {
        assert!(State::RangeUidl.tolerates_rejection());
        assert!(State::RangeLast.tolerates_rejection());
        assert!(!State::Top.tolerates_rejection());
        assert!(!State::Delete.tolerates_rejection());
    }
}

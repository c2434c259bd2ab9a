//! Response classification and body parsing.
//!
//! POP3 status lines start with `+OK` or `-ERR`. The classifier decides the
//! [`Outcome`] and strips the status token to expose the body; interpreting
//! the body is left to the state machine, which calls the parsers in
//! [`listing`] for the replies it expects.

mod listing;

pub use listing::{greeting_timestamp, parse_last, parse_size_listing, parse_stat, parse_uidl_listing};

use crate::{Error, Result};

/// Outcome of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `+OK`.
    Success,
    /// `-ERR` for a command without a fallback.
    Failure,
    /// `-ERR` for an optional command (LAST, UIDL); the caller falls back.
    NotSupported,
    /// `-ERR` reporting that the maildrop is locked or busy.
    Locked,
}

impl Outcome {
    /// Returns `true` for `+OK`.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A classified status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply<'a> {
    /// Classification of the status token.
    pub outcome: Outcome,
    /// Text after the status token and following whitespace.
    pub body: &'a str,
}

/// Classifies a status line.
///
/// `optional` marks the in-flight command as one whose rejection means
/// "capability absent" rather than failure.
///
/// # Errors
///
/// Returns [`Error::Malformed`] if the line starts with neither `+` nor `-`.
pub fn classify(line: &str, optional: bool) -> Result<Reply<'_>> {
    let outcome = if line.starts_with("+OK") {
        Outcome::Success
    } else if let Some(text) = line.strip_prefix("-ERR") {
        if is_lock_message(text) {
            Outcome::Locked
        } else if optional {
            Outcome::NotSupported
        } else {
            Outcome::Failure
        }
    } else {
        return Err(Error::Malformed(format!("unexpected status line: {line}")));
    };

    Ok(Reply {
        outcome,
        body: strip_status(line),
    })
}

/// Skips the status marker, the alphabetic status word and whitespace.
#[must_use]
pub fn strip_status(line: &str) -> &str {
    let rest = line
        .strip_prefix('+')
        .or_else(|| line.strip_prefix('-'))
        .unwrap_or(line);
    rest.trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim_start_matches(|c: char| c.is_ascii_whitespace())
}

/// Servers report a locked maildrop in free text; these are the markers
/// seen in practice.
fn is_lock_message(text: &str) -> bool {
    text.contains("lock")
        || text.contains("Lock")
        || text.contains("LOCK")
        || text.contains("wait")
        || text.to_ascii_lowercase().contains("timeout")
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
    fn test_classify_success() {
        let reply = classify("+OK 3 1500", false).unwrap();
        assert_eq!(reply.outcome, Outcome::Success);
        assert_eq!(reply.body, "3 1500");
    }

    #[test]
    fn test_classify_failure() {
        let reply = classify("-ERR no such message", false).unwrap();
        assert_eq!(reply.outcome, Outcome::Failure);
        assert_eq!(reply.body, "no such message");
    }

    #[test]
    fn test_classify_optional_command() {
        let reply = classify("-ERR unknown command", true).unwrap();
        assert_eq!(reply.outcome, Outcome::NotSupported);
    }

    #[test]
    fn test_classify_locked_wins_over_optional() {
        assert_eq!(
            classify("-ERR [IN-USE] maildrop locked", true).unwrap().outcome,
            Outcome::Locked
        );
        assert_eq!(
            classify("-ERR please wait", false).unwrap().outcome,
            Outcome::Locked
        );
        assert_eq!(
            classify("-ERR Session TIMEOUT", false).unwrap().outcome,
            Outcome::Locked
        );
    }

    #[test]
    fn test_classify_malformed() {
        assert!(matches!(
            classify("* OK IMAP4 ready", false),
            Err(Error::Malformed(_))
        ));
        assert!(classify("", false).is_err());
    }

    #[test]
    fn test_strip_status() {
        assert_eq!(strip_status("+OK"), "");
        assert_eq!(strip_status("+OK   ready <1.2@host>"), "ready <1.2@host>");
        assert_eq!(strip_status("-ERR\tbad"), "bad");
        assert_eq!(strip_status("+ 2 40"), "2 40");
    }
}

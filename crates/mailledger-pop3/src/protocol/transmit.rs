//! Outgoing command data.

use std::fmt;

use crate::command::Command;

/// One command line to send to the server.
///
/// The protocol layer produces these; the I/O layer writes [`Transmit::data`]
/// and may log the transmit through its `Display`, which masks secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Transmit {
    command: Command,
    data: Vec<u8>,
}

impl Transmit {
    /// Serializes `command` for the wire.
    #[must_use]
    pub fn new(command: Command) -> Self {
        let data = command.serialize();
        Self { command, data }
    }

    /// The command being sent.
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// Wire bytes, CRLF included.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the length of the data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the transmit is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Command> for Transmit {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}

impl AsRef<[u8]> for Transmit {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Display for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.command.fmt(f)
    }
}

impl fmt::Debug for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transmit({})", self.command)
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

    #[test]
    fn test_transmit_new() {
        let t = Transmit::new(Command::Top { msg: 3, lines: 0 });
        assert_eq!(t.data(), b"TOP 3 0\r\n");
        assert_eq!(t.len(), 9);
        assert!(!t.is_empty());
        assert_eq!(t.command().verb(), "TOP");
    }

    #[test]
    fn test_transmit_display_masks_password() {
        let t: Transmit = Command::Pass {
            password: "hunter2".to_string(),
        }
        .into();
        assert_eq!(t.data(), b"PASS hunter2\r\n");
        assert_eq!(t.to_string(), "PASS ********");
        assert!(!format!("{t:?}").contains("hunter2"));
    }

    #[test]
    fn test_transmit_as_ref() {
        let t = Transmit::new(Command::Quit);
        let slice: &[u8] = t.as_ref();
        assert_eq!(slice, b"QUIT\r\n");
    }
}

//! Error types for the POP3 library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during a POP3 session.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// The server closed the connection.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Server answered `-ERR` to a command that has no fallback.
    #[error("Server rejected {command}: {message}")]
    Server {
        /// Verb of the rejected command.
        command: &'static str,
        /// Error text sent by the server.
        message: String,
    },

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The maildrop is locked by another session.
    #[error("Mailbox is locked: {0}")]
    Locked(String),

    /// A response could not be parsed into the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// A request was issued in a state that does not accept it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Data arrived after the session reached a terminal state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A message ordinal outside the mailbox range.
    #[error("No such message: {0}")]
    InvalidOrdinal(u32),
}

impl Error {
    /// Returns `true` if the error came from the underlying transport.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Tls(_)
                | Self::InvalidDnsName(_)
                | Self::ConnectionClosed
                | Self::Timeout(_)
        )
    }

    /// Returns `true` if the error ends the session.
    ///
    /// Rejected requests (`InvalidState`, `InvalidOrdinal`) leave the session
    /// usable; everything else tears it down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState(_) | Self::InvalidOrdinal(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

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
    fn test_transport_classification() {
        assert!(Error::ConnectionClosed.is_transport());
        assert!(Error::Timeout(Duration::from_secs(1)).is_transport());
        assert!(!Error::Malformed("x".into()).is_transport());
        assert!(
            !Error::Server {
                command: "DELE",
                message: "no such message".into()
            }
            .is_transport()
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Auth("bad password".into()).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(!Error::InvalidState("busy".into()).is_fatal());
        assert!(!Error::InvalidOrdinal(9).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::Server {
            command: "STAT",
            message: "maildrop unavailable".into(),
        };
        assert_eq!(err.to_string(), "Server rejected STAT: maildrop unavailable");
    }
}

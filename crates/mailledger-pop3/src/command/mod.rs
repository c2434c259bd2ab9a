//! POP3 command builder.
//!
//! Commands are line-atomic: a verb, space-separated arguments and CRLF.
//! Arguments are ordinals or identifiers, so nothing needs quoting.

use std::fmt;
use std::fmt::Write as _;

use md5::{Digest, Md5};

/// POP3 command.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// USER command.
    User {
        /// Mailbox user name.
        username: String,
    },
    /// PASS command.
    Pass {
        /// Plaintext secret.
        password: String,
    },
    /// APOP command (RFC 1939 section 7).
    Apop {
        /// Mailbox user name.
        username: String,
        /// Lowercase hex MD5 digest of the greeting timestamp and secret.
        digest: String,
    },
    /// STLS command (RFC 2595).
    Stls,
    /// STAT command.
    Stat,
    /// LAST command (RFC 1460, obsolete but still served).
    Last,
    /// UIDL command for the whole maildrop.
    Uidl,
    /// LIST command for the whole maildrop.
    List,
    /// TOP command.
    Top {
        /// Message ordinal.
        msg: u32,
        /// Number of body lines to include.
        lines: u32,
    },
    /// RETR command.
    Retr {
        /// Message ordinal.
        msg: u32,
    },
    /// DELE command.
    Dele {
        /// Message ordinal.
        msg: u32,
    },
    /// QUIT command.
    Quit,
}

impl Command {
    /// Builds an APOP command from the greeting timestamp and the secret.
    #[must_use]
    pub fn apop(username: impl Into<String>, timestamp: &str, secret: &str) -> Self {
        Self::Apop {
            username: username.into(),
            digest: apop_digest(timestamp, secret),
        }
    }

    /// Returns the command verb.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::User { .. } => "USER",
            Self::Pass { .. } => "PASS",
            Self::Apop { .. } => "APOP",
            Self::Stls => "STLS",
            Self::Stat => "STAT",
            Self::Last => "LAST",
            Self::Uidl => "UIDL",
            Self::List => "LIST",
            Self::Top { .. } => "TOP",
            Self::Retr { .. } => "RETR",
            Self::Dele { .. } => "DELE",
            Self::Quit => "QUIT",
        }
    }

    /// Returns `true` if a positive reply is followed by a dot-terminated block.
    #[must_use]
    pub const fn is_multiline(&self) -> bool {
        matches!(
            self,
            Self::Uidl | Self::List | Self::Top { .. } | Self::Retr { .. }
        )
    }

    /// Serializes the command to wire format, including the CRLF terminator.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut line = String::from(self.verb());
        match self {
            Self::User { username } => push_arg(&mut line, username),
            Self::Pass { password } => push_arg(&mut line, password),
            Self::Apop { username, digest } => {
                push_arg(&mut line, username);
                push_arg(&mut line, digest);
            }
            Self::Top { msg, lines } => {
                let _ = write!(line, " {msg} {lines}");
            }
            Self::Retr { msg } | Self::Dele { msg } => {
                let _ = write!(line, " {msg}");
            }
            Self::Stls | Self::Stat | Self::Last | Self::Uidl | Self::List | Self::Quit => {}
        }
        line.push_str("\r\n");
        line.into_bytes()
    }
}

fn push_arg(line: &mut String, arg: &str) {
    line.push(' ');
    line.push_str(arg);
}

/// Formats the command for logs. The PASS secret is masked.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass { .. } => f.write_str("PASS ********"),
            other => {
                let wire = other.serialize();
                let text = String::from_utf8_lossy(&wire);
                f.write_str(text.trim_end_matches("\r\n"))
            }
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({self})")
    }
}

/// Computes the APOP digest: lowercase hex of `MD5(timestamp || secret)`.
#[must_use]
pub fn apop_digest(timestamp: &str, secret: &str) -> String {
    let digest = Md5::new()
        .chain_update(timestamp.as_bytes())
        .chain_update(secret.as_bytes())
        .finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
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
    fn test_serialize_simple() {
        assert_eq!(Command::Stat.serialize(), b"STAT\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
        assert_eq!(Command::Stls.serialize(), b"STLS\r\n");
    }

    #[test]
    fn test_serialize_with_arguments() {
        assert_eq!(
            Command::User {
                username: "alice".into()
            }
            .serialize(),
            b"USER alice\r\n"
        );
        assert_eq!(Command::Top { msg: 3, lines: 0 }.serialize(), b"TOP 3 0\r\n");
        assert_eq!(Command::Dele { msg: 17 }.serialize(), b"DELE 17\r\n");
        assert_eq!(Command::Retr { msg: 2 }.serialize(), b"RETR 2\r\n");
    }

    #[test]
    fn test_apop_digest_rfc1939_example() {
        // Example from RFC 1939 section 7.
        let digest = apop_digest("<1896.697170952@dbc.mtview.ca.us>", "tanstaaf");
        assert_eq!(digest, "c4c9334bac560ecc979e58001b3e22fb");

        let cmd = Command::apop("mrose", "<1896.697170952@dbc.mtview.ca.us>", "tanstaaf");
        assert_eq!(
            cmd.serialize(),
            b"APOP mrose c4c9334bac560ecc979e58001b3e22fb\r\n"
        );
    }

    #[test]
    fn test_display_masks_password() {
        let cmd = Command::Pass {
            password: "hunter2".into(),
        };
        assert_eq!(cmd.to_string(), "PASS ********");
        assert!(!format!("{cmd:?}").contains("hunter2"));
        assert_eq!(Command::Dele { msg: 4 }.to_string(), "DELE 4");
    }

    #[test]
    fn test_multiline_commands() {
        assert!(Command::Uidl.is_multiline());
        assert!(Command::List.is_multiline());
        assert!(Command::Top { msg: 1, lines: 0 }.is_multiline());
        assert!(!Command::Stat.is_multiline());
        assert!(!Command::Dele { msg: 1 }.is_multiline());
    }
}

//! Authentication strategy selection.

/// How the session authenticates after the greeting (and STLS, if any).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AuthMethod {
    /// Plaintext `USER` followed by `PASS`.
    #[default]
    User,
    /// `APOP` challenge-response over the greeting timestamp.
    Apop,
}

/// Credentials handed to the protocol state machine.
///
/// The secret is already resolved here; deferred retrieval happens in the
/// driver before the session starts.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Mailbox user name.
    pub username: String,
    /// Password or APOP shared secret.
    pub secret: String,
    /// Authentication strategy.
    pub method: AuthMethod,
}

impl Credentials {
    /// Creates plaintext USER/PASS credentials.
    #[must_use]
    pub fn user(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            method: AuthMethod::User,
        }
    }

    /// Creates APOP credentials.
    #[must_use]
    pub fn apop(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            method: AuthMethod::Apop,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"********")
            .field("method", &self.method)
            .finish()
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
    fn test_debug_hides_secret() {
        let creds = Credentials::apop("alice", "tanstaaf");
        let debug = format!("{creds:?}");
        assert!(debug.contains("alice"));
        assert!(debug.contains("Apop"));
        assert!(!debug.contains("tanstaaf"));
    }

    #[test]
    fn test_default_method() {
        assert_eq!(AuthMethod::default(), AuthMethod::User);
        assert_eq!(Credentials::user("a", "b").method, AuthMethod::User);
    }
}

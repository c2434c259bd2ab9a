//! Account and connection configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{AuthMethod, Credentials};
use crate::{Error, Result};

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Security {
    /// No encryption (port 110). **Not recommended for production.**
    None,
    /// Start with plaintext, upgrade with STLS (port 110).
    StartTls,
    /// TLS from the start (port 995). **Recommended.**
    #[default]
    Implicit,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None | Self::StartTls => crate::POP3_PORT,
            Self::Implicit => crate::POP3S_PORT,
        }
    }
}

/// Callback that produces the secret on demand, e.g. from a password prompt.
pub type SecretCallback = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Where the password or APOP secret comes from.
#[derive(Clone)]
pub enum Secret {
    /// Stored secret.
    Password(String),
    /// Asked for once, right before connecting. `None` aborts the session.
    Deferred(SecretCallback),
}

impl Secret {
    /// Wraps a retrieval callback.
    #[must_use]
    pub fn deferred(callback: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Deferred(Arc::new(callback))
    }

    /// Returns the secret, invoking the callback if deferred.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the callback yields nothing.
    pub fn resolve(&self) -> Result<String> {
        match self {
            Self::Password(password) => Ok(password.clone()),
            Self::Deferred(callback) => {
                callback().ok_or_else(|| Error::Auth("no password supplied".to_string()))
            }
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(********)"),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

impl From<&str> for Secret {
    fn from(password: &str) -> Self {
        Self::Password(password.to_string())
    }
}

impl From<String> for Secret {
    fn from(password: String) -> Self {
        Self::Password(password)
    }
}

/// POP3 account configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Authentication strategy.
    pub auth: AuthMethod,
    /// Mailbox user name.
    pub username: String,
    /// Password or APOP secret.
    pub secret: Secret,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read/write timeout.
    pub io_timeout: Duration,
}

impl Config {
    /// Creates a USER/PASS configuration with implicit TLS on port 995.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        secret: impl Into<Secret>,
    ) -> Self {
        ConfigBuilder::new(host)
            .username(username)
            .secret(secret)
            .build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Returns `true` if STLS must be negotiated after the greeting.
    #[must_use]
    pub fn starttls(&self) -> bool {
        self.security == Security::StartTls
    }

    /// Resolves the secret into the credentials the protocol uses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if a deferred secret yields nothing.
    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            username: self.username.clone(),
            secret: self.secret.resolve()?,
            method: self.auth,
        })
    }
}

/// Builder for account configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    auth: AuthMethod,
    username: String,
    secret: Secret,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::Implicit,
            auth: AuthMethod::User,
            username: String::new(),
            secret: Secret::Password(String::new()),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the authentication strategy.
    #[must_use]
    pub const fn auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the user name.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Sets the secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<Secret>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the I/O timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            host: self.host,
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            security: self.security,
            auth: self.auth,
            username: self.username,
            secret: self.secret,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
        }
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
    fn test_default_ports() {
        assert_eq!(Security::None.default_port(), 110);
        assert_eq!(Security::StartTls.default_port(), 110);
        assert_eq!(Security::Implicit.default_port(), 995);
    }

    #[test]
    fn test_config_new() {
        let config = Config::new("pop.example.com", "alice", "secret");
        assert_eq!(config.host, "pop.example.com");
        assert_eq!(config.port, 995);
        assert_eq!(config.security, Security::Implicit);
        assert_eq!(config.auth, AuthMethod::User);
        assert!(!config.starttls());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder("pop.example.com")
            .port(1110)
            .security(Security::StartTls)
            .auth(AuthMethod::Apop)
            .username("bob")
            .secret("tanstaaf")
            .connect_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.port, 1110);
        assert!(config.starttls());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(60));

        let creds = config.credentials().unwrap();
        assert_eq!(creds.username, "bob");
        assert_eq!(creds.secret, "tanstaaf");
        assert_eq!(creds.method, AuthMethod::Apop);
    }

    #[test]
    fn test_config_builder_default_port() {
        let config = Config::builder("pop.example.com")
            .security(Security::None)
            .build();

        assert_eq!(config.port, 110);
    }

    #[test]
    fn test_deferred_secret() {
        let config = Config::builder("pop.example.com")
            .secret(Secret::deferred(|| Some("prompted".to_string())))
            .build();
        assert_eq!(config.credentials().unwrap().secret, "prompted");

        let config = Config::builder("pop.example.com")
            .secret(Secret::deferred(|| None))
            .build();
        assert!(matches!(config.credentials(), Err(Error::Auth(_))));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let config = Config::new("pop.example.com", "alice", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}

//! POP3 connection management.
//!
//! This module provides connection handling for POP3 servers, including:
//! - Account configuration (host, port, security mode, credentials)
//! - TLS/plaintext stream abstraction with in-place STLS upgrade
//! - Framed I/O over the sans-I/O line reader
//! - The session driver and the handle the browser talks to

mod config;
mod framed;
mod session;
mod stream;

pub use config::{Config, ConfigBuilder, Secret, SecretCallback, Security};
pub use framed::FramedStream;
pub use session::{Request, Session, SessionHandle};
pub use stream::{Pop3Stream, StartTls, connect, connect_plain, connect_tls, create_tls_connector};

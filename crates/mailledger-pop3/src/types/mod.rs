//! Core POP3 types: credentials, per-message records, the mailbox table and
//! the deletion queue.

mod auth;
mod deletion;
mod message;

pub use auth::{AuthMethod, Credentials};
pub use deletion::DeletionQueue;
pub use message::{Mailbox, MessageRecord};

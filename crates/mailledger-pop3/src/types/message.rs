//! Per-message metadata and the mailbox table.

use chrono::{DateTime, Utc};

use crate::{Error, Result};

/// Metadata for one remote message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageRecord {
    /// 1-based server ordinal, valid for this session only.
    pub ordinal: u32,
    /// Size in octets, from LIST.
    pub size: u64,
    /// Unique identifier from UIDL, if the server supports it.
    pub uid: Option<String>,
    deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Creates a record with no size or UID yet.
    #[must_use]
    pub const fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            size: 0,
            uid: None,
            deleted: false,
            deleted_at: None,
        }
    }

    /// Returns `true` once a DELE for this message was acknowledged.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns when the deletion was acknowledged.
    #[must_use]
    pub const fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Marks the message deleted.
    ///
    /// Returns `false` and keeps the first timestamp if it already was.
    pub fn mark_deleted(&mut self, at: DateTime<Utc>) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        self.deleted_at = Some(at);
        true
    }
}

/// The per-message table of one session, indexed by ordinal `1..=count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailbox {
    messages: Vec<MessageRecord>,
    total_size: u64,
}

impl Mailbox {
    /// Creates the table from a STAT reply.
    #[must_use]
    pub fn new(count: u32, total_size: u64) -> Self {
        Self {
            messages: (1..=count).map(MessageRecord::new).collect(),
            total_size,
        }
    }

    /// Number of messages reported by STAT.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // built from a u32 count
    pub fn count(&self) -> u32 {
        self.messages.len() as u32
    }

    /// Returns `true` if the mailbox has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total maildrop size reported by STAT.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Returns the record for `ordinal`.
    #[must_use]
    pub fn get(&self, ordinal: u32) -> Option<&MessageRecord> {
        let index = usize::try_from(ordinal).ok()?.checked_sub(1)?;
        self.messages.get(index)
    }

    /// Returns the mutable record for `ordinal`.
    pub fn get_mut(&mut self, ordinal: u32) -> Option<&mut MessageRecord> {
        let index = usize::try_from(ordinal).ok()?.checked_sub(1)?;
        self.messages.get_mut(index)
    }

    /// Checks that `ordinal` names a message in this mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrdinal`] if it does not.
    pub fn check(&self, ordinal: u32) -> Result<()> {
        self.get(ordinal)
            .map(|_| ())
            .ok_or(Error::InvalidOrdinal(ordinal))
    }

    /// Records the UID of a message; out-of-range ordinals are ignored.
    pub fn set_uid(&mut self, ordinal: u32, uid: String) {
        if let Some(record) = self.get_mut(ordinal) {
            record.uid = Some(uid);
        }
    }

    /// Records the size of a message; out-of-range ordinals are ignored.
    pub fn set_size(&mut self, ordinal: u32, size: u64) {
        if let Some(record) = self.get_mut(ordinal) {
            record.size = size;
        }
    }

    /// Marks a message deleted. See [`MessageRecord::mark_deleted`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOrdinal`] for an unknown ordinal.
    pub fn mark_deleted(&mut self, ordinal: u32, at: DateTime<Utc>) -> Result<bool> {
        self.get_mut(ordinal)
            .map(|record| record.mark_deleted(at))
            .ok_or(Error::InvalidOrdinal(ordinal))
    }

    /// Number of messages marked deleted.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_deleted()).count()
    }

    /// Iterates over the records in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = &MessageRecord> {
        self.messages.iter()
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
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_mailbox_indexing_is_one_based() {
        let mailbox = Mailbox::new(3, 1500);
        assert_eq!(mailbox.count(), 3);
        assert_eq!(mailbox.total_size(), 1500);
        assert!(mailbox.get(0).is_none());
        assert_eq!(mailbox.get(1).unwrap().ordinal, 1);
        assert_eq!(mailbox.get(3).unwrap().ordinal, 3);
        assert!(mailbox.get(4).is_none());
    }

    #[test]
    fn test_empty_mailbox() {
        let mailbox = Mailbox::new(0, 0);
        assert!(mailbox.is_empty());
        assert!(matches!(mailbox.check(1), Err(Error::InvalidOrdinal(1))));
    }

    #[test]
    fn test_set_uid_and_size() {
        let mut mailbox = Mailbox::new(2, 0);
        mailbox.set_uid(2, "abc".into());
        mailbox.set_size(1, 120);
        mailbox.set_size(7, 999);
        assert_eq!(mailbox.get(2).unwrap().uid.as_deref(), Some("abc"));
        assert_eq!(mailbox.get(1).unwrap().size, 120);
        assert!(mailbox.get(1).unwrap().uid.is_none());
    }

    #[test]
    fn test_mark_deleted_is_idempotent() {
        let mut mailbox = Mailbox::new(2, 0);
        assert!(!mailbox.get(2).unwrap().is_deleted());

        assert!(mailbox.mark_deleted(2, at(100)).unwrap());
        assert!(mailbox.get(2).unwrap().is_deleted());

        assert!(!mailbox.mark_deleted(2, at(200)).unwrap());
        let record = mailbox.get(2).unwrap();
        assert!(record.is_deleted());
        assert_eq!(record.deleted_at(), Some(at(100)));
        assert_eq!(mailbox.deleted_count(), 1);
    }

    #[test]
    fn test_mark_deleted_unknown_ordinal() {
        let mut mailbox = Mailbox::new(1, 0);
        assert!(matches!(
            mailbox.mark_deleted(5, at(0)),
            Err(Error::InvalidOrdinal(5))
        ));
    }
}

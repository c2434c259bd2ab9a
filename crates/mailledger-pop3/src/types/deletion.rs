//! Queue of ordinals awaiting DELE.

/// Ordered ordinals the browser asked to delete, processed one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionQueue {
    ordinals: Vec<u32>,
    cursor: usize,
}

impl DeletionQueue {
    /// Creates a queue; returns `None` if there is nothing to delete.
    #[must_use]
    pub fn new(ordinals: Vec<u32>) -> Option<Self> {
        (!ordinals.is_empty()).then_some(Self {
            ordinals,
            cursor: 0,
        })
    }

    /// Ordinal whose DELE is (or is about to be) in flight.
    #[must_use]
    pub fn current(&self) -> Option<u32> {
        self.ordinals.get(self.cursor).copied()
    }

    /// Moves past the current ordinal and returns the next one, if any.
    pub fn advance(&mut self) -> Option<u32> {
        if self.cursor < self.ordinals.len() {
            self.cursor += 1;
        }
        self.current()
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
    fn test_empty_queue_is_none() {
        assert!(DeletionQueue::new(Vec::new()).is_none());
    }

    #[test]
    fn test_queue_preserves_order() {
        let mut queue = DeletionQueue::new(vec![2, 5, 7]).unwrap();
        assert_eq!(queue.current(), Some(2));
        assert_eq!(queue.advance(), Some(5));
        assert_eq!(queue.advance(), Some(7));
        assert_eq!(queue.advance(), None);
        assert_eq!(queue.advance(), None);
        assert_eq!(queue.current(), None);
    }
}

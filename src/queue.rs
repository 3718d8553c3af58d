//! Pluggable event queue.

use std::collections::VecDeque;

use crate::error::BoxError;

/// FIFO container consumed by the dispatchers.
///
/// The default implementation is [`VecDeque`], whose `push_back` never
/// fails. A queue that rejects an event must leave itself unchanged; the
/// machine reports the rejection to the `add_event` caller and keeps its
/// current configuration.
pub trait EventQueue<E>: Send {
    /// Appends an event at the back of the queue.
    fn push_back(&mut self, event: E) -> Result<(), BoxError>;

    /// Removes and returns the front event, if any.
    fn pop_front(&mut self) -> Option<E>;

    /// True if no events are queued.
    fn is_empty(&self) -> bool;
}

impl<E: Send> EventQueue<E> for VecDeque<E> {
    fn push_back(&mut self, event: E) -> Result<(), BoxError> {
        VecDeque::push_back(self, event);
        Ok(())
    }

    fn pop_front(&mut self) -> Option<E> {
        VecDeque::pop_front(self)
    }

    fn is_empty(&self) -> bool {
        VecDeque::is_empty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vecdeque_queue_is_fifo() {
        let mut q: VecDeque<i32> = VecDeque::new();
        assert!(EventQueue::is_empty(&q));

        EventQueue::push_back(&mut q, 1).unwrap();
        EventQueue::push_back(&mut q, 2).unwrap();
        assert!(!EventQueue::is_empty(&q));

        assert_eq!(EventQueue::pop_front(&mut q), Some(1));
        assert_eq!(EventQueue::pop_front(&mut q), Some(2));
        assert_eq!(EventQueue::pop_front(&mut q), None);
    }
}

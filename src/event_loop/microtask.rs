//! Microtask queue
//!
//! Strict FIFO of zero-argument continuations. The scheduler pops one entry
//! at a time and releases its borrow before running it, so a running
//! microtask may enqueue more work; those entries land behind everything
//! already queued and are drained in the same pass.

use super::Scheduler;
use crate::error::Completion;
use std::collections::VecDeque;

/// A zero-argument continuation. `Err` carries a thrown value.
pub type MicrotaskFn = Box<dyn FnOnce(&Scheduler) -> Completion>;

/// One queued continuation plus its insertion sequence number
pub struct Microtask {
    /// Insertion sequence number (strictly increasing)
    pub seq: u64,
    /// Short label used in trace output ("queue", "reaction", "adopt", ...)
    pub label: &'static str,
    pub(crate) job: MicrotaskFn,
}

impl std::fmt::Debug for Microtask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microtask")
            .field("seq", &self.seq)
            .field("label", &self.label)
            .finish()
    }
}

/// FIFO queue of [`Microtask`]s
#[derive(Debug, Default)]
pub struct MicrotaskQueue {
    queue: VecDeque<Microtask>,
    next_seq: u64,
}

impl MicrotaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a continuation; returns its sequence number
    pub fn enqueue(&mut self, label: &'static str, job: MicrotaskFn) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(Microtask { seq, label, job });
        seq
    }

    /// Remove the oldest entry
    pub fn pop(&mut self) -> Option<Microtask> {
        self.queue.pop_front()
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every queued entry, returning how many were discarded
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Value;

    fn noop() -> MicrotaskFn {
        Box::new(|_| Ok(Value::Undefined))
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = MicrotaskQueue::new();
        queue.enqueue("a", noop());
        queue.enqueue("b", noop());
        queue.enqueue("c", noop());

        let labels: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|t| t.label).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut queue = MicrotaskQueue::new();
        let first = queue.enqueue("a", noop());
        let second = queue.enqueue("b", noop());
        assert!(second > first);
        assert_eq!(queue.pop().map(|t| t.seq), Some(first));
        // Numbers are never reused after a pop
        let third = queue.enqueue("c", noop());
        assert!(third > second);
    }

    #[test]
    fn test_clear() {
        let mut queue = MicrotaskQueue::new();
        queue.enqueue("a", noop());
        queue.enqueue("b", noop());
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.len(), 0);
    }
}

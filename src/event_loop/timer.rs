//! Timer registry
//!
//! Entries live in an arena of stable-indexed slots. A min-heap of
//! `(due, seq, slot)` keys orders them; keys are never edited in place.
//! Cancelling or finishing an entry turns its slot into a tombstone and the
//! matching heap key goes stale. Tombstones are only reclaimed by
//! [`TimerRegistry::compact`], which the scheduler calls between firing
//! passes, so a callback may schedule or cancel timers while it is firing.

use super::Scheduler;
use crate::error::Completion;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

/// Timer handle returned by `schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timer callback. Repeating timers call it once per firing.
pub type TimerCallback = Box<dyn FnMut(&Scheduler) -> Completion>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    /// Waiting in the heap
    Armed,
    /// Callback checked out by the scheduler
    Firing,
    /// Fired one-shot or cancelled; reclaimed by the next compaction
    Dead,
}

struct TimerEntry {
    id: TimerId,
    due: u64,
    interval: Option<u64>,
    callback: Option<TimerCallback>,
    cancelled: bool,
    seq: u64,
    state: EntryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DueKey {
    due: u64,
    seq: u64,
    slot: usize,
}

/// A timer whose callback has been checked out for firing.
///
/// Hand it back through [`TimerRegistry::finish`] once the callback returns.
pub struct FiringTimer {
    /// Timer handle
    pub id: TimerId,
    /// Due time the entry was selected at
    pub due: u64,
    /// Whether the entry re-arms after this firing
    pub repeating: bool,
    /// The callback to invoke
    pub callback: TimerCallback,
    slot: usize,
}

/// Ordered collection of pending timed callbacks
#[derive(Default)]
pub struct TimerRegistry {
    slots: Vec<Option<TimerEntry>>,
    free: Vec<usize>,
    by_id: HashMap<TimerId, usize>,
    queue: BinaryHeap<Reverse<DueKey>>,
    next_id: u64,
    next_seq: u64,
    armed: usize,
    tombstones: usize,
}

impl TimerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Register a callback due `delay` ms after `now`.
    ///
    /// `interval` re-arms the entry after each firing.
    pub fn schedule(
        &mut self,
        now: u64,
        delay: u64,
        callback: TimerCallback,
        repeating: bool,
    ) -> TimerId {
        let id = TimerId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        let seq = self.bump_seq();
        let due = now.saturating_add(delay);

        let entry = TimerEntry {
            id,
            due,
            interval: repeating.then_some(delay),
            callback: Some(callback),
            cancelled: false,
            seq,
            state: EntryState::Armed,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        self.by_id.insert(id, slot);
        self.queue.push(Reverse(DueKey { due, seq, slot }));
        self.armed += 1;
        id
    }

    /// Mark a timer cancelled. Unknown, fired, or already cancelled ids are
    /// ignored. Returns whether an entry was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.by_id.remove(&id) else {
            return false;
        };
        let Some(entry) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
            return false;
        };
        match entry.state {
            EntryState::Armed => {
                entry.cancelled = true;
                entry.state = EntryState::Dead;
                self.armed -= 1;
                self.tombstones += 1;
                true
            }
            EntryState::Firing => {
                // finish() will see the flag and not re-arm
                entry.cancelled = true;
                if entry.interval.is_some() {
                    self.armed -= 1;
                }
                true
            }
            EntryState::Dead => false,
        }
    }

    /// Due time of the next live entry, skipping stale heap keys
    pub fn next_due(&mut self) -> Option<u64> {
        while let Some(Reverse(key)) = self.queue.peek().copied() {
            if self.is_live(&key) {
                return Some(key.due);
            }
            self.queue.pop();
        }
        None
    }

    /// Check out the earliest entry whose due time is `<= now`.
    ///
    /// Ties on due time go to the earlier registration.
    pub fn take_due(&mut self, now: u64) -> Option<FiringTimer> {
        let due = self.next_due()?;
        if due > now {
            return None;
        }
        let Reverse(key) = self.queue.pop()?;
        let entry = self.slots[key.slot].as_mut()?;

        entry.state = EntryState::Firing;
        let repeating = entry.interval.is_some();
        if !repeating {
            // A one-shot that started firing can no longer be cancelled
            self.by_id.remove(&entry.id);
            self.armed -= 1;
        }
        let callback = entry.callback.take()?;

        Some(FiringTimer {
            id: entry.id,
            due: entry.due,
            repeating,
            callback,
            slot: key.slot,
        })
    }

    /// Return a fired timer. Repeating entries that were not cancelled while
    /// firing re-arm at `now + interval`; everything else becomes a tombstone.
    ///
    /// Returns the callback when it is no longer needed, so the caller can
    /// drop it outside any borrow of the registry.
    pub fn finish(&mut self, firing: FiringTimer, now: u64) -> Option<TimerCallback> {
        let seq = self.bump_seq();
        // The slot may have been cleared and reused while the callback ran
        let Some(entry) = self
            .slots
            .get_mut(firing.slot)
            .and_then(Option::as_mut)
            .filter(|entry| entry.id == firing.id && entry.state == EntryState::Firing)
        else {
            return Some(firing.callback);
        };

        match entry.interval {
            Some(interval) if !entry.cancelled => {
                entry.due = now.saturating_add(interval);
                entry.seq = seq;
                entry.state = EntryState::Armed;
                entry.callback = Some(firing.callback);
                self.queue.push(Reverse(DueKey {
                    due: entry.due,
                    seq,
                    slot: firing.slot,
                }));
                None
            }
            _ => {
                entry.state = EntryState::Dead;
                self.tombstones += 1;
                Some(firing.callback)
            }
        }
    }

    /// Reclaim tombstoned slots and drop stale heap keys.
    ///
    /// Only call between firing passes. Returns the number of slots freed.
    pub fn compact(&mut self) -> usize {
        if self.tombstones == 0 {
            return 0;
        }
        let mut freed = 0;
        for (slot, cell) in self.slots.iter_mut().enumerate() {
            if matches!(cell, Some(entry) if entry.state == EntryState::Dead) {
                *cell = None;
                self.free.push(slot);
                freed += 1;
            }
        }
        self.tombstones = 0;

        let slots = &self.slots;
        self.queue.retain(|Reverse(key)| {
            matches!(&slots[key.slot], Some(e) if e.seq == key.seq && e.state == EntryState::Armed)
        });
        freed
    }

    /// Number of entries that can still fire: armed entries plus a
    /// repeating entry whose callback is running
    pub fn len(&self) -> usize {
        self.armed
    }

    /// Check if no entry is armed
    pub fn is_empty(&self) -> bool {
        self.armed == 0
    }

    /// Number of tombstones awaiting compaction
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Whether `id` refers to an entry that can still fire
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.by_id
            .get(&id)
            .and_then(|slot| self.slots[*slot].as_ref())
            .is_some_and(|entry| !entry.cancelled && entry.state != EntryState::Dead)
    }

    /// Drop every entry. Returns the callbacks for the caller to drop.
    pub fn clear(&mut self) -> Vec<TimerCallback> {
        let callbacks = self
            .slots
            .drain(..)
            .flatten()
            .filter_map(|entry| entry.callback)
            .collect();
        self.free.clear();
        self.by_id.clear();
        self.queue.clear();
        self.armed = 0;
        self.tombstones = 0;
        callbacks
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn is_live(&self, key: &DueKey) -> bool {
        matches!(
            self.slots.get(key.slot),
            Some(Some(entry)) if entry.seq == key.seq && entry.state == EntryState::Armed
        )
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("armed", &self.armed)
            .field("tombstones", &self.tombstones)
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Value;

    fn noop() -> TimerCallback {
        Box::new(|_| Ok(Value::Undefined))
    }

    /// Fire everything due at `now`, returning ids in firing order
    fn fire_all(reg: &mut TimerRegistry, now: u64) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(firing) = reg.take_due(now) {
            fired.push(firing.id);
            reg.finish(firing, now);
        }
        fired
    }

    #[test]
    fn test_schedule_assigns_increasing_ids() {
        let mut reg = TimerRegistry::new();
        let a = reg.schedule(0, 10, noop(), false);
        let b = reg.schedule(0, 10, noop(), false);
        assert_eq!(a, TimerId(1));
        assert_eq!(b, TimerId(2));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_orders_by_due_then_registration() {
        let mut reg = TimerRegistry::new();
        let late = reg.schedule(0, 50, noop(), false);
        let first = reg.schedule(0, 10, noop(), false);
        let second = reg.schedule(0, 10, noop(), false);

        assert_eq!(reg.next_due(), Some(10));
        assert_eq!(fire_all(&mut reg, 100), vec![first, second, late]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let mut reg = TimerRegistry::new();
        reg.schedule(0, 100, noop(), false);
        assert!(reg.take_due(99).is_none());
        assert!(reg.take_due(100).is_some());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut reg = TimerRegistry::new();
        let id = reg.schedule(0, 10, noop(), false);
        assert!(reg.cancel(id));
        assert!(!reg.cancel(id));
        assert!(!reg.cancel(TimerId(999)));
        assert!(fire_all(&mut reg, 100).is_empty());
        assert_eq!(reg.next_due(), None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut reg = TimerRegistry::new();
        let id = reg.schedule(0, 0, noop(), false);
        assert_eq!(fire_all(&mut reg, 0), vec![id]);
        assert!(!reg.cancel(id));
    }

    #[test]
    fn test_repeating_rearms_from_completion_time() {
        let mut reg = TimerRegistry::new();
        let id = reg.schedule(0, 100, noop(), true);

        let firing = reg.take_due(100).unwrap();
        assert!(firing.repeating);
        // Callback finished late; next due is computed from "now", not 200
        assert!(reg.finish(firing, 130).is_none());
        assert_eq!(reg.next_due(), Some(230));
        assert!(reg.is_pending(id));
    }

    #[test]
    fn test_cancel_repeating_while_firing() {
        let mut reg = TimerRegistry::new();
        let id = reg.schedule(0, 10, noop(), true);
        let firing = reg.take_due(10).unwrap();
        assert!(reg.cancel(id));
        assert!(reg.finish(firing, 10).is_some());
        assert!(reg.is_empty());
        assert_eq!(reg.next_due(), None);
    }

    #[test]
    fn test_schedule_while_firing_is_not_skipped() {
        let mut reg = TimerRegistry::new();
        let outer = reg.schedule(0, 10, noop(), false);
        let sentinel = reg.schedule(0, 100, noop(), false);

        let firing = reg.take_due(10).unwrap();
        assert_eq!(firing.id, outer);
        // Registered mid-fire at the same instant
        let inner = reg.schedule(10, 0, noop(), false);
        reg.finish(firing, 10);

        assert_eq!(fire_all(&mut reg, 10), vec![inner]);
        assert_eq!(fire_all(&mut reg, 100), vec![sentinel]);
    }

    #[test]
    fn test_compact_reuses_slots_without_resurrecting_keys() {
        let mut reg = TimerRegistry::new();
        let a = reg.schedule(0, 10, noop(), false);
        reg.cancel(a);
        assert_eq!(reg.tombstones(), 1);
        assert_eq!(reg.compact(), 1);
        assert_eq!(reg.tombstones(), 0);

        // Slot of `a` is reused; `a`'s old key must not fire the new entry early
        let b = reg.schedule(0, 50, noop(), false);
        assert!(reg.take_due(10).is_none());
        assert_eq!(fire_all(&mut reg, 50), vec![b]);
    }

    #[test]
    fn test_repeating_counts_as_pending_while_firing() {
        let mut reg = TimerRegistry::new();
        let id = reg.schedule(0, 10, noop(), true);
        let firing = reg.take_due(10).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(reg.is_pending(id));
        reg.finish(firing, 10);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_finish_after_clear_leaves_reused_slot_alone() {
        let mut reg = TimerRegistry::new();
        reg.schedule(0, 5, noop(), false);
        let firing = reg.take_due(5).unwrap();

        // Cleared mid-fire; the new entry takes over slot 0
        reg.clear();
        let fresh = reg.schedule(5, 10, noop(), false);
        assert!(reg.finish(firing, 5).is_some());

        assert_eq!(reg.len(), 1);
        assert!(reg.is_pending(fresh));
        assert_eq!(fire_all(&mut reg, 15), vec![fresh]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_finish_after_clear_does_not_rearm_fired_interval() {
        let mut reg = TimerRegistry::new();
        reg.schedule(0, 5, noop(), true);
        let firing = reg.take_due(5).unwrap();

        reg.clear();
        let fresh = reg.schedule(5, 20, noop(), true);
        assert!(reg.finish(firing, 5).is_some());

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.next_due(), Some(25));
        let next = reg.take_due(25).unwrap();
        assert_eq!(next.id, fresh);
    }

    #[test]
    fn test_clear() {
        let mut reg = TimerRegistry::new();
        reg.schedule(0, 10, noop(), false);
        reg.schedule(0, 10, noop(), true);
        assert_eq!(reg.clear().len(), 2);
        assert!(reg.is_empty());
        assert_eq!(reg.next_due(), None);
    }
}

//! Garbage collector safe points
//!
//! The collector itself lives outside the scheduler. Between ticks, once the
//! microtask queue is empty and no callback is on the stack, the run loop
//! offers the host a safe point: a summary of the scheduler's state and the
//! values it keeps alive (suspended task receivers, awaited deferreds,
//! rejections still being tracked).

use crate::runtime::Value;
use serde::Serialize;

/// A trait for objects that can be garbage collected
pub trait Traceable {
    /// Trace all references from this object
    fn trace(&self, tracer: &mut dyn FnMut(&Value));
}

/// Scheduler state at a safe point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafePoint {
    /// Run-loop tick the safe point belongs to
    pub tick: u64,
    /// Clock reading in milliseconds
    pub now: u64,
    /// Armed timers
    pub pending_timers: usize,
    /// Task contexts waiting on a deferred
    pub suspended_tasks: usize,
}

/// Host collector consulted at safe points
pub trait GcHook {
    /// Whether a collection should run now. Roots are only gathered when
    /// this returns true.
    fn needs_collection(&self, _point: &SafePoint) -> bool {
        true
    }

    /// Run a collection treating `roots` as live
    fn collect(&mut self, point: &SafePoint, roots: &[Value]);
}

/// Gather every value `items` keep alive
pub fn collect_roots<'a, T, I>(items: I) -> Vec<Value>
where
    T: Traceable + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut roots = Vec::new();
    for item in items {
        item.trace(&mut |value| roots.push(value.clone()));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Scheduler;
    use crate::runtime::{Deferred, TaskCx};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Pair(Value, Value);

    impl Traceable for Pair {
        fn trace(&self, tracer: &mut dyn FnMut(&Value)) {
            tracer(&self.0);
            tracer(&self.1);
        }
    }

    #[test]
    fn test_collect_roots() {
        let items = vec![Pair(Value::from(1), Value::from(2)), Pair(Value::Null, Value::from("x"))];
        let roots = collect_roots(&items);
        assert_eq!(roots.len(), 4);
        assert_eq!(roots[3], Value::from("x"));
    }

    /// Records every safe point and the receivers it was handed
    struct RecordingHook {
        points: Rc<RefCell<Vec<(SafePoint, usize)>>>,
    }

    impl GcHook for RecordingHook {
        fn collect(&mut self, point: &SafePoint, roots: &[Value]) {
            self.points.borrow_mut().push((*point, roots.len()));
        }
    }

    #[test]
    fn test_safe_point_sees_suspended_task() {
        let sched = Scheduler::new();
        let points = Rc::new(RefCell::new(Vec::new()));
        sched.set_gc_hook(RecordingHook {
            points: points.clone(),
        });

        let gate = Deferred::pending();
        let waiting = gate.clone();
        let receiver = Value::new_object();
        sched.spawn("waiter", receiver, move |cx: TaskCx| async move {
            cx.suspend_on(waiting).await
        });
        let release = gate.clone();
        sched.set_timeout(10, move |sched| {
            release.resolve(sched, Value::from(1));
            Ok(Value::Undefined)
        });
        sched.run().unwrap();

        let points = points.borrow();
        assert!(!points.is_empty());
        // First safe point: one suspended task with its receiver and target as roots
        assert_eq!(points[0].0.suspended_tasks, 1);
        assert_eq!(points[0].0.pending_timers, 1);
        assert!(points[0].1 >= 2);
        // Last safe point: the task has finished
        assert_eq!(points.last().map(|p| p.0.suspended_tasks), Some(0));
    }

    struct NeverHook;

    impl GcHook for NeverHook {
        fn needs_collection(&self, _point: &SafePoint) -> bool {
            false
        }

        fn collect(&mut self, _point: &SafePoint, _roots: &[Value]) {
            panic!("collect must not run");
        }
    }

    #[test]
    fn test_hook_can_decline() {
        let sched = Scheduler::new();
        sched.set_gc_hook(NeverHook);
        sched.set_timeout(5, |_| Ok(Value::Undefined));
        sched.run().unwrap();
        assert_eq!(sched.stats().gc_collections, 0);
    }
}

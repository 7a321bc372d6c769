//! Execution-order guarantees of the run loop

mod common;

use cadence::runtime::Deferred;
use cadence::scenarios::Log;
use cadence::Value;
use common::{record, record_value, scheduler};
use pretty_assertions::assert_eq;

#[test]
fn test_sync_code_runs_before_any_microtask() {
    let sched = scheduler();
    let log = Log::new();

    sched.enqueue_microtask(record(&log, "micro"));
    Deferred::resolved(&sched, Value::from(1)).then(&sched, record_value(&log, "reaction"));
    log.push("sync");

    assert_eq!(log.lines(), vec!["sync"]);
    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["sync", "micro", "reaction: 1"]);
}

#[test]
fn test_microtasks_enqueued_during_drain_run_before_timers() {
    let sched = scheduler();
    let log = Log::new();

    sched.set_timeout(0, record(&log, "timer"));
    let l = log.clone();
    sched.enqueue_microtask(move |sched| {
        l.push("outer");
        let l = l.clone();
        sched.enqueue_microtask(move |sched| {
            l.push("inner");
            sched.enqueue_microtask(record(&l, "innermost"));
            Ok(Value::Undefined)
        });
        Ok(Value::Undefined)
    });

    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["outer", "inner", "innermost", "timer"]);
}

#[test]
fn test_microtasks_from_a_timer_run_before_the_next_timer() {
    let sched = scheduler();
    let log = Log::new();

    let l = log.clone();
    sched.set_timeout(5, move |sched| {
        l.push("timer a");
        sched.enqueue_microtask(record(&l, "micro from a"));
        Ok(Value::Undefined)
    });
    sched.set_timeout(5, record(&log, "timer b"));

    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["timer a", "micro from a", "timer b"]);
}

#[test]
fn test_equal_due_times_fire_in_registration_order() {
    let sched = scheduler();
    let log = Log::new();
    for line in ["first", "second", "third", "fourth"] {
        sched.set_timeout(10, record(&log, line));
    }
    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["first", "second", "third", "fourth"]);
}

#[test]
fn test_earlier_due_time_wins_over_registration() {
    let sched = scheduler();
    let log = Log::new();
    sched.set_timeout(30, record(&log, "30"));
    sched.set_timeout(10, record(&log, "10"));
    sched.set_timeout(20, record(&log, "20"));
    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["10", "20", "30"]);
}

#[test]
fn test_nested_zero_timers_fire_before_later_sentinel() {
    let sched = scheduler();
    let log = Log::new();

    let l = log.clone();
    sched.set_timeout(0, move |sched| {
        l.push("outer");
        let l = l.clone();
        sched.set_timeout(0, move |sched| {
            l.push("nested 1");
            sched.set_timeout(0, record(&l, "nested 2"));
            Ok(Value::Undefined)
        });
        Ok(Value::Undefined)
    });
    sched.set_timeout(1, record(&log, "sentinel"));

    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["outer", "nested 1", "nested 2", "sentinel"]);
}

#[test]
fn test_zero_delay_timer_waits_for_next_tick() {
    let sched = scheduler();
    let log = Log::new();

    let l = log.clone();
    sched.set_timeout(0, move |sched| {
        l.push("a");
        // Registered while firing: never runs in the same step
        sched.set_timeout(0, record(&l, "c"));
        Ok(Value::Undefined)
    });
    sched.set_timeout(0, record(&log, "b"));

    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["a", "b", "c"]);
}

#[test]
fn test_reactions_interleave_fifo_with_microtasks() {
    let sched = scheduler();
    let log = Log::new();

    let a = Deferred::resolved(&sched, Value::from("a"));
    let b = Deferred::resolved(&sched, Value::from("b"));
    a.then(&sched, record_value(&log, "a1"))
        .then(&sched, record_value(&log, "a2"));
    b.then(&sched, record_value(&log, "b1"))
        .then(&sched, record_value(&log, "b2"));

    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["a1: a", "b1: b", "a2: a", "b2: b"]);
}

#[test]
fn test_immediate_runs_after_microtasks() {
    let sched = scheduler();
    let log = Log::new();
    sched.set_immediate(record(&log, "immediate"));
    sched.enqueue_microtask(record(&log, "micro"));
    sched.run().unwrap();
    assert_eq!(log.lines(), vec!["micro", "immediate"]);
}

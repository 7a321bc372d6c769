//! Built-in conformance scenarios
//!
//! Each scenario wires a small program against a fresh [`Scheduler`] the
//! way a script would (synchronous setup first, then `run()`), records what
//! it observes into a [`Log`], and compares the log with the expected
//! ordering. The `cadence` binary lists and runs them; the integration
//! tests run them under both clocks.

use crate::error::Result;
use crate::event_loop::{RunReport, Scheduler, SchedulerConfig, SchedulerStats, TimerId};
use crate::runtime::{Bounce, Deferred, Function, Value};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Shared, ordered record of observations
#[derive(Debug, Clone, Default)]
pub struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line
    pub fn push(&self, line: impl Into<String>) {
        self.0.borrow_mut().push(line.into());
    }

    /// Snapshot of every line so far
    pub fn lines(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// A named program with its expected observation order
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    setup: fn(&Scheduler, &Log),
    pub expected: &'static [&'static str],
    /// Faults the run is expected to report
    pub expected_faults: usize,
    /// Upper bound on the clock reading when the run finishes
    pub deadline_ms: Option<u64>,
}

/// Result of running one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub log: Vec<String>,
    pub expected: Vec<String>,
    pub faults: Vec<String>,
    pub report: RunReport,
    pub stats: SchedulerStats,
}

/// Every built-in scenario
pub fn all() -> &'static [Scenario] {
    SCENARIOS
}

/// Look up a scenario by name
pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|scenario| scenario.name == name)
}

/// Run `scenario` on a fresh scheduler built from `config`
pub fn run_scenario(scenario: &Scenario, config: &SchedulerConfig) -> Result<ScenarioOutcome> {
    let sched = Scheduler::with_config(config.clone());
    let log = Log::new();

    (scenario.setup)(&sched, &log);
    let report = sched.run()?;
    let faults: Vec<String> = sched.take_faults().iter().map(ToString::to_string).collect();
    // Release anything still parked so reference cycles through the
    // scheduler are broken
    sched.shutdown();

    let log = log.lines();
    let in_time = scenario
        .deadline_ms
        .map_or(true, |deadline| report.final_time <= deadline);
    let passed = in_time
        && faults.len() == scenario.expected_faults
        && log.iter().map(String::as_str).eq(scenario.expected.iter().copied());

    Ok(ScenarioOutcome {
        name: scenario.name.to_string(),
        passed,
        log,
        expected: scenario.expected.iter().map(|line| line.to_string()).collect(),
        faults,
        report,
        stats: sched.stats(),
    })
}

/// A deferred fulfilled with `value` after `ms`
pub fn sleep(sched: &Scheduler, ms: u64, value: Value) -> Deferred {
    let deferred = Deferred::pending();
    let target = deferred.clone();
    sched.set_timeout(ms, move |sched| {
        target.resolve(sched, value);
        Ok(Value::Undefined)
    });
    deferred
}

/// A deferred rejected with `reason` after `ms`
pub fn fail_after(sched: &Scheduler, ms: u64, reason: Value) -> Deferred {
    let deferred = Deferred::pending();
    let target = deferred.clone();
    sched.set_timeout(ms, move |sched| {
        target.reject(sched, reason);
        Ok(Value::Undefined)
    });
    deferred
}

/// Attach a `then` that appends `prefix: value` to the log
fn log_result(sched: &Scheduler, deferred: &Value, log: &Log, prefix: &'static str) {
    if let Some(deferred) = deferred.as_deferred() {
        let log = log.clone();
        deferred.then(sched, move |_, value| {
            log.push(format!("{}: {}", prefix, value));
            Ok(Value::Undefined)
        });
    }
}

static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "timer_mutation",
        description: "timers scheduled from inside a firing timer run in order, before a later sentinel",
        setup: timer_mutation,
        expected: &["timer1", "timer2", "timer3", "done"],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "simple_timer_await",
        description: "a task suspends on a timer-resolved deferred and resumes after synchronous code",
        setup: simple_timer_await,
        expected: &[
            "A: Calling test()",
            "1: Before await",
            "B: test() returned",
            "D: Script end",
            "2: Timer fired",
            "3: After await, x = VALUE",
            "4: About to return",
            "C: Promise resolved: FINAL_VALUE",
        ],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "concurrent_timing",
        description: "two tasks waiting 100ms and 50ms both finish by about 100ms",
        setup: concurrent_timing,
        expected: &[
            "START",
            "func1: starting 100ms wait",
            "func2: starting 50ms wait",
            "END",
            "func2: timer fired",
            "func2: resumed",
            "func2 complete: func2_done",
            "func1: timer fired",
            "func1: resumed",
            "func1 complete: func1_done",
        ],
        expected_faults: 0,
        deadline_ms: Some(150),
    },
    Scenario {
        name: "two_awaits",
        description: "tasks awaiting the outcome of other suspension-capable calls",
        setup: two_awaits,
        expected: &[
            "func1: Before await",
            "func1: Creating 100ms delay",
            "func2: Before await",
            "func2: Creating 50ms delay",
            "=== Both functions called ===",
            "func2: Timer fired after 50ms",
            "func2: After await, result: func2_RESULT",
            "func2 final: func2_RESULT",
            "func1: Timer fired after 100ms",
            "func1: After await, result: func1_RESULT",
            "func1 final: func1_RESULT",
        ],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "timers_basic",
        description: "timeouts, microtasks, an interval cleared from its own callback, a cleared timeout",
        setup: timers_basic,
        expected: &[
            "Starting timer tests...",
            "Synchronous code finished",
            "Timeout cleared before execution",
            "Microtask 1 executed",
            "Microtask 2 executed",
            "Interval execution #1",
            "Interval execution #2",
            "setTimeout executed after 500ms",
            "Interval execution #3",
            "Interval cleared after 3 executions",
            "setTimeout executed after 1000ms",
        ],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "microtask_before_timer",
        description: "reactions and queued microtasks all run before a 0ms timer",
        setup: microtask_before_timer,
        expected: &["sync", "then1", "micro", "then2", "timeout"],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "async_this",
        description: "method tasks keep their receiver across interleaved resumptions",
        setup: async_this,
        expected: &[
            "a before: 1",
            "b before: 2",
            "b after: 2",
            "b bound: 2",
            "a after: 1",
            "a bound: 1",
        ],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "throwing_timer",
        description: "a throwing timer is reported and later timers still fire",
        setup: throwing_timer,
        expected: &["first timer", "second timer"],
        expected_faults: 1,
        deadline_ms: None,
    },
    Scenario {
        name: "combinators",
        description: "race picks the fastest input, all keeps input order and rejects early",
        setup: combinators,
        expected: &["race: fast", "all rejected: nope", "all: a,b,c"],
        expected_faults: 0,
        deadline_ms: None,
    },
    Scenario {
        name: "unhandled_rejection",
        description: "a rejection without a reaction is reported once the drain ends",
        setup: unhandled_rejection,
        expected: &["sync", "handled: caught"],
        expected_faults: 1,
        deadline_ms: None,
    },
    Scenario {
        name: "tail_calls",
        description: "curried and mutually recursive tail calls run in constant stack",
        setup: tail_calls,
        expected: &["curried step: 100000", "even(100001): false"],
        expected_faults: 0,
        deadline_ms: None,
    },
];

fn timer_mutation(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    sched.set_timeout(10, move |sched| {
        l.push("timer1");
        let l = l.clone();
        sched.set_timeout(0, move |sched| {
            l.push("timer2");
            let l = l.clone();
            sched.set_timeout(0, move |_| {
                l.push("timer3");
                Ok(Value::Undefined)
            });
            Ok(Value::Undefined)
        });
        Ok(Value::Undefined)
    });

    let l = log.clone();
    sched.set_timeout(100, move |_| {
        l.push("done");
        Ok(Value::Undefined)
    });
}

fn simple_timer_await(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    let test = Function::new_async("test", move |cx, _args| {
        let log = l.clone();
        async move {
            log.push("1: Before await");
            let pending = {
                let sched = cx.scheduler()?;
                let log = log.clone();
                Deferred::with_executor(&sched, move |sched, resolve, _reject| {
                    sched.set_timeout(50, move |sched| {
                        log.push("2: Timer fired");
                        resolve.call(sched, &Value::Undefined, &[Value::from("VALUE")])
                    });
                    Ok(Value::Undefined)
                })
            };
            let x = cx.suspend_on(pending).await?;
            log.push(format!("3: After await, x = {}", x));
            log.push("4: About to return");
            Ok(Value::from(format!("FINAL_{}", x)))
        }
    });

    log.push("A: Calling test()");
    let p = test.call(sched, &Value::Undefined, &[]);
    log.push("B: test() returned");
    if let Ok(p) = p {
        log_result(sched, &p, log, "C: Promise resolved");
    }
    log.push("D: Script end");
}

fn concurrent_timing(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    let delay = Function::new_async("delay", move |cx, args| {
        let log = l.clone();
        async move {
            let ms = args.first().map(|v| v.to_number() as u64).unwrap_or(0);
            let name = args.get(1).cloned().unwrap_or(Value::Undefined);
            log.push(format!("{}: starting {}ms wait", name, ms));
            let fired = {
                let sched = cx.scheduler()?;
                let (log, name) = (log.clone(), name.clone());
                let timer = sleep(&sched, ms, Value::Undefined);
                timer.then(&sched, move |_, _| {
                    log.push(format!("{}: timer fired", name));
                    Ok(Value::Undefined)
                })
            };
            cx.suspend_on(fired).await?;
            log.push(format!("{}: resumed", name));
            Ok(Value::from(format!("{}_done", name)))
        }
    });

    log.push("START");
    for (ms, name) in [(100, "func1"), (50, "func2")] {
        let args = [Value::from(ms), Value::from(name)];
        if let Ok(p) = delay.call(sched, &Value::Undefined, &args) {
            let prefix = if name == "func1" { "func1 complete" } else { "func2 complete" };
            log_result(sched, &p, log, prefix);
        }
    }
    log.push("END");
}

fn two_awaits(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    let delay = Function::new_async("delay", move |cx, args| {
        let log = l.clone();
        async move {
            let ms = args.first().map(|v| v.to_number() as u64).unwrap_or(0);
            let name = args.get(1).cloned().unwrap_or(Value::Undefined);
            log.push(format!("{}: Creating {}ms delay", name, ms));
            let sched = cx.scheduler()?;
            let promise = Deferred::with_executor(&sched, move |sched, resolve, _| {
                sched.set_timeout(ms, move |sched| {
                    log.push(format!("{}: Timer fired after {}ms", name, ms));
                    let result = Value::from(format!("{}_RESULT", name));
                    resolve.call(sched, &Value::Undefined, &[result])
                });
                Ok(Value::Undefined)
            });
            // Returning a deferred from a task adopts it
            Ok(Value::from(promise))
        }
    });

    for (name, ms) in [("func1", 100), ("func2", 50)] {
        let (l, delay) = (log.clone(), delay.clone());
        let func = Function::new_async(name, move |cx, _| {
            let (log, delay) = (l.clone(), delay.clone());
            async move {
                log.push(format!("{}: Before await", name));
                let pending = {
                    let sched = cx.scheduler()?;
                    delay.call(&sched, &Value::Undefined, &[Value::from(ms), Value::from(name)])?
                };
                let result = cx.suspend_on(pending).await?;
                log.push(format!("{}: After await, result: {}", name, result));
                Ok(result)
            }
        });
        if let Ok(p) = func.call(sched, &Value::Undefined, &[]) {
            let prefix = if name == "func1" { "func1 final" } else { "func2 final" };
            log_result(sched, &p, log, prefix);
        }
    }
    log.push("=== Both functions called ===");
}

fn timers_basic(sched: &Scheduler, log: &Log) {
    log.push("Starting timer tests...");

    let l = log.clone();
    sched.set_timeout(1000, move |_| {
        l.push("setTimeout executed after 1000ms");
        Ok(Value::Undefined)
    });
    let l = log.clone();
    sched.set_timeout(500, move |_| {
        l.push("setTimeout executed after 500ms");
        Ok(Value::Undefined)
    });

    for n in 1..=2 {
        let l = log.clone();
        sched.enqueue_microtask(move |_| {
            l.push(format!("Microtask {} executed", n));
            Ok(Value::Undefined)
        });
    }
    log.push("Synchronous code finished");

    let count = Rc::new(Cell::new(0));
    let interval_id: Rc<Cell<Option<TimerId>>> = Rc::new(Cell::new(None));
    let (l, own_id) = (log.clone(), interval_id.clone());
    let id = sched.set_interval(200, move |sched| {
        count.set(count.get() + 1);
        l.push(format!("Interval execution #{}", count.get()));
        if count.get() >= 3 {
            if let Some(id) = own_id.get() {
                sched.cancel_timer(id);
            }
            l.push("Interval cleared after 3 executions");
        }
        Ok(Value::Undefined)
    });
    interval_id.set(Some(id));

    let l = log.clone();
    let timeout = sched.set_timeout(300, move |_| {
        l.push("This should NOT be printed");
        Ok(Value::Undefined)
    });
    sched.cancel_timer(timeout);
    log.push("Timeout cleared before execution");
}

fn microtask_before_timer(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    sched.set_timeout(0, move |_| {
        l.push("timeout");
        Ok(Value::Undefined)
    });

    let (first, second) = (log.clone(), log.clone());
    Deferred::resolved(sched, Value::from(1))
        .then(sched, move |_, value| {
            first.push("then1");
            Ok(value)
        })
        .then(sched, move |_, value| {
            second.push("then2");
            Ok(value)
        });

    let l = log.clone();
    sched.enqueue_microtask(move |_| {
        l.push("micro");
        Ok(Value::Undefined)
    });
    log.push("sync");
}

fn async_this(sched: &Scheduler, log: &Log) {
    let proto = Value::new_object();
    proto.set_property(
        "unboundMethod",
        Value::from(Function::native("unboundMethod", |_, this, _| {
            Ok(this.get_property("_value").unwrap_or(Value::Undefined))
        })),
    );

    let l = log.clone();
    let report = Function::new_async("report", move |cx, args| {
        let log = l.clone();
        async move {
            let this = cx.receiver();
            let name = this.get_property("name").unwrap_or(Value::Undefined);
            let value = this.get_property("_value").unwrap_or(Value::Undefined);
            log.push(format!("{} before: {}", name, value));

            let ms = args.first().map(|v| v.to_number() as u64).unwrap_or(0);
            let wait = sleep(&cx.scheduler()?, ms, Value::Undefined);
            cx.suspend_on(wait).await?;

            let sched = cx.scheduler()?;
            let value = cx.receiver().call_method(&sched, "unboundMethod", &[])?;
            log.push(format!("{} after: {}", name, value));
            let bound = this.get_property("_boundMethod").unwrap_or(Value::Undefined);
            let value = bound.call(&sched, &Value::Undefined, &[])?;
            log.push(format!("{} bound: {}", name, value));
            Ok(Value::Undefined)
        }
    });
    proto.set_property("report", Value::from(report));

    for (name, value, ms) in [("a", 1, 30), ("b", 2, 10)] {
        let widget = Value::new_object_with_prototype(&proto);
        widget.set_property("name", Value::from(name));
        widget.set_property("_value", Value::from(value));
        if let Some(method) = proto.get_property("unboundMethod").and_then(|m| m.as_function()) {
            widget.set_property("_boundMethod", Value::from(method.bind(widget.clone())));
        }
        if let Err(thrown) = widget.call_method(sched, "report", &[Value::from(ms)]) {
            log.push(format!("{} threw: {}", name, thrown));
        }
    }
}

fn throwing_timer(sched: &Scheduler, log: &Log) {
    let l = log.clone();
    sched.set_timeout(10, move |_| {
        l.push("first timer");
        Err(Value::from("boom"))
    });
    let l = log.clone();
    sched.set_timeout(20, move |_| {
        l.push("second timer");
        Ok(Value::Undefined)
    });
}

fn combinators(sched: &Scheduler, log: &Log) {
    let race = Deferred::race(
        sched,
        vec![
            Value::from(sleep(sched, 15, Value::from("slow"))),
            Value::from(sleep(sched, 5, Value::from("fast"))),
        ],
    );
    log_result(sched, &Value::from(race), log, "race");

    let all = Deferred::all(
        sched,
        vec![
            Value::from(sleep(sched, 30, Value::from("a"))),
            Value::from(sleep(sched, 10, Value::from("b"))),
            Value::from(sleep(sched, 20, Value::from("c"))),
        ],
    );
    log_result(sched, &Value::from(all), log, "all");

    let failing = Deferred::all(
        sched,
        vec![
            Value::from(sleep(sched, 50, Value::from("late"))),
            Value::from(fail_after(sched, 25, Value::from("nope"))),
        ],
    );
    let l = log.clone();
    failing.catch(sched, move |_, reason| {
        l.push(format!("all rejected: {}", reason));
        Ok(Value::Undefined)
    });
}

fn unhandled_rejection(sched: &Scheduler, log: &Log) {
    Deferred::rejected(sched, Value::from("nobody listens"));

    let l = log.clone();
    Deferred::rejected(sched, Value::from("caught")).catch(sched, move |_, reason| {
        l.push(format!("handled: {}", reason));
        Ok(Value::Undefined)
    });
    log.push("sync");
}

fn tail_calls(sched: &Scheduler, log: &Log) {
    fn make_stepper(target: u64) -> impl FnOnce(u64) -> Bounce<u64> {
        move |n| {
            if n >= target {
                Bounce::done(n)
            } else {
                Bounce::call(move || make_stepper(target)(n + 1))
            }
        }
    }

    fn is_even(n: u64) -> Bounce<bool> {
        if n == 0 {
            Bounce::done(true)
        } else {
            Bounce::call(move || is_odd(n - 1))
        }
    }

    fn is_odd(n: u64) -> Bounce<bool> {
        if n == 0 {
            Bounce::done(false)
        } else {
            Bounce::call(move || is_even(n - 1))
        }
    }

    let l = log.clone();
    sched.set_immediate(move |_| {
        l.push(format!("curried step: {}", make_stepper(100_000)(0).run()));
        l.push(format!("even(100001): {}", is_even(100_001).run()));
        Ok(Value::Undefined)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|s| s.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_find() {
        assert!(find("timer_mutation").is_some());
        assert!(find("missing").is_none());
    }

    #[test]
    fn test_every_scenario_passes_on_virtual_clock() {
        let config = SchedulerConfig::default();
        for scenario in all() {
            let outcome = run_scenario(scenario, &config).unwrap();
            assert!(
                outcome.passed,
                "{} failed: log {:?}, faults {:?}",
                scenario.name, outcome.log, outcome.faults
            );
        }
    }

    #[test]
    fn test_log() {
        let log = Log::new();
        assert!(log.is_empty());
        log.clone().push("x");
        assert_eq!(log.lines(), vec!["x".to_string()]);
        assert_eq!(log.len(), 1);
    }
}

//! Deferred-computation objects
//!
//! A [`Deferred`] moves once from pending to fulfilled or rejected and stays
//! there. Reactions are never invoked synchronously: settling enqueues one
//! microtask per reaction in registration order, and subscribing to an
//! already-settled deferred enqueues immediately.
//!
//! Resolving with another deferred or a thenable adopts its eventual outcome,
//! always through the microtask queue even when the adopted value has already
//! settled.

use super::value::{Function, Value};
use crate::error::{Completion, ErrorKind};
use crate::event_loop::Scheduler;
use crate::gc::Traceable;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// ID counter for deferred tracking
static DEFERRED_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a deferred, used in logs and fault reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeferredId(pub u64);

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Deferred({})", self.0)
    }
}

/// Settlement state
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

/// Reaction run (through a microtask) with the settled outcome
type Reaction = Box<dyn FnOnce(&Scheduler, Completion)>;

/// Settlement handler for `then`/`catch`
pub type Handler = Box<dyn FnOnce(&Scheduler, Value) -> Completion>;

struct DeferredCell {
    id: DeferredId,
    state: RefCell<DeferredState>,
    reactions: RefCell<Vec<Reaction>>,
    /// A reaction was ever attached
    handled: Cell<bool>,
    /// resolve/reject was called; later calls are ignored
    already_resolved: Cell<bool>,
}

/// A deferred-computation object (promise)
#[derive(Clone)]
pub struct Deferred(Rc<DeferredCell>);

impl Deferred {
    /// Create a pending deferred
    pub fn pending() -> Self {
        let id = DeferredId(DEFERRED_ID.fetch_add(1, Ordering::Relaxed));
        Deferred(Rc::new(DeferredCell {
            id,
            state: RefCell::new(DeferredState::Pending),
            reactions: RefCell::new(Vec::new()),
            handled: Cell::new(false),
            already_resolved: Cell::new(false),
        }))
    }

    /// `Promise.resolve`: a deferred input is returned as is, anything else
    /// is wrapped (thenables are adopted).
    pub fn resolved(sched: &Scheduler, value: Value) -> Self {
        if let Some(existing) = value.as_deferred() {
            return existing;
        }
        let deferred = Deferred::pending();
        deferred.resolve(sched, value);
        deferred
    }

    /// `Promise.reject`
    pub fn rejected(sched: &Scheduler, reason: Value) -> Self {
        let deferred = Deferred::pending();
        deferred.reject(sched, reason);
        deferred
    }

    /// `new Promise(executor)`. The executor receives resolve and reject
    /// functions; if it throws, the deferred is rejected with the thrown
    /// value unless it was already resolved.
    pub fn with_executor<F>(sched: &Scheduler, executor: F) -> Self
    where
        F: FnOnce(&Scheduler, Function, Function) -> Completion,
    {
        let resolvers = Resolvers::new();
        let outcome = executor(sched, resolvers.resolve_function(), resolvers.reject_function());
        if let Err(reason) = outcome {
            resolvers.reject(sched, reason);
        }
        resolvers.promise()
    }

    /// `Promise.try`: run `callback` now. A throw yields a rejected deferred;
    /// a returned deferred is adopted.
    pub fn try_call<F>(sched: &Scheduler, callback: F) -> Self
    where
        F: FnOnce(&Scheduler) -> Completion,
    {
        let deferred = Deferred::pending();
        match callback(sched) {
            Ok(value) => deferred.resolve(sched, value),
            Err(reason) => deferred.reject(sched, reason),
        }
        deferred
    }

    /// Identity
    pub fn id(&self) -> DeferredId {
        self.0.id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DeferredState {
        self.0.state.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.0.state.borrow(), DeferredState::Pending)
    }

    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.0.state.borrow(), DeferredState::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.0.state.borrow(), DeferredState::Rejected(_))
    }

    /// Fulfillment value, once fulfilled
    pub fn value(&self) -> Option<Value> {
        match &*self.0.state.borrow() {
            DeferredState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Rejection reason, once rejected
    pub fn reason(&self) -> Option<Value> {
        match &*self.0.state.borrow() {
            DeferredState::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Settled outcome as a completion
    pub fn outcome(&self) -> Option<Completion> {
        match &*self.0.state.borrow() {
            DeferredState::Pending => None,
            DeferredState::Fulfilled(value) => Some(Ok(value.clone())),
            DeferredState::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Whether a reaction has ever been attached
    pub fn is_handled(&self) -> bool {
        self.0.handled.get()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Deferred) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Resolve with `value`, adopting deferreds and thenables. Only the
    /// first resolve/reject call has any effect.
    pub fn resolve(&self, sched: &Scheduler, value: Value) {
        if self.0.already_resolved.replace(true) {
            trace!(deferred = self.0.id.0, "resolve ignored, already resolved");
            return;
        }
        self.resolve_inner(sched, value);
    }

    /// Reject with `reason`. Only the first resolve/reject call has any effect.
    pub fn reject(&self, sched: &Scheduler, reason: Value) {
        if self.0.already_resolved.replace(true) {
            trace!(deferred = self.0.id.0, "reject ignored, already resolved");
            return;
        }
        self.settle(sched, Err(reason));
    }

    /// Resolve on `Ok`, reject on `Err`
    pub fn complete(&self, sched: &Scheduler, outcome: Completion) {
        match outcome {
            Ok(value) => self.resolve(sched, value),
            Err(reason) => self.reject(sched, reason),
        }
    }

    fn resolve_inner(&self, sched: &Scheduler, value: Value) {
        if let Some(source) = value.as_deferred() {
            if source.ptr_eq(self) {
                let cycle = Value::new_error(
                    ErrorKind::TypeError,
                    "Chaining cycle detected for promise",
                );
                self.settle(sched, Err(cycle));
                return;
            }
            let target = self.clone();
            sched.enqueue_job("adopt", move |sched| {
                source.subscribe(sched, move |sched, outcome| target.settle(sched, outcome));
            });
            return;
        }

        if let Some(then) = value.thenable_then() {
            let target = self.clone();
            sched.enqueue_job("thenable", move |sched| target.adopt_thenable(sched, value, then));
            return;
        }

        self.settle(sched, Ok(value));
    }

    /// Call `thenable.then(resolve, reject)` with one-shot capabilities
    fn adopt_thenable(&self, sched: &Scheduler, thenable: Value, then: Function) {
        let called = Rc::new(Cell::new(false));

        let (target, guard) = (self.clone(), called.clone());
        let resolve = Function::native("resolve", move |sched, _, args| {
            if !guard.replace(true) {
                target.resolve_inner(sched, args.first().cloned().unwrap_or(Value::Undefined));
            }
            Ok(Value::Undefined)
        });
        let (target, guard) = (self.clone(), called.clone());
        let reject = Function::native("reject", move |sched, _, args| {
            if !guard.replace(true) {
                target.settle(sched, Err(args.first().cloned().unwrap_or(Value::Undefined)));
            }
            Ok(Value::Undefined)
        });

        let outcome = then.call(sched, &thenable, &[Value::from(resolve), Value::from(reject)]);
        if let Err(reason) = outcome {
            if !called.replace(true) {
                self.settle(sched, Err(reason));
            }
        }
    }

    fn settle(&self, sched: &Scheduler, outcome: Completion) {
        if !self.is_pending() {
            return;
        }
        self.0.already_resolved.set(true);
        *self.0.state.borrow_mut() = match &outcome {
            Ok(value) => DeferredState::Fulfilled(value.clone()),
            Err(reason) => DeferredState::Rejected(reason.clone()),
        };
        let reactions = std::mem::take(&mut *self.0.reactions.borrow_mut());
        trace!(
            deferred = self.0.id.0,
            fulfilled = outcome.is_ok(),
            reactions = reactions.len(),
            "deferred settled"
        );
        sched.update_stats(|stats| stats.total_deferreds_settled += 1);

        if outcome.is_err() && !self.is_handled() {
            sched.track_rejection(self.clone());
        }
        for reaction in reactions {
            let outcome = outcome.clone();
            sched.enqueue_job("reaction", move |sched| reaction(sched, outcome));
        }
    }

    /// Attach a raw reaction. It runs in a microtask once this deferred
    /// settles, or in the next microtask slot if it already has.
    pub fn subscribe<F>(&self, sched: &Scheduler, reaction: F)
    where
        F: FnOnce(&Scheduler, Completion) + 'static,
    {
        self.0.handled.set(true);
        match self.outcome() {
            None => self.0.reactions.borrow_mut().push(Box::new(reaction)),
            Some(outcome) => sched.enqueue_job("reaction", move |sched| reaction(sched, outcome)),
        }
    }

    /// `then(onFulfilled, onRejected)`; an absent handler passes the
    /// settlement through to the returned deferred.
    pub fn then_with(
        &self,
        sched: &Scheduler,
        on_fulfilled: Option<Handler>,
        on_rejected: Option<Handler>,
    ) -> Deferred {
        let derived = Deferred::pending();
        let target = derived.clone();
        self.subscribe(sched, move |sched, outcome| {
            let result = match outcome {
                Ok(value) => match on_fulfilled {
                    Some(handler) => handler(sched, value),
                    None => Ok(value),
                },
                Err(reason) => match on_rejected {
                    Some(handler) => handler(sched, reason),
                    None => Err(reason),
                },
            };
            target.complete(sched, result);
        });
        derived
    }

    /// `then(onFulfilled)`
    pub fn then<F>(&self, sched: &Scheduler, on_fulfilled: F) -> Deferred
    where
        F: FnOnce(&Scheduler, Value) -> Completion + 'static,
    {
        self.then_with(sched, Some(Box::new(on_fulfilled)), None)
    }

    /// `then(onFulfilled, onRejected)`
    pub fn then_both<F, R>(&self, sched: &Scheduler, on_fulfilled: F, on_rejected: R) -> Deferred
    where
        F: FnOnce(&Scheduler, Value) -> Completion + 'static,
        R: FnOnce(&Scheduler, Value) -> Completion + 'static,
    {
        self.then_with(sched, Some(Box::new(on_fulfilled)), Some(Box::new(on_rejected)))
    }

    /// `catch(onRejected)`, same as `then(undefined, onRejected)`
    pub fn catch<R>(&self, sched: &Scheduler, on_rejected: R) -> Deferred
    where
        R: FnOnce(&Scheduler, Value) -> Completion + 'static,
    {
        self.then_with(sched, None, Some(Box::new(on_rejected)))
    }

    /// `finally(onSettled)`: forwards the original settlement unless
    /// `on_settled` throws or returns a deferred that rejects.
    pub fn finally<F>(&self, sched: &Scheduler, on_settled: F) -> Deferred
    where
        F: FnOnce(&Scheduler) -> Completion + 'static,
    {
        let derived = Deferred::pending();
        let target = derived.clone();
        self.subscribe(sched, move |sched, original| match on_settled(sched) {
            Err(reason) => target.reject(sched, reason),
            Ok(returned) => {
                Deferred::resolved(sched, returned).subscribe(sched, move |sched, waited| {
                    match waited {
                        Err(reason) => target.reject(sched, reason),
                        Ok(_) => target.complete(sched, original),
                    }
                });
            }
        });
        derived
    }

    /// Script-facing `then`: non-callable handlers count as absent, and
    /// handlers are called with an undefined receiver.
    pub fn then_values(&self, sched: &Scheduler, on_fulfilled: &Value, on_rejected: &Value) -> Deferred {
        fn handler(callback: &Value) -> Option<Handler> {
            let func = callback.as_function()?;
            Some(Box::new(move |sched: &Scheduler, arg: Value| {
                func.call(sched, &Value::Undefined, &[arg])
            }))
        }
        self.then_with(sched, handler(on_fulfilled), handler(on_rejected))
    }

    // ------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------

    /// `Promise.all`: results in input order, or the first rejection
    pub fn all(sched: &Scheduler, inputs: Vec<Value>) -> Deferred {
        let derived = Deferred::pending();
        if inputs.is_empty() {
            derived.resolve(sched, Value::new_array(Vec::new()));
            return derived;
        }

        let results = Rc::new(RefCell::new(vec![Value::Undefined; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        for (index, input) in inputs.into_iter().enumerate() {
            let (target, results, remaining) = (derived.clone(), results.clone(), remaining.clone());
            Deferred::resolved(sched, input).subscribe(sched, move |sched, outcome| match outcome {
                Ok(value) => {
                    results.borrow_mut()[index] = value;
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = std::mem::take(&mut *results.borrow_mut());
                        target.resolve(sched, Value::new_array(values));
                    }
                }
                Err(reason) => target.reject(sched, reason),
            });
        }
        derived
    }

    /// `Promise.allSettled`: one `{ status, value | reason }` record per input
    pub fn all_settled(sched: &Scheduler, inputs: Vec<Value>) -> Deferred {
        let derived = Deferred::pending();
        if inputs.is_empty() {
            derived.resolve(sched, Value::new_array(Vec::new()));
            return derived;
        }

        let results = Rc::new(RefCell::new(vec![Value::Undefined; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        for (index, input) in inputs.into_iter().enumerate() {
            let (target, results, remaining) = (derived.clone(), results.clone(), remaining.clone());
            Deferred::resolved(sched, input).subscribe(sched, move |sched, outcome| {
                let record = Value::new_object();
                match outcome {
                    Ok(value) => {
                        record.set_property("status", Value::from("fulfilled"));
                        record.set_property("value", value);
                    }
                    Err(reason) => {
                        record.set_property("status", Value::from("rejected"));
                        record.set_property("reason", reason);
                    }
                }
                results.borrow_mut()[index] = record;
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let records = std::mem::take(&mut *results.borrow_mut());
                    target.resolve(sched, Value::new_array(records));
                }
            });
        }
        derived
    }

    /// `Promise.race`: settles like whichever input settles first. An
    /// empty input list stays pending forever.
    pub fn race(sched: &Scheduler, inputs: Vec<Value>) -> Deferred {
        let derived = Deferred::pending();
        for input in inputs {
            let target = derived.clone();
            Deferred::resolved(sched, input)
                .subscribe(sched, move |sched, outcome| target.complete(sched, outcome));
        }
        derived
    }

    /// `Promise.any`: the first fulfillment, or an `AggregateError` holding
    /// every rejection reason in input order.
    pub fn any(sched: &Scheduler, inputs: Vec<Value>) -> Deferred {
        let derived = Deferred::pending();
        if inputs.is_empty() {
            derived.reject(sched, aggregate_error(Vec::new()));
            return derived;
        }

        let errors = Rc::new(RefCell::new(vec![Value::Undefined; inputs.len()]));
        let remaining = Rc::new(Cell::new(inputs.len()));
        for (index, input) in inputs.into_iter().enumerate() {
            let (target, errors, remaining) = (derived.clone(), errors.clone(), remaining.clone());
            Deferred::resolved(sched, input).subscribe(sched, move |sched, outcome| match outcome {
                Ok(value) => target.resolve(sched, value),
                Err(reason) => {
                    errors.borrow_mut()[index] = reason;
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let reasons = std::mem::take(&mut *errors.borrow_mut());
                        target.reject(sched, aggregate_error(reasons));
                    }
                }
            });
        }
        derived
    }
}

/// Create an AggregateError value (used by `any` when every input rejects)
pub fn aggregate_error(errors: Vec<Value>) -> Value {
    let error = Value::new_error(ErrorKind::AggregateError, "All promises were rejected");
    error.set_property("errors", Value::new_array(errors));
    error
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.state.borrow() {
            DeferredState::Pending => write!(f, "{} {{ <pending> }}", self.0.id),
            DeferredState::Fulfilled(value) => write!(f, "{} {{ {:?} }}", self.0.id, value),
            DeferredState::Rejected(reason) => {
                write!(f, "{} {{ <rejected> {:?} }}", self.0.id, reason)
            }
        }
    }
}

impl Traceable for Deferred {
    fn trace(&self, tracer: &mut dyn FnMut(&Value)) {
        match &*self.0.state.borrow() {
            DeferredState::Pending => {}
            DeferredState::Fulfilled(value) | DeferredState::Rejected(value) => tracer(value),
        }
    }
}

/// `Promise.withResolvers()`: a pending deferred plus its capabilities
#[derive(Debug, Clone)]
pub struct Resolvers {
    deferred: Deferred,
}

impl Resolvers {
    /// Create a fresh pending deferred with resolvers
    pub fn new() -> Self {
        Self {
            deferred: Deferred::pending(),
        }
    }

    /// The deferred being controlled
    pub fn promise(&self) -> Deferred {
        self.deferred.clone()
    }

    pub fn resolve(&self, sched: &Scheduler, value: Value) {
        self.deferred.resolve(sched, value);
    }

    pub fn reject(&self, sched: &Scheduler, reason: Value) {
        self.deferred.reject(sched, reason);
    }

    /// Script-callable `resolve(value)`
    pub fn resolve_function(&self) -> Function {
        let deferred = self.deferred.clone();
        Function::native("resolve", move |sched, _, args| {
            deferred.resolve(sched, args.first().cloned().unwrap_or(Value::Undefined));
            Ok(Value::Undefined)
        })
    }

    /// Script-callable `reject(reason)`
    pub fn reject_function(&self) -> Function {
        let deferred = self.deferred.clone();
        Function::native("reject", move |sched, _, args| {
            deferred.reject(sched, args.first().cloned().unwrap_or(Value::Undefined));
            Ok(Value::Undefined)
        })
    }
}

impl Default for Resolvers {
    fn default() -> Self {
        Self::new()
    }
}

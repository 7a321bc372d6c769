//! Suspendable task contexts
//!
//! Invoking a suspension-capable function creates a task context: a
//! heap-allocated continuation (a Rust future) plus the receiver it was
//! invoked with. The body runs synchronously up to its first suspension
//! point. Suspending parks the task in the scheduler's task table and
//! subscribes a resumption reaction on the awaited deferred; the reaction
//! runs through the microtask queue, so resumption never happens inline,
//! not even for values that are already settled.
//!
//! Futures are polled with a no-op waker. The only thing that can wake a
//! task is the settlement of the deferred it handed to the driver through
//! [`TaskCx::suspend_on`].

use super::promise::Deferred;
use super::value::Value;
use crate::error::{Completion, ErrorKind};
use crate::event_loop::Scheduler;
use crate::gc::Traceable;
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tracing::debug;

/// Task identity; also its creation sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// A task body: the saved continuation of a suspension-capable call
pub type TaskBody = Pin<Box<dyn Future<Output = Completion>>>;

/// State shared between a task's driver and the body's [`TaskCx`]
struct TaskShared {
    id: TaskId,
    name: String,
    receiver: Value,
    /// Value the body asked to wait on during the current poll
    target: RefCell<Option<Value>>,
    /// Outcome delivered by the resumption reaction
    resumed: RefCell<Option<Completion>>,
    /// Set only while the body is being polled
    sched: RefCell<Option<Scheduler>>,
}

/// Handle a task body uses to reach its receiver and suspend
#[derive(Clone)]
pub struct TaskCx {
    shared: Rc<TaskShared>,
}

impl TaskCx {
    /// Task identity
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Name of the function that created the task
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The receiver captured at invocation. Identical on every resumption.
    pub fn receiver(&self) -> Value {
        self.shared.receiver.clone()
    }

    /// The scheduler driving this task. Only available while the body runs.
    pub fn scheduler(&self) -> Result<Scheduler, Value> {
        self.shared.sched.borrow().clone().ok_or_else(|| {
            Value::new_error(ErrorKind::InternalError, "task context is not running")
        })
    }

    /// Suspension point: wait for `value` to settle. Non-deferred values are
    /// wrapped as already fulfilled. Yields `Err` with the reason on
    /// rejection.
    pub fn suspend_on(&self, value: impl Into<Value>) -> Suspend {
        Suspend {
            shared: self.shared.clone(),
            value: Some(value.into()),
            state: SuspendState::Unpolled,
        }
    }
}

impl fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCx")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspendState {
    Unpolled,
    Waiting,
    Done,
}

/// Future returned by [`TaskCx::suspend_on`]
pub struct Suspend {
    shared: Rc<TaskShared>,
    value: Option<Value>,
    state: SuspendState,
}

impl Future for Suspend {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Completion> {
        let this = self.get_mut();
        match this.state {
            SuspendState::Unpolled => {
                let mut target = this.shared.target.borrow_mut();
                if target.is_some() {
                    this.state = SuspendState::Done;
                    return Poll::Ready(Err(Value::new_error(
                        ErrorKind::TypeError,
                        "a task context may wait on only one deferred at a time",
                    )));
                }
                *target = Some(this.value.take().unwrap_or(Value::Undefined));
                this.state = SuspendState::Waiting;
                Poll::Pending
            }
            SuspendState::Waiting => match this.shared.resumed.borrow_mut().take() {
                Some(outcome) => {
                    this.state = SuspendState::Done;
                    Poll::Ready(outcome)
                }
                None => Poll::Pending,
            },
            SuspendState::Done => Poll::Ready(Err(Value::new_error(
                ErrorKind::InternalError,
                "suspension point polled after completion",
            ))),
        }
    }
}

/// A suspended task parked in the scheduler
pub struct TaskContext {
    shared: Rc<TaskShared>,
    body: Option<TaskBody>,
    /// Settled with the body's return or throw
    result: Deferred,
    awaiting: Option<Deferred>,
    stall_reported: bool,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn receiver(&self) -> &Value {
        &self.shared.receiver
    }

    /// Deferred the task is suspended on
    pub fn awaiting(&self) -> Option<&Deferred> {
        self.awaiting.as_ref()
    }

    /// Deferred for the call's outcome
    pub fn result(&self) -> &Deferred {
        &self.result
    }
}

impl Traceable for TaskContext {
    fn trace(&self, tracer: &mut dyn FnMut(&Value)) {
        tracer(&self.shared.receiver);
        if let Some(awaiting) = &self.awaiting {
            tracer(&Value::from(awaiting.clone()));
        }
        tracer(&Value::from(self.result.clone()));
    }
}

/// Suspended task contexts, keyed by id
#[derive(Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, TaskContext>,
    next_id: u64,
}

impl TaskTable {
    fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    fn insert(&mut self, task: TaskContext) {
        self.tasks.insert(task.id(), task);
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskContext> {
        self.tasks.remove(&id)
    }

    /// Look up a suspended task
    pub fn get(&self, id: TaskId) -> Option<&TaskContext> {
        self.tasks.get(&id)
    }

    /// Suspended task ids in creation order
    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.tasks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove every task, returning them for the caller to drop
    pub fn clear(&mut self) -> Vec<TaskContext> {
        self.tasks.drain().map(|(_, task)| task).collect()
    }

    /// Values kept alive by suspended tasks
    pub fn roots(&self) -> Vec<Value> {
        let mut tasks: Vec<_> = self.tasks.values().collect();
        tasks.sort_by_key(|task| task.id());
        crate::gc::collect_roots(tasks)
    }

    /// Tasks not yet reported as stalled, in creation order; marks them
    /// reported
    pub(crate) fn take_unreported_stalls(&mut self) -> Vec<(TaskId, String)> {
        let mut stalled: Vec<_> = self
            .tasks
            .values_mut()
            .filter(|task| !task.stall_reported)
            .map(|task| {
                task.stall_reported = true;
                (task.id(), task.name().to_string())
            })
            .collect();
        stalled.sort();
        stalled
    }
}

/// Start a task context. `body` receives the task's [`TaskCx`] and is
/// polled immediately, so it runs synchronously up to its first suspension
/// point. Returns the deferred for the call's outcome.
pub fn spawn_task<F, Fut>(sched: &Scheduler, name: &str, receiver: Value, body: F) -> Deferred
where
    F: FnOnce(TaskCx) -> Fut,
    Fut: Future<Output = Completion> + 'static,
{
    let id = sched.tasks().borrow_mut().allocate_id();
    let shared = Rc::new(TaskShared {
        id,
        name: name.to_string(),
        receiver,
        target: RefCell::new(None),
        resumed: RefCell::new(None),
        sched: RefCell::new(None),
    });
    let body: TaskBody = Box::pin(body(TaskCx {
        shared: shared.clone(),
    }));
    let result = Deferred::pending();

    sched.update_stats(|stats| stats.total_tasks_spawned += 1);
    debug!(task = id.0, name, "task started");

    step(
        sched,
        TaskContext {
            shared,
            body: Some(body),
            result: result.clone(),
            awaiting: None,
            stall_reported: false,
        },
    );
    result
}

/// Poll a task's body once and park, finish or fail it
fn step(sched: &Scheduler, mut task: TaskContext) {
    let Some(mut body) = task.body.take() else {
        return;
    };

    *task.shared.sched.borrow_mut() = Some(sched.clone());
    let poll = body.as_mut().poll(&mut Context::from_waker(Waker::noop()));
    task.shared.sched.borrow_mut().take();

    match poll {
        Poll::Ready(outcome) => {
            debug!(task = task.id().0, ok = outcome.is_ok(), "task finished");
            sched.update_stats(|stats| stats.total_tasks_completed += 1);
            task.result.complete(sched, outcome);
        }
        Poll::Pending => {
            let target = task.shared.target.borrow_mut().take();
            let Some(target) = target else {
                drop(body);
                task.result.reject(
                    sched,
                    Value::new_error(
                        ErrorKind::TypeError,
                        "task suspended without waiting on a deferred",
                    ),
                );
                return;
            };

            let awaited = Deferred::resolved(sched, target);
            let id = task.id();
            debug!(task = id.0, awaiting = %awaited.id(), "task suspended");
            task.body = Some(body);
            task.awaiting = Some(awaited.clone());
            sched.tasks().borrow_mut().insert(task);
            awaited.subscribe(sched, move |sched, outcome| resume(sched, id, outcome));
        }
    }
}

/// Resumption reaction: deliver the awaited outcome and continue the body
fn resume(sched: &Scheduler, id: TaskId, outcome: Completion) {
    let task = sched.tasks().borrow_mut().remove(id);
    // Gone after a shutdown
    let Some(mut task) = task else {
        return;
    };
    debug!(task = id.0, ok = outcome.is_ok(), "task resumed");
    task.awaiting = None;
    *task.shared.resumed.borrow_mut() = Some(outcome);
    step(sched, task);
}

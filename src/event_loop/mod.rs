//! Event Loop Implementation
//!
//! The [`Scheduler`] owns the microtask queue, the timer registry, the table
//! of suspended task contexts and any native event sources, and drives them
//! in a fixed order:
//!
//! 1. poll native event sources
//! 2. drain the microtask queue to quiescence, including entries enqueued
//!    during the drain
//! 3. report rejections that are still unhandled, then offer a GC safe point
//! 4. fire the single next-due timer (waiting on the clock if needed), go to 1
//!
//! The loop ends once no microtask, timer or active source remains.
//!
//! `Scheduler` is a cheap handle; clones share the same queues. Callbacks
//! receive `&Scheduler` and may schedule, cancel, enqueue or settle freely:
//! no internal borrow is held while user code runs.

pub mod clock;
pub mod microtask;
pub mod source;
pub mod timer;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use microtask::{Microtask, MicrotaskFn, MicrotaskQueue};
pub use source::{EventSource, SourceStatus};
pub use timer::{FiringTimer, TimerCallback, TimerId, TimerRegistry};

use crate::error::{CallbackSource, Completion, Error, Fault, FaultReporter, Result};
use crate::gc::{GcHook, SafePoint};
use crate::runtime::async_runtime::{self, TaskCx, TaskTable};
use crate::runtime::promise::{Deferred, Resolvers};
use crate::runtime::Value;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Which clock a scheduler built from configuration uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    /// Deterministic; waiting jumps straight to the deadline
    #[default]
    Virtual,
    /// Monotonic wall clock; waiting sleeps
    System,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Clock used for "now" and for waiting on timers
    pub clock: ClockKind,
    /// Maximum microtasks run in a single drain (opt-in livelock guard;
    /// unlimited by default)
    pub microtask_budget: Option<usize>,
    /// Maximum run-loop iterations per `run()` call
    pub max_ticks: Option<u64>,
    /// Report rejected deferreds that have no reaction after a drain
    pub report_unhandled_rejections: bool,
    /// How long to idle between polls while only event sources are active
    pub source_poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            clock: ClockKind::Virtual,
            microtask_budget: None,
            max_ticks: None,
            report_unhandled_rejections: true,
            source_poll_interval_ms: 1,
        }
    }
}

impl SchedulerConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Runtime statistics for the scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Total microtasks processed across all ticks
    pub total_microtasks: u64,
    /// Total timer callbacks fired
    pub total_timers_fired: u64,
    /// Total number of run-loop ticks
    pub total_ticks: u64,
    /// Maximum microtasks drained in a single pass
    pub max_microtasks_per_drain: u64,
    /// Longest tick duration in milliseconds (wall-clock)
    pub longest_tick_ms: u64,
    /// Total deferreds settled (fulfilled or rejected)
    pub total_deferreds_settled: u64,
    /// Task contexts started
    pub total_tasks_spawned: u64,
    /// Task contexts whose body returned or threw
    pub total_tasks_completed: u64,
    /// Callbacks that threw and were reported
    pub callback_exceptions: u64,
    /// Rejections reported as unhandled
    pub unhandled_rejections: u64,
    /// Safe points at which the GC hook chose to collect
    pub gc_collections: u64,
}

/// Result of one `run()` / `run_until_idle()` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Microtasks dequeued and processed
    pub microtasks_processed: usize,
    /// Timer callbacks fired
    pub timers_fired: usize,
    /// Loop iterations (each = poll + drain + at most one timer)
    pub ticks: u64,
    /// Clock reading when the call returned
    pub final_time: u64,
    /// Task contexts left waiting on a deferred nothing can settle anymore
    pub stalled_tasks: usize,
    /// Whether `max_ticks` stopped the loop early
    pub hit_tick_limit: bool,
}

bitflags! {
    /// Kinds of outstanding work
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PendingWork: u8 {
        /// Microtasks are queued
        const MICROTASKS = 1 << 0;
        /// Timers are armed
        const TIMERS = 1 << 1;
        /// Task contexts are suspended
        const TASKS = 1 << 2;
        /// Native event sources are active
        const SOURCES = 1 << 3;
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    clock: RefCell<Box<dyn Clock>>,
    microtasks: RefCell<MicrotaskQueue>,
    timers: RefCell<TimerRegistry>,
    tasks: RefCell<TaskTable>,
    /// Rejected deferreds settled without a reaction, checked after each drain
    rejections: RefCell<Vec<Deferred>>,
    faults: RefCell<Vec<Fault>>,
    reporter: RefCell<Option<Box<dyn FaultReporter>>>,
    sources: RefCell<Vec<Box<dyn EventSource>>>,
    gc_hook: RefCell<Option<Box<dyn GcHook>>>,
    stats: RefCell<SchedulerStats>,
    running: Cell<bool>,
}

/// Cooperative single-threaded scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the running flag when a run call returns, including on error
struct RunGuard<'a> {
    running: &'a Cell<bool>,
}

impl<'a> RunGuard<'a> {
    fn enter(running: &'a Cell<bool>, operation: &'static str) -> Result<Self> {
        if running.replace(true) {
            return Err(Error::Reentrant { operation });
        }
        Ok(Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.set(false);
    }
}

impl Scheduler {
    /// Create a scheduler with the default configuration (virtual clock)
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler from a configuration
    pub fn with_config(config: SchedulerConfig) -> Self {
        let clock: Box<dyn Clock> = match config.clock {
            ClockKind::Virtual => Box::new(VirtualClock::new()),
            ClockKind::System => Box::new(SystemClock::new()),
        };
        Self::build(config, clock)
    }

    /// Create a scheduler driven by a caller-supplied clock
    pub fn with_clock(config: SchedulerConfig, clock: impl Clock + 'static) -> Self {
        Self::build(config, Box::new(clock))
    }

    fn build(config: SchedulerConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                config,
                clock: RefCell::new(clock),
                microtasks: RefCell::new(MicrotaskQueue::new()),
                timers: RefCell::new(TimerRegistry::new()),
                tasks: RefCell::new(TaskTable::default()),
                rejections: RefCell::new(Vec::new()),
                faults: RefCell::new(Vec::new()),
                reporter: RefCell::new(None),
                sources: RefCell::new(Vec::new()),
                gc_hook: RefCell::new(None),
                stats: RefCell::new(SchedulerStats::default()),
                running: Cell::new(false),
            }),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Current clock reading in milliseconds
    pub fn now(&self) -> u64 {
        self.inner.clock.borrow().now()
    }

    /// Whether `run()` or `run_until_idle()` is executing
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    // ------------------------------------------------------------------
    // Microtasks
    // ------------------------------------------------------------------

    /// Queue a continuation behind every microtask already queued.
    ///
    /// A returned `Err` is reported as a callback exception.
    pub fn enqueue_microtask<F>(&self, job: F)
    where
        F: FnOnce(&Scheduler) -> Completion + 'static,
    {
        let seq = self.inner.microtasks.borrow_mut().enqueue("queue", Box::new(job));
        trace!(seq, "microtask queued");
    }

    /// Queue scheduler-internal work that cannot throw
    pub(crate) fn enqueue_job<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce(&Scheduler) + 'static,
    {
        let seq = self.inner.microtasks.borrow_mut().enqueue(
            label,
            Box::new(move |sched: &Scheduler| {
                job(sched);
                Ok(Value::Undefined)
            }),
        );
        trace!(seq, label, "microtask queued");
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Register a callback due `delay_ms` from now. A repeating entry
    /// re-arms `delay_ms` after each callback returns.
    pub fn schedule_timer<F>(&self, delay_ms: u64, callback: F, repeating: bool) -> TimerId
    where
        F: FnMut(&Scheduler) -> Completion + 'static,
    {
        let now = self.now();
        let id = self
            .inner
            .timers
            .borrow_mut()
            .schedule(now, delay_ms, Box::new(callback), repeating);
        trace!(timer = id.0, delay_ms, repeating, "timer scheduled");
        id
    }

    /// Cancel a timer. Unknown, fired or already cancelled ids are ignored;
    /// returns whether an entry was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let cancelled = self.inner.timers.borrow_mut().cancel(id);
        trace!(timer = id.0, cancelled, "timer cancel");
        cancelled
    }

    /// One-shot timer
    pub fn set_timeout<F>(&self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnOnce(&Scheduler) -> Completion + 'static,
    {
        let mut callback = Some(callback);
        self.schedule_timer(
            delay_ms,
            move |sched| match callback.take() {
                Some(callback) => callback(sched),
                None => Ok(Value::Undefined),
            },
            false,
        )
    }

    /// Repeating timer
    pub fn set_interval<F>(&self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnMut(&Scheduler) -> Completion + 'static,
    {
        self.schedule_timer(delay_ms, callback, true)
    }

    /// Run `callback` on the next tick, behind timers already due
    pub fn set_immediate<F>(&self, callback: F) -> TimerId
    where
        F: FnOnce(&Scheduler) -> Completion + 'static,
    {
        self.set_timeout(0, callback)
    }

    /// Cancel an immediate
    pub fn clear_immediate(&self, id: TimerId) -> bool {
        self.cancel_timer(id)
    }

    /// Script-facing `setTimeout(callback, delay, ...args)`
    pub fn set_timeout_value(&self, callback: Value, delay: &Value, args: Vec<Value>) -> Result<TimerId> {
        let delay_ms = delay_from_value(delay)?;
        Ok(self.set_timeout(delay_ms, move |sched| {
            callback.call(sched, &Value::Undefined, &args)
        }))
    }

    /// Script-facing `setInterval(callback, delay, ...args)`
    pub fn set_interval_value(&self, callback: Value, delay: &Value, args: Vec<Value>) -> Result<TimerId> {
        let delay_ms = delay_from_value(delay)?;
        Ok(self.set_interval(delay_ms, move |sched| {
            callback.call(sched, &Value::Undefined, &args)
        }))
    }

    // ------------------------------------------------------------------
    // Deferreds and tasks
    // ------------------------------------------------------------------

    /// Create a pending deferred
    pub fn create_deferred(&self) -> Deferred {
        Deferred::pending()
    }

    /// A pending deferred together with its resolve/reject capabilities
    pub fn with_resolvers(&self) -> Resolvers {
        Resolvers::new()
    }

    /// Start a task context running `body` against `receiver`. The body runs
    /// synchronously up to its first suspension point.
    pub fn spawn<F, Fut>(&self, name: &str, receiver: Value, body: F) -> Deferred
    where
        F: FnOnce(TaskCx) -> Fut,
        Fut: Future<Output = Completion> + 'static,
    {
        async_runtime::spawn_task(self, name, receiver, body)
    }

    // ------------------------------------------------------------------
    // Host integration
    // ------------------------------------------------------------------

    /// Register a native event source, polled at the start of every tick
    pub fn add_event_source(&self, source: impl EventSource + 'static) {
        debug!(source = source.name(), "event source added");
        self.inner.sources.borrow_mut().push(Box::new(source));
    }

    /// Route faults to `reporter` in addition to the retained fault list
    pub fn set_fault_reporter(&self, reporter: impl FaultReporter + 'static) {
        *self.inner.reporter.borrow_mut() = Some(Box::new(reporter));
    }

    /// Install the collector consulted at safe points
    pub fn set_gc_hook(&self, hook: impl GcHook + 'static) {
        *self.inner.gc_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Faults reported so far; clears the retained list
    pub fn take_faults(&self) -> Vec<Fault> {
        std::mem::take(&mut *self.inner.faults.borrow_mut())
    }

    /// Snapshot of the scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        self.inner.stats.borrow().clone()
    }

    /// Reset all statistics to zero
    pub fn reset_stats(&self) {
        *self.inner.stats.borrow_mut() = SchedulerStats::default();
    }

    /// Outstanding work by kind
    pub fn pending_work(&self) -> PendingWork {
        let mut work = PendingWork::empty();
        work.set(PendingWork::MICROTASKS, !self.inner.microtasks.borrow().is_empty());
        work.set(PendingWork::TIMERS, !self.inner.timers.borrow().is_empty());
        work.set(PendingWork::TASKS, !self.inner.tasks.borrow().is_empty());
        work.set(PendingWork::SOURCES, !self.inner.sources.borrow().is_empty());
        work
    }

    /// Whether anything could still run. Suspended tasks alone do not count:
    /// only a microtask, timer or source can resume them.
    pub fn has_pending_work(&self) -> bool {
        self.pending_work()
            .intersects(PendingWork::MICROTASKS | PendingWork::TIMERS | PendingWork::SOURCES)
    }

    /// Number of queued microtasks
    pub fn pending_microtasks(&self) -> usize {
        self.inner.microtasks.borrow().len()
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Number of suspended task contexts
    pub fn suspended_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Drop all queued work, armed timers, suspended tasks and sources
    pub fn shutdown(&self) {
        let microtasks = self.inner.microtasks.borrow_mut().clear();
        let timers = self.inner.timers.borrow_mut().clear();
        let tasks = self.inner.tasks.borrow_mut().clear();
        let sources = std::mem::take(&mut *self.inner.sources.borrow_mut());
        self.inner.rejections.borrow_mut().clear();
        debug!(
            microtasks,
            timers = timers.len(),
            tasks = tasks.len(),
            sources = sources.len(),
            "scheduler shut down"
        );
        // Dropped here, after every borrow above has ended
        drop((timers, tasks, sources));
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Run until no microtask, timer or active event source remains
    pub fn run(&self) -> Result<RunReport> {
        let _guard = RunGuard::enter(&self.inner.running, "run")?;
        let mut report = RunReport::default();
        let poll_interval = self.inner.config.source_poll_interval_ms.max(1);

        loop {
            if let Some(max) = self.inner.config.max_ticks {
                if report.ticks >= max {
                    warn!(max_ticks = max, "tick limit reached, stopping run loop");
                    report.hit_tick_limit = true;
                    break;
                }
            }
            let tick_start = Instant::now();
            report.ticks += 1;

            let sources_active = self.poll_sources();
            report.microtasks_processed += self.drain_microtasks()?;
            self.check_unhandled_rejections();
            self.safe_point(report.ticks);

            let next_due = self.inner.timers.borrow_mut().next_due();
            match next_due {
                Some(due) => {
                    let now = self.now();
                    if due > now {
                        // Keep polling sources while waiting for the timer
                        let wake = if sources_active {
                            due.min(now.saturating_add(poll_interval))
                        } else {
                            due
                        };
                        self.inner.clock.borrow_mut().wait_until(wake);
                    }
                    if self.fire_next_timer() {
                        report.timers_fired += 1;
                    }
                }
                None if sources_active => {
                    let wake = self.now().saturating_add(poll_interval);
                    self.inner.clock.borrow_mut().wait_until(wake);
                }
                None if !self.inner.microtasks.borrow().is_empty() => {}
                None => {
                    self.finish_tick(tick_start);
                    break;
                }
            }
            self.finish_tick(tick_start);
        }

        report.final_time = self.now();
        report.stalled_tasks = self.report_stalled_tasks();
        debug!(
            ticks = report.ticks,
            microtasks = report.microtasks_processed,
            timers = report.timers_fired,
            final_time = report.final_time,
            stalled = report.stalled_tasks,
            "run finished"
        );
        Ok(report)
    }

    /// Run everything that is ready right now without waiting on the clock:
    /// drain microtasks and fire timers whose due time has already passed.
    pub fn run_until_idle(&self) -> Result<RunReport> {
        let _guard = RunGuard::enter(&self.inner.running, "run_until_idle")?;
        let mut report = RunReport::default();

        loop {
            let tick_start = Instant::now();
            report.ticks += 1;

            self.poll_sources();
            report.microtasks_processed += self.drain_microtasks()?;
            self.check_unhandled_rejections();
            self.safe_point(report.ticks);

            let fired = self.fire_next_timer();
            self.finish_tick(tick_start);
            if fired {
                report.timers_fired += 1;
            } else if self.inner.microtasks.borrow().is_empty() {
                break;
            }
        }

        report.final_time = self.now();
        Ok(report)
    }

    fn finish_tick(&self, tick_start: Instant) {
        let elapsed = tick_start.elapsed().as_millis() as u64;
        let mut stats = self.inner.stats.borrow_mut();
        stats.total_ticks += 1;
        stats.longest_tick_ms = stats.longest_tick_ms.max(elapsed);
    }

    /// Poll every source once; returns whether any is still active
    fn poll_sources(&self) -> bool {
        let mut sources = std::mem::take(&mut *self.inner.sources.borrow_mut());
        if sources.is_empty() {
            return false;
        }

        let mut kept = Vec::with_capacity(sources.len());
        for mut source in sources.drain(..) {
            match source.poll(self) {
                Ok(SourceStatus::Active) => kept.push(source),
                Ok(SourceStatus::Done) => {
                    debug!(source = source.name(), "event source finished");
                }
                Err(reason) => self.report_fault(Fault::CallbackException {
                    source: CallbackSource::EventSource,
                    reason,
                }),
            }
        }

        // Sources added during the poll were pushed onto the emptied list
        let mut current = self.inner.sources.borrow_mut();
        kept.append(&mut current);
        *current = kept;
        !current.is_empty()
    }

    /// Drain the microtask queue to quiescence
    fn drain_microtasks(&self) -> Result<usize> {
        let budget = self.inner.config.microtask_budget;
        let mut processed = 0usize;

        loop {
            if let Some(limit) = budget {
                if processed >= limit && !self.inner.microtasks.borrow().is_empty() {
                    warn!(limit, "microtask budget exceeded");
                    self.record_drain(processed);
                    return Err(Error::MicrotaskBudgetExceeded { limit });
                }
            }
            let Some(task) = self.inner.microtasks.borrow_mut().pop() else {
                break;
            };
            trace!(seq = task.seq, label = task.label, "microtask run");
            if let Err(reason) = (task.job)(self) {
                self.report_fault(Fault::CallbackException {
                    source: CallbackSource::Microtask,
                    reason,
                });
            }
            processed += 1;
        }

        self.record_drain(processed);
        Ok(processed)
    }

    fn record_drain(&self, processed: usize) {
        let mut stats = self.inner.stats.borrow_mut();
        stats.total_microtasks += processed as u64;
        stats.max_microtasks_per_drain = stats.max_microtasks_per_drain.max(processed as u64);
    }

    /// Fire the earliest timer due at the current time, if any
    fn fire_next_timer(&self) -> bool {
        let now = self.now();
        let firing = self.inner.timers.borrow_mut().take_due(now);
        let Some(mut firing) = firing else {
            return false;
        };

        trace!(timer = firing.id.0, due = firing.due, now, "timer fire");
        if let Err(reason) = (firing.callback)(self) {
            self.report_fault(Fault::CallbackException {
                source: CallbackSource::Timer(firing.id),
                reason,
            });
        }

        // Repeating timers re-arm from the time their callback finished
        let now = self.now();
        let spent = self.inner.timers.borrow_mut().finish(firing, now);
        drop(spent);
        self.inner.stats.borrow_mut().total_timers_fired += 1;
        true
    }

    fn check_unhandled_rejections(&self) {
        let pending = std::mem::take(&mut *self.inner.rejections.borrow_mut());
        for deferred in pending {
            if deferred.is_handled() {
                continue;
            }
            if let Some(reason) = deferred.reason() {
                self.inner.stats.borrow_mut().unhandled_rejections += 1;
                self.report_fault(Fault::UnhandledRejection {
                    deferred: deferred.id(),
                    reason,
                });
            }
        }
    }

    /// Compact the timer registry and consult the GC hook
    fn safe_point(&self, tick: u64) {
        let freed = self.inner.timers.borrow_mut().compact();
        if freed > 0 {
            trace!(freed, "timer registry compacted");
        }

        let hook = self.inner.gc_hook.borrow_mut().take();
        let Some(mut hook) = hook else {
            return;
        };
        let point = SafePoint {
            tick,
            now: self.now(),
            pending_timers: self.pending_timers(),
            suspended_tasks: self.suspended_tasks(),
        };
        if hook.needs_collection(&point) {
            let roots = self.roots();
            debug!(tick, roots = roots.len(), "gc safe point");
            hook.collect(&point, &roots);
            self.inner.stats.borrow_mut().gc_collections += 1;
        }
        let mut slot = self.inner.gc_hook.borrow_mut();
        if slot.is_none() {
            *slot = Some(hook);
        }
    }

    /// Values the scheduler keeps alive
    fn roots(&self) -> Vec<Value> {
        let mut roots = self.inner.tasks.borrow().roots();
        roots.extend(
            self.inner
                .rejections
                .borrow()
                .iter()
                .filter_map(Deferred::reason),
        );
        roots
    }

    fn report_stalled_tasks(&self) -> usize {
        let stalled = self.inner.tasks.borrow_mut().take_unreported_stalls();
        let count = self.inner.tasks.borrow().len();
        for (task, name) in stalled {
            self.report_fault(Fault::StalledTask { task, name });
        }
        count
    }

    // ------------------------------------------------------------------
    // Crate-internal bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn report_fault(&self, fault: Fault) {
        warn!("{}", fault);
        if matches!(fault, Fault::CallbackException { .. }) {
            self.inner.stats.borrow_mut().callback_exceptions += 1;
        }
        self.inner.faults.borrow_mut().push(fault.clone());

        // Taken out while it runs so it may report or replace itself
        let reporter = self.inner.reporter.borrow_mut().take();
        if let Some(mut reporter) = reporter {
            reporter.report(&fault);
            let mut slot = self.inner.reporter.borrow_mut();
            if slot.is_none() {
                *slot = Some(reporter);
            }
        }
    }

    pub(crate) fn track_rejection(&self, deferred: Deferred) {
        if self.inner.config.report_unhandled_rejections {
            self.inner.rejections.borrow_mut().push(deferred);
        }
    }

    pub(crate) fn update_stats(&self, update: impl FnOnce(&mut SchedulerStats)) {
        update(&mut self.inner.stats.borrow_mut());
    }

    pub(crate) fn tasks(&self) -> &RefCell<TaskTable> {
        &self.inner.tasks
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now())
            .field("pending", &self.pending_work())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Convert a script delay argument to milliseconds. NaN and undefined
/// become 0; negative delays are a `RangeError`.
pub fn delay_from_value(delay: &Value) -> Result<u64> {
    let ms = delay.to_number();
    if ms.is_nan() {
        return Ok(0);
    }
    if ms < 0.0 {
        return Err(Error::InvalidDelay(ms));
    }
    Ok(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn log() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn push(log: &Rc<RefCell<Vec<String>>>, line: &str) {
        log.borrow_mut().push(line.to_string());
    }

    #[test]
    fn test_microtasks_before_timers() {
        let sched = Scheduler::new();
        let out = log();

        let l = out.clone();
        sched.set_timeout(0, move |_| {
            push(&l, "timer");
            Ok(Value::Undefined)
        });
        let l = out.clone();
        sched.enqueue_microtask(move |sched| {
            push(&l, "micro 1");
            let l = l.clone();
            sched.enqueue_microtask(move |_| {
                push(&l, "micro 2");
                Ok(Value::Undefined)
            });
            Ok(Value::Undefined)
        });

        let report = sched.run().unwrap();
        assert_eq!(*out.borrow(), vec!["micro 1", "micro 2", "timer"]);
        assert_eq!(report.microtasks_processed, 2);
        assert_eq!(report.timers_fired, 1);
    }

    #[test]
    fn test_virtual_time_advances_to_due() {
        let sched = Scheduler::new();
        let seen = Rc::new(Cell::new(0));
        let s = seen.clone();
        sched.set_timeout(250, move |sched| {
            s.set(sched.now());
            Ok(Value::Undefined)
        });
        let report = sched.run().unwrap();
        assert_eq!(seen.get(), 250);
        assert_eq!(report.final_time, 250);
    }

    #[test]
    fn test_interval_with_tick_limit() {
        let config = SchedulerConfig {
            max_ticks: Some(5),
            ..SchedulerConfig::default()
        };
        let sched = Scheduler::with_config(config);
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        sched.set_interval(10, move |_| {
            c.set(c.get() + 1);
            Ok(Value::Undefined)
        });

        let report = sched.run().unwrap();
        assert!(report.hit_tick_limit);
        assert_eq!(count.get(), 5);
        assert_eq!(sched.pending_timers(), 1);
    }

    #[test]
    fn test_reentrant_run_is_rejected() {
        let sched = Scheduler::new();
        let nested = Rc::new(RefCell::new(None));
        let n = nested.clone();
        sched.set_timeout(0, move |sched| {
            *n.borrow_mut() = Some(sched.run().is_err());
            Ok(Value::Undefined)
        });
        sched.run().unwrap();
        assert_eq!(*nested.borrow(), Some(true));
        // The guard is released afterwards
        assert!(sched.run().is_ok());
    }

    #[test]
    fn test_microtask_budget() {
        let config = SchedulerConfig {
            microtask_budget: Some(50),
            ..SchedulerConfig::default()
        };
        let sched = Scheduler::with_config(config);

        fn forever(sched: &Scheduler) -> Completion {
            sched.enqueue_microtask(forever);
            Ok(Value::Undefined)
        }
        sched.enqueue_microtask(forever);

        let err = sched.run().unwrap_err();
        assert!(matches!(err, Error::MicrotaskBudgetExceeded { limit: 50 }));
        assert!(!sched.is_running());
    }

    #[test]
    fn test_default_config_drains_long_finite_chains() {
        assert_eq!(SchedulerConfig::default().microtask_budget, None);
        let sched = Scheduler::new();
        let ran = Rc::new(Cell::new(0usize));
        for _ in 0..100_001 {
            let r = ran.clone();
            sched.enqueue_microtask(move |_| {
                r.set(r.get() + 1);
                Ok(Value::Undefined)
            });
        }

        let report = sched.run().unwrap();
        assert_eq!(ran.get(), 100_001);
        assert_eq!(report.microtasks_processed, 100_001);
        assert_eq!(sched.pending_microtasks(), 0);
    }

    #[test]
    fn test_throwing_microtask_is_reported() {
        let sched = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        sched.enqueue_microtask(|_| Err(Value::new_error(ErrorKind::GenericError, "bad")));
        let r = ran.clone();
        sched.enqueue_microtask(move |_| {
            r.set(true);
            Ok(Value::Undefined)
        });
        sched.run().unwrap();

        assert!(ran.get());
        let faults = sched.take_faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].to_string(), "Uncaught exception in microtask: Error: bad");
        assert_eq!(sched.stats().callback_exceptions, 1);
    }

    #[test]
    fn test_fault_reporter_receives_faults() {
        let sched = Scheduler::new();
        let seen = log();
        let s = seen.clone();
        sched.set_fault_reporter(move |fault: &Fault| s.borrow_mut().push(fault.to_string()));
        let id = sched.set_timeout(1, |_| Err(Value::from("oops")));
        sched.run().unwrap();
        assert_eq!(*seen.borrow(), vec![format!("Uncaught exception in timer {}: oops", id)]);
    }

    #[test]
    fn test_fault_reporter_may_replace_itself() {
        let sched = Scheduler::new();
        let seen = log();
        let (s, handle) = (seen.clone(), sched.clone());
        sched.set_fault_reporter(move |fault: &Fault| {
            s.borrow_mut().push(format!("first: {}", fault));
            let s = s.clone();
            handle.set_fault_reporter(move |fault: &Fault| {
                s.borrow_mut().push(format!("second: {}", fault));
            });
        });
        sched.set_timeout(1, |_| Err(Value::from("one")));
        sched.set_timeout(2, |_| Err(Value::from("two")));
        sched.run().unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                "first: Uncaught exception in timer 1: one".to_string(),
                "second: Uncaught exception in timer 2: two".to_string(),
            ]
        );
        assert_eq!(sched.take_faults().len(), 2);
    }

    #[test]
    fn test_reporter_that_reports_again_does_not_panic() {
        let sched = Scheduler::new();
        let count = Rc::new(Cell::new(0));
        let (c, handle) = (count.clone(), sched.clone());
        sched.set_fault_reporter(move |_: &Fault| {
            c.set(c.get() + 1);
            if c.get() == 1 {
                handle.report_fault(Fault::CallbackException {
                    source: CallbackSource::EventSource,
                    reason: Value::from("nested"),
                });
            }
        });
        sched.enqueue_microtask(|_| Err(Value::from("outer")));
        sched.run().unwrap();

        // The nested report happens while the reporter is out of its slot
        assert_eq!(count.get(), 1);
        assert_eq!(sched.take_faults().len(), 2);
    }

    #[test]
    fn test_pending_work_counts_running_interval() {
        let sched = Scheduler::new();
        let seen = Rc::new(Cell::new(None));
        let own = Rc::new(Cell::new(None));
        let (s, o) = (seen.clone(), own.clone());
        let id = sched.set_interval(5, move |sched| {
            s.set(Some((sched.pending_timers(), sched.pending_work())));
            if let Some(id) = o.get() {
                sched.cancel_timer(id);
            }
            Ok(Value::Undefined)
        });
        own.set(Some(id));
        sched.run().unwrap();

        let (timers, work) = seen.get().unwrap();
        assert_eq!(timers, 1);
        assert!(work.contains(PendingWork::TIMERS));
        assert_eq!(sched.pending_timers(), 0);
    }

    #[test]
    fn test_run_until_idle_does_not_wait() {
        let sched = Scheduler::new();
        let out = log();
        let l = out.clone();
        sched.set_timeout(0, move |_| {
            push(&l, "now");
            Ok(Value::Undefined)
        });
        let l = out.clone();
        sched.set_timeout(100, move |_| {
            push(&l, "later");
            Ok(Value::Undefined)
        });

        let report = sched.run_until_idle().unwrap();
        assert_eq!(*out.borrow(), vec!["now"]);
        assert_eq!(report.final_time, 0);
        assert_eq!(sched.pending_timers(), 1);

        sched.run().unwrap();
        assert_eq!(*out.borrow(), vec!["now", "later"]);
    }

    #[test]
    fn test_pending_work_flags() {
        let sched = Scheduler::new();
        assert!(sched.pending_work().is_empty());
        sched.set_timeout(5, |_| Ok(Value::Undefined));
        sched.enqueue_microtask(|_| Ok(Value::Undefined));
        assert_eq!(sched.pending_work(), PendingWork::MICROTASKS | PendingWork::TIMERS);
        assert!(sched.has_pending_work());
    }

    #[test]
    fn test_shutdown_drops_everything() {
        let sched = Scheduler::new();
        sched.set_interval(5, |_| Ok(Value::Undefined));
        sched.enqueue_microtask(|_| Ok(Value::Undefined));
        sched.shutdown();
        assert!(!sched.has_pending_work());
        let report = sched.run().unwrap();
        assert_eq!(report.timers_fired, 0);
    }

    #[test]
    fn test_delay_from_value() {
        assert_eq!(delay_from_value(&Value::Undefined).unwrap(), 0);
        assert_eq!(delay_from_value(&Value::from(f64::NAN)).unwrap(), 0);
        assert_eq!(delay_from_value(&Value::from("25")).unwrap(), 25);
        assert_eq!(delay_from_value(&Value::from(7.9)).unwrap(), 7);
        assert!(matches!(
            delay_from_value(&Value::from(-1)),
            Err(Error::InvalidDelay(d)) if d == -1.0
        ));
    }

    #[test]
    fn test_set_timeout_value_calls_function() {
        let sched = Scheduler::new();
        let out = log();
        let l = out.clone();
        let callback = Value::from(crate::runtime::Function::native("cb", move |_, _, args| {
            push(&l, &args[0].to_js_string());
            Ok(Value::Undefined)
        }));
        sched
            .set_timeout_value(callback, &Value::from(10), vec![Value::from("arg")])
            .unwrap();
        assert!(sched
            .set_timeout_value(Value::Undefined, &Value::from(-5), vec![])
            .is_err());
        sched.run().unwrap();
        assert_eq!(*out.borrow(), vec!["arg"]);
    }

    #[test]
    fn test_config_from_json() {
        let config = SchedulerConfig::from_json(r#"{"clock": "system", "max_ticks": 10}"#).unwrap();
        assert_eq!(config.clock, ClockKind::System);
        assert_eq!(config.max_ticks, Some(10));
        assert!(config.report_unhandled_rejections);
        assert!(SchedulerConfig::from_json("{").is_err());
    }
}

//! Prelude module for convenient imports
//!
//! ```no_run
//! use cadence::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let sched = Scheduler::new();
//!     sched.enqueue_microtask(|_| Ok(Value::Undefined));
//!     sched.run()?;
//!     Ok(())
//! }
//! ```

// Scheduler
pub use crate::event_loop::{
    ClockKind, EventSource, PendingWork, RunReport, Scheduler, SchedulerConfig, SchedulerStats,
    SourceStatus, TimerId,
};

// Error handling
pub use crate::error::{Completion, Error, ErrorKind, Fault, FaultReporter, Result};

// Values, deferreds and tasks
pub use crate::runtime::{Bounce, Deferred, DeferredState, Function, TaskCx, TaskId, Value};

// Garbage collection
pub use crate::gc::{GcHook, SafePoint, Traceable};

// Version constant
pub use crate::VERSION;

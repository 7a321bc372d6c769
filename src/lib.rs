//! Cadence: a deterministic cooperative scheduler for embedded scripting runtimes
//!
//! Cadence is the concurrency core of a single-threaded script runtime. It
//! turns suspension-capable calls, deferred-computation objects (promises)
//! and timers into one deterministic execution order:
//!
//! - synchronous code runs before any microtask
//! - every microtask runs before the next timer
//! - timers with equal due times fire in registration order
//!
//! # Quick Start
//!
//! ```no_run
//! use cadence::prelude::*;
//!
//! fn main() -> cadence::Result<()> {
//!     let sched = Scheduler::new();
//!     let deferred = sched.create_deferred();
//!     let target = deferred.clone();
//!     sched.set_timeout(50, move |sched| {
//!         target.resolve(sched, Value::from("ready"));
//!         Ok(Value::Undefined)
//!     });
//!     let report = sched.run()?;
//!     println!("{:?} at {}ms", deferred.value(), report.final_time);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Scheduling** | [`event_loop`] (scheduler, timers, microtasks, clocks, event sources) |
//! | **Runtime** | [`runtime`] (values, deferreds, task contexts, trampoline) |
//! | **Host hooks** | [`gc`], [`error`](Error) |
//! | **Tooling** | [`scenarios`] |
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod event_loop;
pub mod gc;
pub mod prelude;
pub mod runtime;
pub mod scenarios;

mod error;

pub use error::{CallbackSource, Completion, Error, ErrorKind, Fault, FaultReporter, Result};
pub use event_loop::{RunReport, Scheduler, SchedulerConfig, TimerId};
pub use runtime::{Deferred, Function, Value};

/// Cadence version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Runtime types the scheduler works with
//!
//! This module provides the slice of the runtime the scheduler drives:
//! script values and functions, deferred-computation objects, suspendable
//! task contexts, and the tail-call trampoline.

pub mod async_runtime;
pub mod promise;
pub mod trampoline;
mod value;

pub use async_runtime::{spawn_task, Suspend, TaskBody, TaskContext, TaskCx, TaskId, TaskTable};
pub use promise::{aggregate_error, Deferred, DeferredId, DeferredState, Handler, Resolvers};
pub use trampoline::{trampoline, Bounce};
pub use value::{AsyncFn, Function, NativeFn, Object, ObjectKind, Value};

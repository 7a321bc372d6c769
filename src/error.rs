//! Error types for the Cadence scheduler
//!
//! Two layers live here. [`Error`] covers host-facing failures of the
//! scheduler itself (re-entrant runs, bad configuration, runaway microtask
//! chains). Script-level failures are *values*: a callback or task body
//! completes with `Err(value)` carrying whatever was thrown, and anything the
//! scheduler catches on the script's behalf is reported as a [`Fault`].

use crate::event_loop::TimerId;
use crate::runtime::{DeferredId, TaskId, Value};
use std::fmt;
use thiserror::Error;

/// Main error type for Cadence
#[derive(Error, Debug)]
pub enum Error {
    /// `run`/`run_until_idle` was called from inside a callback the loop is executing
    #[error("ReentrancyError: {operation} called while the scheduler is already running")]
    Reentrant { operation: &'static str },

    /// A timer delay that is negative or not a number
    #[error("RangeError: timer delay must be a non-negative number, got {0}")]
    InvalidDelay(f64),

    /// A single drain ran more microtasks than the configured budget allows
    #[error("ResourceLimitError: microtask budget of {limit} exceeded in a single drain")]
    MicrotaskBudgetExceeded { limit: usize },

    /// Configuration could not be parsed
    #[error("ConfigError: {source}")]
    Config {
        #[from]
        source: serde_json::Error,
    },

    /// IO error
    #[error("IOError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },

    /// Internal scheduler error
    #[error("InternalError: {0}")]
    InternalError(String),
}

/// Result type alias for Cadence
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of running script-level code: `Ok` with the produced value, or
/// `Err` with the thrown value.
pub type Completion = std::result::Result<Value, Value>;

/// Script error classes used when the scheduler itself has to throw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// RangeError - value out of range
    RangeError,
    /// Generic Error - user-thrown Error objects
    GenericError,
    /// AggregateError - every input of `any` rejected
    AggregateError,
    /// InternalError - internal engine error
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
            ErrorKind::GenericError => write!(f, "Error"),
            ErrorKind::AggregateError => write!(f, "AggregateError"),
            ErrorKind::InternalError => write!(f, "InternalError"),
        }
    }
}

/// Where a caught callback exception came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackSource {
    /// A timer or immediate callback
    Timer(TimerId),
    /// A plain microtask enqueued by the host or a script
    Microtask,
    /// A native event source poll
    EventSource,
}

impl fmt::Display for CallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackSource::Timer(id) => write!(f, "timer {}", id),
            CallbackSource::Microtask => write!(f, "microtask"),
            CallbackSource::EventSource => write!(f, "event source"),
        }
    }
}

/// A non-fatal failure caught by the scheduler and reported to the host
#[derive(Debug, Clone)]
pub enum Fault {
    /// A timer, microtask or event-source callback threw; the loop kept going
    CallbackException {
        source: CallbackSource,
        reason: Value,
    },
    /// A deferred was rejected and no reaction was attached by the end of a drain
    UnhandledRejection { deferred: DeferredId, reason: Value },
    /// A task was still suspended when the loop ran out of work
    StalledTask { task: TaskId, name: String },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::CallbackException { source, reason } => {
                write!(f, "Uncaught exception in {}: {}", source, reason)
            }
            Fault::UnhandledRejection { deferred, reason } => {
                write!(f, "Uncaught (in promise) {}: {}", deferred, reason)
            }
            Fault::StalledTask { task, name } => {
                write!(f, "{} ({}) never resumed", task, name)
            }
        }
    }
}

/// The host's error channel for [`Fault`]s
pub trait FaultReporter {
    /// Receive one fault. Must not panic; the run loop continues afterwards.
    fn report(&mut self, fault: &Fault);
}

impl<F: FnMut(&Fault)> FaultReporter for F {
    fn report(&mut self, fault: &Fault) {
        self(fault)
    }
}

//! Native event sources
//!
//! Native I/O lives outside the scheduler. A source is polled once at the
//! start of every tick and reports completions by settling deferreds it
//! handed out earlier. While any source is active the loop keeps running
//! even if no timer or microtask is queued.

use super::Scheduler;
use crate::runtime::Value;

/// Whether a source still has outstanding work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    /// Keep polling
    Active,
    /// Finished; drop the source
    Done,
}

/// A native completion source polled by the run loop
pub trait EventSource {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Deliver any completions that are ready.
    ///
    /// Returning `Err` reports the value as a callback exception and drops
    /// the source.
    fn poll(&mut self, sched: &Scheduler) -> Result<SourceStatus, Value>;
}

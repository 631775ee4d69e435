//! Event-driven scheduler.
//!
//! The scheduler owns the clock, the event queue and the resource manager.
//! Each tick pops one time batch, releases state on OP_END, turns phase hooks
//! into proposals, and commits or rolls back every proposed batch atomically.

mod core;
mod metrics;
mod snapshot;

pub use core::{RunStop, Scheduler, SchedulerError};
pub use metrics::{SchedulerMetrics, SkipReason};
pub use snapshot::{PendingEvent, SchedulerSnapshot};

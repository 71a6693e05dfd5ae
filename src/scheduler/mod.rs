//! Measurement cycle scheduling: single-shot and continuous modes.
//!
//! At most one cycle is in flight at a time; concurrent trials against the
//! provider are what trigger its rate limiting.

pub mod engine;
pub mod history;

pub use engine::{next_delay, Scheduler, SchedulerSettings};
pub use history::{CycleOutcome, RunStatus, RunSummary};

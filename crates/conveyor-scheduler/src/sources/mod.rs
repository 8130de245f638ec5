//! Schedule sources.
//!
//! Everything that feeds records into a scheduler lives here:
//!
//! - [`instant`] -- emit a record right now.
//! - [`tracker`] -- emit one record and block for the scheduler's answer.
//! - [`cron`] -- emit records on a recurring cron schedule.
//! - [`chain`] -- expand a logical request into a dependency-ordered run
//!   of tasks, recorded in an append-only log.

pub mod chain;
pub mod cron;
pub mod instant;
pub mod tracker;

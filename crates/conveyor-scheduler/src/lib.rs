//! Policy-aware task scheduling for the conveyor job runtime.
//!
//! This crate is the runtime's core: schedule sources emit
//! [`ScheduleRecord`]s, a single-writer decision engine admits, postpones,
//! drops, expires, starts and completes them over a bounded thread pool,
//! and every step of a record's life is announced as a lifecycle signal.
//!
//! - **[`record`]** -- records, postpone policies and the
//!   [`ScheduleSource`] contract.
//! - **[`queue`]** -- the [`PostponeQueue`] holding records that cannot
//!   run yet.
//! - **[`executor`]** -- the [`SchedulerExecutor`] decision engine.
//! - **[`scheduler`]** -- the [`Scheduler`] facade consumers talk to.
//! - **[`sources`]** -- instant, tracking, cron and dependency-chained
//!   sources.
//!
//! # A task's life
//!
//! ```text
//! source --task_scheduled--> scheduler --+-- started ---> completed
//!                                        +-- postponed -> started -> completed
//!                                        +-- dropped
//!                                        +-- expired
//! ```
//!
//! Exactly one of the terminal outcomes (completed, dropped, expired) is
//! announced per accepted record.

pub mod error;
pub mod executor;
pub mod queue;
pub mod record;
pub mod scheduler;
pub mod sources;

pub use error::{Result, SchedulerError};
pub use executor::{SchedulerExecutor, SchedulerSignal};
pub use queue::{PostponeQueue, QueueSignal};
pub use record::{
    PostponePolicy, RecordHandle, ScheduleRecord, ScheduleSource, SchedulerFeedback, SourceSignal,
};
pub use scheduler::Scheduler;
pub use sources::chain::{
    ChainLogEntry, ChainRegistry, ChainState, ChainedSource, ChainedTaskFactory, ChainedTaskLog,
};
pub use sources::cron::{CronJob, CronSource};
pub use sources::instant::InstantSource;
pub use sources::tracker::TrackerSource;

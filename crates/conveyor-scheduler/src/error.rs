//! Scheduler error types.
//!
//! [`SchedulerError`] is the single error type returned by every public
//! API in this crate.  Errors from the signal plumbing and the task layer
//! are wrapped transparently so call sites keep one `?`-friendly type.

use conveyor_signals::SignalError;
use conveyor_tasks::TaskError;

/// Unified error type for the scheduler, its postpone queue and its
/// schedule sources.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    // -- Scheduler executor errors ------------------------------------------
    /// The record's task is already tracked; tasks cannot be double-submitted.
    #[error("a submitted task is registered already")]
    DuplicateTask,

    /// Waiting for running tasks exceeded the per-task timeout.
    #[error("timed out waiting for running tasks")]
    AwaitTimeout,

    /// The scheduler executor was dropped while work was still queued.
    #[error("scheduler executor is gone")]
    SchedulerGone,

    // -- Facade errors ------------------------------------------------------
    /// The source is already subscribed to this scheduler.
    #[error("source is subscribed already")]
    DuplicateSource,

    /// The source is not subscribed to this scheduler.
    #[error("unknown source requested to unsubscribe")]
    UnknownSource,

    // -- Source errors ------------------------------------------------------
    /// A source's backing object was dropped while a record still needed it.
    #[error("schedule source is gone")]
    SourceGone,

    /// `start` was called on a source that is already running.
    #[error("source is already started")]
    SourceAlreadyStarted,

    /// `stop` was called on a source that was never started.
    #[error("source is not started")]
    SourceNotStarted,

    // -- Tracker errors -----------------------------------------------------
    /// The tracker source is not registered with any scheduler.
    #[error("no scheduler has registered with this source")]
    NoScheduler,

    /// The tracker is already waiting on another record.
    #[error("another record is being tracked already")]
    TrackerBusy,

    /// Tracked records must use the drop postpone policy so the scheduler
    /// answers promptly instead of queueing.
    #[error("a tracked record must use the drop postpone policy")]
    TrackedRecordPolicy,

    // -- Chained source errors ----------------------------------------------
    /// The scheduler refused to start a chained record.
    #[error("scheduler refused to start task `{api_id}`: {outcome}")]
    RecordRefused { api_id: String, outcome: String },

    /// The task already has an active (started, not completed) log entry.
    #[error("task `{api_id}` has been started already")]
    ChainActive { api_id: String },

    /// The dependency expansion proposed an id that is already pending.
    #[error("mutual dependencies found for task `{api_id}`")]
    DependencyCycle { api_id: String },

    /// No factory is registered under this api id.
    #[error("unknown task api id: {api_id}")]
    UnknownApi { api_id: String },

    /// A factory is already registered under this api id.
    #[error("task api id is registered already: {api_id}")]
    DuplicateApi { api_id: String },

    // -- Wrapped layers -----------------------------------------------------
    /// An error bubbled up from the signal bus or callback queue.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// An error bubbled up from the task layer.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;

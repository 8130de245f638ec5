//! Task and executor error types.
//!
//! [`TaskError`] is the single error type for this crate.  It is `Clone`
//! because failed task outcomes carry their error inside
//! [`TaskResult::Failed`](crate::task::TaskResult::Failed), which travels
//! through completion signals.

use conveyor_signals::SignalError;

/// Unified error type for tasks, the thread executor and the datalog.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    // -- Task errors --------------------------------------------------------
    /// The task does not implement the requested optional capability.
    #[error("task does not support the `{capability}` capability")]
    UnsupportedCapability { capability: &'static str },

    /// A task reported a failure from its own `start` implementation.
    #[error("task failed: {reason}")]
    Failed { reason: String },

    /// The task's `start` panicked; the panic was captured by the worker.
    #[error("task panicked: {reason}")]
    Panicked { reason: String },

    /// `start` was called on a task that is already running or finished.
    #[error("task is already started")]
    AlreadyStarted,

    // -- Executor errors ----------------------------------------------------
    /// The submitted task is already tracked by the executor.
    #[error("task is already executed")]
    AlreadyRunning,

    /// Every worker slot is taken; the submission was not queued.
    #[error("no free executor slot")]
    NoFreeSlot,

    /// The referenced task is not tracked by the executor.
    #[error("no such task")]
    NoSuchTask,

    // -- Critical section errors --------------------------------------------
    /// The protected value's lock was poisoned by a panicking holder.
    #[error("critical section is poisoned")]
    LockPoisoned,

    /// A non-blocking acquisition found the critical section busy.
    #[error("critical section is busy")]
    Contended,

    // -- Signal plumbing ----------------------------------------------------
    /// An error bubbled up from the signal bus or callback queue.
    #[error(transparent)]
    Signal(#[from] SignalError),
}

impl TaskError {
    /// Build the generic task-failure variant.
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskError::Failed {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TaskError>;

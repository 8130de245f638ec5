//! Signal and callback-queue error types.
//!
//! Every public API in this crate surfaces errors through [`SignalError`].
//! Bus errors and queue errors are programming errors in the sense of the
//! runtime's error taxonomy: they are reported to the offending caller and
//! are never retried internally.

/// Unified error type for the signal bus and the callback queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    // -- Bus errors ---------------------------------------------------------
    /// The signal is not part of the bus's declared signal set.
    #[error("unknown signal: {signal}")]
    UnknownSignal {
        /// Debug rendering of the signal kind that was looked up.
        signal: String,
    },

    /// The emitted value failed the signal's declared value check.
    #[error("invalid value for signal {signal}")]
    InvalidValue { signal: String },

    /// An unsubscribe was requested for a callback that is not registered.
    #[error("callback is not subscribed to signal {signal}")]
    NotSubscribed { signal: String },

    // -- Callback queue errors ----------------------------------------------
    /// The queue has not been started yet.
    #[error("callback queue is not started")]
    NotStarted,

    /// `start` was called on a queue that is already running.
    #[error("callback queue is already started")]
    AlreadyStarted,

    /// The queue has been stopped and no longer accepts submissions.
    #[error("callback queue is stopped")]
    Stopped,

    /// A blocking submission was made from inside the queue worker, which
    /// would deadlock.
    #[error("re-entrant blocking call into the callback queue")]
    Reentrant,

    /// The submitted closure panicked on the queue worker.
    #[error("queued callback panicked")]
    CallbackPanicked,

    /// The worker vanished before answering a blocking submission.
    #[error("callback queue worker is gone")]
    Disconnected,

    /// A blocking submission did not complete within its timeout.
    #[error("timed out waiting for a queued callback")]
    Timeout,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SignalError>;

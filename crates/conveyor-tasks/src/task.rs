//! Task model.
//!
//! A [`Task`] is an opaque unit of blocking work.  `start` does the work
//! and produces an opaque [`TaskOutput`]; the optional `stop` and
//! `terminate` capabilities are modelled as default methods gated by the
//! `supports_stop` / `supports_terminate` predicates -- a task opts into a
//! capability by overriding both the predicate and the method.
//!
//! Tasks are addressed by `Arc` identity everywhere in the runtime: a
//! [`TaskKey`] is derived from the [`TaskHandle`] allocation, which is what
//! lets the executor and the scheduler keep "each task appears in at most
//! one live record" cheap to enforce.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TaskError};

/// Opaque output of a completed task.
pub type TaskOutput = serde_json::Value;

/// An opaque unit of blocking work with optional cancel hooks.
pub trait Task: Send + Sync + 'static {
    /// Run the work to completion on the calling thread.
    fn start(&self) -> Result<TaskOutput>;

    /// Whether this task implements the cooperative `stop` capability.
    fn supports_stop(&self) -> bool {
        false
    }

    /// Whether this task implements the forceful `terminate` capability.
    fn supports_terminate(&self) -> bool {
        false
    }

    /// Ask the task to stop gracefully.
    fn stop(&self) -> Result<()> {
        Err(TaskError::UnsupportedCapability { capability: "stop" })
    }

    /// Ask the task to stop at all costs.
    fn terminate(&self) -> Result<()> {
        Err(TaskError::UnsupportedCapability {
            capability: "terminate",
        })
    }
}

/// Shared handle to a task.
pub type TaskHandle = Arc<dyn Task>;

/// Identity of a task, derived from its `Arc` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey(usize);

impl TaskKey {
    /// Key of the given handle.
    #[must_use]
    pub fn of(task: &TaskHandle) -> Self {
        TaskKey(Arc::as_ptr(task) as *const () as usize)
    }
}

/// Tagged outcome of a finished task, emitted exactly once per task.
#[derive(Debug, Clone)]
pub enum TaskResult {
    /// `start` returned normally with this output.
    Completed(TaskOutput),
    /// `start` returned an error or panicked.
    Failed(TaskError),
}

impl TaskResult {
    /// True for the `Completed` arm.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskResult::Completed(_))
    }

    /// The output, if the task completed.
    #[must_use]
    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            TaskResult::Completed(output) => Some(output),
            TaskResult::Failed(_) => None,
        }
    }

    /// The error, if the task failed.
    #[must_use]
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskResult::Completed(_) => None,
            TaskResult::Failed(err) => Some(err),
        }
    }
}

/// Payload of task lifecycle signals: which task, and (for completions)
/// how it ended.
#[derive(Clone)]
pub struct TaskNotice {
    /// The task the notice is about.
    pub task: TaskHandle,
    /// Present on completion notices, absent on start notices.
    pub result: Option<TaskResult>,
}

impl fmt::Debug for TaskNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNotice")
            .field("task", &TaskKey::of(&self.task))
            .field("result", &self.result)
            .finish()
    }
}

/// Adapter from a plain closure to the [`Task`] trait.
pub struct FnTask<F> {
    function: F,
}

impl<F> FnTask<F>
where
    F: Fn() -> Result<TaskOutput> + Send + Sync + 'static,
{
    /// Wrap a fallible closure.
    pub fn new(function: F) -> Self {
        Self { function }
    }

    /// Wrap a fallible closure directly into a [`TaskHandle`].
    pub fn handle(function: F) -> TaskHandle {
        Arc::new(Self::new(function))
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn() -> Result<TaskOutput> + Send + Sync + 'static,
{
    fn start(&self) -> Result<TaskOutput> {
        (self.function)()
    }
}

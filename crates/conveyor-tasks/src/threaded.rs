//! One task, one thread.
//!
//! [`ThreadedTask`] runs a single [`Task`] on a dedicated OS thread and
//! publishes its lifecycle on a two-signal bus: `Started` when the thread
//! begins, then exactly one `Completed` carrying the [`TaskResult`].  A
//! panicking `start` is caught on the worker and recorded as
//! [`TaskResult::Failed`]; nothing escapes to the spawner.
//!
//! Completion is recorded under the task's own lock *before* the
//! `Completed` signal fires, so a subscriber that reacts to the signal can
//! immediately `wait`/`join` without racing the result.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use conveyor_signals::SignalBus;

use crate::error::{Result, TaskError};
use crate::task::{Task, TaskHandle, TaskNotice, TaskResult};

/// Lifecycle signals of a [`ThreadedTask`], payload [`TaskNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSignal {
    /// The worker thread is up and about to call `start`.
    Started,
    /// The task finished; the notice carries its result.
    Completed,
}

struct ThreadState {
    started: bool,
    worker: Option<JoinHandle<()>>,
    result: Option<TaskResult>,
}

struct ThreadedInner {
    task: TaskHandle,
    state: Mutex<ThreadState>,
    done: Condvar,
    signals: SignalBus<TaskSignal, TaskNotice>,
}

/// Runs one task on a dedicated worker thread.
#[derive(Clone)]
pub struct ThreadedTask {
    inner: Arc<ThreadedInner>,
}

impl ThreadedTask {
    /// Wrap a task.  The thread is not spawned until [`ThreadedTask::start`].
    #[must_use]
    pub fn new(task: TaskHandle) -> Self {
        Self {
            inner: Arc::new(ThreadedInner {
                task,
                state: Mutex::new(ThreadState {
                    started: false,
                    worker: None,
                    result: None,
                }),
                done: Condvar::new(),
                signals: SignalBus::new([TaskSignal::Started, TaskSignal::Completed]),
            }),
        }
    }

    /// The wrapped task.
    #[must_use]
    pub fn task(&self) -> &TaskHandle {
        &self.inner.task
    }

    /// The lifecycle bus of this task.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<TaskSignal, TaskNotice> {
        &self.inner.signals
    }

    /// Spawn the worker thread.  A task can only be started once.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.started {
            return Err(TaskError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        let worker = thread::Builder::new()
            .name("conveyor-task".to_string())
            .spawn(move || run_task(&inner))
            .map_err(|err| TaskError::failed(format!("failed to spawn task thread: {err}")))?;

        state.started = true;
        state.worker = Some(worker);
        Ok(())
    }

    /// Ask the wrapped task to stop gracefully.
    pub fn stop(&self) -> Result<()> {
        self.inner.task.stop()
    }

    /// Ask the wrapped task to stop at all costs.
    pub fn terminate(&self) -> Result<()> {
        self.inner.task.terminate()
    }

    /// Result of the task, if it has finished.
    pub fn result(&self) -> Result<Option<TaskResult>> {
        Ok(self.lock_state()?.result.clone())
    }

    /// Wait for the task to finish.
    ///
    /// `None` blocks forever, `Some(Duration::ZERO)` polls, anything else
    /// bounds the wait.  Returns `false` if the task has not finished in
    /// time (or was never started).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut state = self.lock_state()?;
        loop {
            if state.result.is_some() {
                return Ok(true);
            }
            if !state.started {
                return Ok(false);
            }
            state = match deadline {
                None => self
                    .inner
                    .done
                    .wait(state)
                    .map_err(|_| TaskError::LockPoisoned)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.inner
                        .done
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| TaskError::LockPoisoned)?
                        .0
                }
            };
        }
    }

    /// Join the worker thread.  Idempotent once the thread has been joined.
    pub fn join(&self) -> Result<()> {
        let worker = self.lock_state()?.worker.take();
        if let Some(worker) = worker {
            worker.join().map_err(|_| TaskError::Panicked {
                reason: "task worker thread aborted".to_string(),
            })?;
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ThreadState>> {
        self.inner.state.lock().map_err(|_| TaskError::LockPoisoned)
    }
}

fn run_task(inner: &Arc<ThreadedInner>) {
    let started = TaskNotice {
        task: Arc::clone(&inner.task),
        result: None,
    };
    if let Err(err) = inner.signals.emit(TaskSignal::Started, started) {
        tracing::error!(error = %err, "failed to emit task start");
    }

    let result = match catch_unwind(AssertUnwindSafe(|| inner.task.start())) {
        Ok(Ok(output)) => TaskResult::Completed(output),
        Ok(Err(err)) => TaskResult::Failed(err),
        Err(panic) => TaskResult::Failed(TaskError::Panicked {
            reason: panic_reason(panic.as_ref()),
        }),
    };

    // Record the result before announcing it, so signal subscribers can
    // wait/join without racing.
    match inner.state.lock() {
        Ok(mut state) => {
            state.result = Some(result.clone());
        }
        Err(poisoned) => {
            poisoned.into_inner().result = Some(result.clone());
        }
    }
    inner.done.notify_all();

    let completed = TaskNotice {
        task: Arc::clone(&inner.task),
        result: Some(result),
    };
    if let Err(err) = inner.signals.emit(TaskSignal::Completed, completed) {
        tracing::error!(error = %err, "failed to emit task completion");
    }
}

fn panic_reason(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnTask, TaskOutput};
    use conveyor_signals::handler;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runs_and_records_the_result() {
        let threaded = ThreadedTask::new(FnTask::handle(|| Ok(json!("done"))));
        threaded.start().unwrap();
        assert!(threaded.wait(None).unwrap());
        threaded.join().unwrap();

        match threaded.result().unwrap() {
            Some(TaskResult::Completed(output)) => assert_eq!(output, json!("done")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn emits_started_then_completed() {
        let threaded = ThreadedTask::new(FnTask::handle(|| Ok(TaskOutput::Null)));
        let events = Arc::new(Mutex::new(Vec::new()));

        let watcher = {
            let events = Arc::clone(&events);
            handler(move |kind, notice: &TaskNotice| {
                events
                    .lock()
                    .unwrap()
                    .push((kind, notice.result.is_some()));
            })
        };
        threaded.signals().subscribe(TaskSignal::Started, &watcher).unwrap();
        threaded
            .signals()
            .subscribe(TaskSignal::Completed, &watcher)
            .unwrap();

        threaded.start().unwrap();
        assert!(threaded.wait(None).unwrap());
        threaded.join().unwrap();

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[(TaskSignal::Started, false), (TaskSignal::Completed, true)]
        );
    }

    #[test]
    fn panic_is_captured_as_failure() {
        let threaded = ThreadedTask::new(FnTask::handle(|| panic!("kaboom")));
        threaded.start().unwrap();
        assert!(threaded.wait(None).unwrap());
        threaded.join().unwrap();

        match threaded.result().unwrap() {
            Some(TaskResult::Failed(TaskError::Panicked { reason })) => {
                assert!(reason.contains("kaboom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn double_start_is_rejected() {
        let threaded = ThreadedTask::new(FnTask::handle(|| Ok(TaskOutput::Null)));
        threaded.start().unwrap();
        assert!(matches!(threaded.start(), Err(TaskError::AlreadyStarted)));
        threaded.wait(None).unwrap();
        threaded.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_a_slow_task() {
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        let threaded = ThreadedTask::new(FnTask::handle(move || {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(TaskOutput::Null)
        }));
        threaded.start().unwrap();

        assert!(!threaded.wait(Some(Duration::from_millis(20))).unwrap());
        assert!(!threaded.wait(Some(Duration::ZERO)).unwrap());

        release.store(true, Ordering::SeqCst);
        assert!(threaded.wait(None).unwrap());
        threaded.join().unwrap();
    }

    #[test]
    fn capability_passthrough_reaches_the_task() {
        struct Stoppable(AtomicBool);
        impl Task for Stoppable {
            fn start(&self) -> Result<TaskOutput> {
                while !self.0.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(TaskOutput::Null)
            }
            fn supports_stop(&self) -> bool {
                true
            }
            fn stop(&self) -> Result<()> {
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let threaded = ThreadedTask::new(Arc::new(Stoppable(AtomicBool::new(false))));
        threaded.start().unwrap();
        threaded.stop().unwrap();
        assert!(threaded.wait(None).unwrap());
        threaded.join().unwrap();

        let plain = ThreadedTask::new(FnTask::handle(|| Ok(TaskOutput::Null)));
        assert!(matches!(
            plain.terminate(),
            Err(TaskError::UnsupportedCapability { .. })
        ));
        plain.start().unwrap();
        plain.wait(None).unwrap();
        plain.join().unwrap();
    }
}

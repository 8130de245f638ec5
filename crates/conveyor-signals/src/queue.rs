//! Single-threaded callback queue.
//!
//! A [`CallbackQueue`] owns one worker thread and a channel of boxed
//! closures.  Everything submitted to the queue runs on that worker, in
//! strict submission order, which is what makes it usable as the single
//! writer for a component's mutable state: other threads never touch the
//! state, they enqueue closures that do.
//!
//! Three submission paths exist:
//!
//! - [`CallbackQueue::exec`] -- fire-and-forget.  Panics inside the closure
//!   are caught and logged; the submitter observes nothing.
//! - [`CallbackQueue::exec_blocking`] -- the caller waits for the closure
//!   to finish and receives its return value.  A panic inside the closure
//!   comes back as [`SignalError::CallbackPanicked`].  Calling this from
//!   the worker itself would deadlock and is rejected with
//!   [`SignalError::Reentrant`].
//! - [`CallbackQueue::proxy`] -- wrap a signal handler so that emissions
//!   are marshalled onto the worker instead of running on the emitting
//!   thread.
//!
//! The queue must be started before use and stopped exactly once; stopping
//! drains everything already enqueued, then parks the queue permanently.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::bus::{SignalHandler, SignalKind, handler};
use crate::error::{Result, SignalError};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

enum QueueState {
    Idle,
    Running {
        tx: Sender<Message>,
        worker: Option<JoinHandle<()>>,
        worker_id: ThreadId,
    },
    Stopped,
}

struct QueueInner {
    state: Mutex<QueueState>,
}

/// Single-threaded cooperative serialiser of closures.
///
/// Cheaply cloneable; all clones share the same worker.
#[derive(Clone)]
pub struct CallbackQueue {
    inner: Arc<QueueInner>,
}

impl CallbackQueue {
    /// Create a queue in the idle state.  Call [`CallbackQueue::start`]
    /// before submitting anything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::Idle),
            }),
        }
    }

    /// Spawn the worker thread.  Fails if the queue was already started or
    /// has been stopped.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        match &*state {
            QueueState::Idle => {}
            QueueState::Running { .. } => return Err(SignalError::AlreadyStarted),
            QueueState::Stopped => return Err(SignalError::Stopped),
        }

        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("conveyor-callbacks".to_string())
            .spawn(move || worker_loop(rx))
            .map_err(|_| SignalError::Disconnected)?;
        let worker_id = worker.thread().id();

        tracing::debug!("callback queue started");
        *state = QueueState::Running {
            tx,
            worker: Some(worker),
            worker_id,
        };
        Ok(())
    }

    /// Stop the queue: everything already enqueued still runs, then the
    /// worker exits and further submissions fail.
    pub fn stop(&self) -> Result<()> {
        let (tx, worker) = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, QueueState::Stopped) {
                QueueState::Running { tx, worker, .. } => (tx, worker),
                QueueState::Idle => {
                    *state = QueueState::Idle;
                    return Err(SignalError::NotStarted);
                }
                QueueState::Stopped => return Err(SignalError::Stopped),
            }
        };

        let _ = tx.send(Message::Shutdown);
        drop(tx);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("callback queue worker exited abnormally");
            }
        }
        tracing::debug!("callback queue stopped");
        Ok(())
    }

    /// True when called from the queue's own worker thread.
    pub fn is_inside(&self) -> bool {
        match &*self.state() {
            QueueState::Running { worker_id, .. } => thread::current().id() == *worker_id,
            _ => false,
        }
    }

    /// Enqueue a closure, fire-and-forget.
    pub fn exec<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Message::Run(Box::new(f)))
    }

    /// Enqueue a closure and wait for its return value.
    ///
    /// `timeout` bounds the wait: `None` blocks forever, `Some(d)` waits at
    /// most `d` (zero polls).  Rejected with [`SignalError::Reentrant`]
    /// when called from the worker itself.
    pub fn exec_blocking<R, F>(&self, f: F, timeout: Option<Duration>) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_inside() {
            return Err(SignalError::Reentrant);
        }

        let (result_tx, result_rx) = bounded(1);
        self.send(Message::Run(Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            let _ = result_tx.send(outcome);
        })))?;

        let outcome = match timeout {
            None => result_rx.recv().map_err(|_| SignalError::Disconnected)?,
            Some(limit) => result_rx.recv_timeout(limit).map_err(|err| match err {
                RecvTimeoutError::Timeout => SignalError::Timeout,
                RecvTimeoutError::Disconnected => SignalError::Disconnected,
            })?,
        };
        outcome.map_err(|_| SignalError::CallbackPanicked)
    }

    /// Wrap a signal handler so that deliveries are enqueued here instead
    /// of running on the emitting thread.
    ///
    /// The wrapper holds the original handler weakly, mirroring the bus's
    /// own retention rule; the caller anchors both.  If the queue is
    /// unavailable when a signal arrives, the delivery is logged and
    /// dropped.
    pub fn proxy<K, V>(&self, callback: &Arc<SignalHandler<K, V>>) -> Arc<SignalHandler<K, V>>
    where
        K: SignalKind,
        V: Clone + Send + Sync + 'static,
    {
        let callback = Arc::downgrade(callback);
        let queue = self.clone();
        handler(move |kind: K, value: &V| {
            let callback: Weak<SignalHandler<K, V>> = callback.clone();
            let value = value.clone();
            let submitted = queue.exec(move || {
                if let Some(callback) = callback.upgrade() {
                    callback(kind, &value);
                }
            });
            if let Err(err) = submitted {
                tracing::warn!(signal = ?kind, error = %err, "signal delivery dropped, callback queue unavailable");
            }
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        let tx = match &*self.state() {
            QueueState::Running { tx, .. } => tx.clone(),
            QueueState::Idle => return Err(SignalError::NotStarted),
            QueueState::Stopped => return Err(SignalError::Stopped),
        };
        tx.send(message).map_err(|_| SignalError::Disconnected)
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // State transitions are plain assignments; a poisoned guard still
        // holds a coherent value.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("queued callback panicked");
                }
            }
            Message::Shutdown => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

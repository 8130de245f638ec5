//! Bounded thread executor.
//!
//! [`ThreadExecutor`] runs tasks on dedicated worker threads, at most
//! `capacity` at a time.  `submit` never blocks: when every slot is taken
//! it fails with [`TaskError::NoFreeSlot`] and the caller decides what to
//! do (the scheduler postpones).  A slot can also be *reserved* ahead of a
//! submission decision with [`ThreadExecutor::reserve`]; dropping the
//! reservation unsubmitted releases the slot.
//!
//! The executor re-publishes every task's completion on its own bus as
//! `TaskCompleted`, exactly once per submitted task, so one subscription
//! covers the whole pool.  Slots are released by [`ThreadExecutor::complete`],
//! which joins the finished worker -- every successfully submitted task
//! must be completed exactly once.
//!
//! Internally a single lock protects the descriptor table and the
//! reservation counter; it is held for the duration of each public
//! operation, never across a join.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_signals::{SignalBus, SignalHandler, handler};

use crate::critical::CriticalSection;
use crate::error::{Result, TaskError};
use crate::task::{TaskHandle, TaskKey, TaskNotice};
use crate::threaded::{TaskSignal, ThreadedTask};

/// Pool-level signals, payload [`TaskNotice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolSignal {
    /// A submitted task finished; the notice carries its result.
    TaskCompleted,
}

struct PoolEntry {
    threaded: ThreadedTask,
    /// Anchors the per-task completion relay; the task bus holds it weakly.
    _relay: Arc<SignalHandler<TaskSignal, TaskNotice>>,
}

struct PoolState {
    running: HashMap<TaskKey, PoolEntry>,
    reserved: usize,
}

struct PoolInner {
    capacity: Option<usize>,
    state: CriticalSection<PoolState>,
    signals: SignalBus<PoolSignal, TaskNotice>,
}

/// Bounded worker pool for blocking tasks.
#[derive(Clone)]
pub struct ThreadExecutor {
    inner: Arc<PoolInner>,
}

impl ThreadExecutor {
    /// Create a pool.  `capacity` bounds concurrently running tasks;
    /// `None` means unbounded.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                state: CriticalSection::new(PoolState {
                    running: HashMap::new(),
                    reserved: 0,
                }),
                signals: SignalBus::new([PoolSignal::TaskCompleted]),
            }),
        }
    }

    /// The pool's completion bus.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<PoolSignal, TaskNotice> {
        &self.inner.signals
    }

    /// Configured slot bound.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Start a task on a fresh worker thread.
    ///
    /// Fails with [`TaskError::NoFreeSlot`] when the pool is full and with
    /// [`TaskError::AlreadyRunning`] when the task is already tracked.
    pub fn submit(&self, task: TaskHandle) -> Result<()> {
        let mut state = self.inner.state.enter()?;
        if !free_slot(&state, self.inner.capacity) {
            return Err(TaskError::NoFreeSlot);
        }
        spawn_locked(&self.inner, &mut state, task)
    }

    /// Reserve a slot for a later submission decision.
    ///
    /// The reservation counts against capacity until it is either consumed
    /// by [`SlotReservation::submit`] or dropped.
    pub fn reserve(&self) -> Result<SlotReservation> {
        let mut state = self.inner.state.enter()?;
        if !free_slot(&state, self.inner.capacity) {
            return Err(TaskError::NoFreeSlot);
        }
        state.reserved += 1;
        Ok(SlotReservation {
            inner: Arc::clone(&self.inner),
            consumed: false,
        })
    }

    /// Finalize a finished task: join its worker and release the slot.
    pub fn complete(&self, task: &TaskHandle) -> Result<()> {
        let entry = {
            let mut state = self.inner.state.enter()?;
            state
                .running
                .remove(&TaskKey::of(task))
                .ok_or(TaskError::NoSuchTask)?
        };
        entry.threaded.wait(None)?;
        entry.threaded.join()?;
        tracing::debug!(task = ?TaskKey::of(task), "executor slot released");
        Ok(())
    }

    /// Block up to `timeout` for a submitted task to finish.
    ///
    /// Returns `false` on timeout.  `None` blocks forever,
    /// `Some(Duration::ZERO)` polls.
    pub fn wait(&self, task: &TaskHandle, timeout: Option<Duration>) -> Result<bool> {
        let threaded = self.lookup(task)?;
        threaded.wait(timeout)
    }

    /// Snapshot of the currently started tasks.
    pub fn tasks(&self) -> Result<Vec<TaskHandle>> {
        let state = self.inner.state.enter()?;
        Ok(state
            .running
            .values()
            .map(|entry| Arc::clone(entry.threaded.task()))
            .collect())
    }

    /// Number of tasks currently occupying a slot.
    pub fn running_count(&self) -> Result<usize> {
        Ok(self.inner.state.enter()?.running.len())
    }

    /// Ask a running task to stop gracefully.
    pub fn stop_task(&self, task: &TaskHandle) -> Result<()> {
        self.lookup(task)?.stop()
    }

    /// Ask a running task to stop at all costs.
    pub fn terminate_task(&self, task: &TaskHandle) -> Result<()> {
        self.lookup(task)?.terminate()
    }

    fn lookup(&self, task: &TaskHandle) -> Result<ThreadedTask> {
        let state = self.inner.state.enter()?;
        state
            .running
            .get(&TaskKey::of(task))
            .map(|entry| entry.threaded.clone())
            .ok_or(TaskError::NoSuchTask)
    }
}

/// A capacity slot held ahead of a submission decision.
///
/// Consumed by [`SlotReservation::submit`]; released on drop otherwise.
pub struct SlotReservation {
    inner: Arc<PoolInner>,
    consumed: bool,
}

impl SlotReservation {
    /// Submit a task into the reserved slot.
    pub fn submit(mut self, task: TaskHandle) -> Result<()> {
        let mut state = self.inner.state.enter()?;
        state.reserved -= 1;
        self.consumed = true;
        spawn_locked(&self.inner, &mut state, task)
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.consumed {
            if let Ok(mut state) = self.inner.state.enter() {
                state.reserved = state.reserved.saturating_sub(1);
            }
        }
    }
}

fn free_slot(state: &PoolState, capacity: Option<usize>) -> bool {
    capacity.is_none_or(|limit| state.running.len() + state.reserved < limit)
}

fn spawn_locked(inner: &Arc<PoolInner>, state: &mut PoolState, task: TaskHandle) -> Result<()> {
    let key = TaskKey::of(&task);
    if state.running.contains_key(&key) {
        return Err(TaskError::AlreadyRunning);
    }

    let threaded = ThreadedTask::new(Arc::clone(&task));
    let pool_signals = inner.signals.clone();
    let relay = handler(move |_kind, notice: &TaskNotice| {
        if let Err(err) = pool_signals.emit(PoolSignal::TaskCompleted, notice.clone()) {
            tracing::error!(error = %err, "failed to forward task completion");
        }
    });
    threaded.signals().subscribe(TaskSignal::Completed, &relay)?;
    threaded.start()?;

    state.running.insert(
        key,
        PoolEntry {
            threaded,
            _relay: relay,
        },
    );
    tracing::debug!(task = ?key, "task submitted to thread pool");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnTask, TaskOutput, TaskResult};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;

    fn gated_task(gate: &Arc<AtomicBool>) -> TaskHandle {
        let gate = Arc::clone(gate);
        FnTask::handle(move || {
            while !gate.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            Ok(TaskOutput::Null)
        })
    }

    #[test]
    fn capacity_is_enforced_without_blocking() {
        let pool = ThreadExecutor::new(Some(1));
        let gate = Arc::new(AtomicBool::new(false));

        let first = gated_task(&gate);
        pool.submit(Arc::clone(&first)).unwrap();

        let second = gated_task(&gate);
        assert!(matches!(
            pool.submit(Arc::clone(&second)),
            Err(TaskError::NoFreeSlot)
        ));

        gate.store(true, Ordering::SeqCst);
        assert!(pool.wait(&first, None).unwrap());
        pool.complete(&first).unwrap();

        pool.submit(Arc::clone(&second)).unwrap();
        assert!(pool.wait(&second, None).unwrap());
        pool.complete(&second).unwrap();
    }

    #[test]
    fn reservation_holds_and_releases_a_slot() {
        let pool = ThreadExecutor::new(Some(1));

        let slot = pool.reserve().unwrap();
        assert!(matches!(pool.reserve(), Err(TaskError::NoFreeSlot)));
        let probe = FnTask::handle(|| Ok(TaskOutput::Null));
        assert!(matches!(
            pool.submit(Arc::clone(&probe)),
            Err(TaskError::NoFreeSlot)
        ));

        drop(slot);
        let slot = pool.reserve().unwrap();
        let task = FnTask::handle(|| Ok(json!(1)));
        slot.submit(Arc::clone(&task)).unwrap();
        assert!(pool.wait(&task, None).unwrap());
        pool.complete(&task).unwrap();
    }

    #[test]
    fn one_completion_signal_per_task() {
        let pool = ThreadExecutor::new(None);
        let completions = Arc::new(AtomicU32::new(0));

        let counter = {
            let completions = Arc::clone(&completions);
            handler(move |_, notice: &TaskNotice| {
                assert!(notice.result.is_some());
                completions.fetch_add(1, Ordering::SeqCst);
            })
        };
        pool.signals()
            .subscribe(PoolSignal::TaskCompleted, &counter)
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let task = FnTask::handle(move || Ok(json!(i)));
            pool.submit(Arc::clone(&task)).unwrap();
            tasks.push(task);
        }
        for task in &tasks {
            assert!(pool.wait(task, None).unwrap());
            pool.complete(task).unwrap();
        }
        assert_eq!(completions.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failures_flow_through_the_completion_notice() {
        let pool = ThreadExecutor::new(None);
        let outcome = Arc::new(Mutex::new(None));

        let sink = {
            let outcome = Arc::clone(&outcome);
            handler(move |_, notice: &TaskNotice| {
                *outcome.lock().unwrap() = notice.result.clone();
            })
        };
        pool.signals()
            .subscribe(PoolSignal::TaskCompleted, &sink)
            .unwrap();

        let task = FnTask::handle(|| Err(TaskError::failed("broken")));
        pool.submit(Arc::clone(&task)).unwrap();
        assert!(pool.wait(&task, None).unwrap());
        pool.complete(&task).unwrap();

        match outcome.lock().unwrap().clone() {
            Some(TaskResult::Failed(TaskError::Failed { reason })) => {
                assert_eq!(reason, "broken");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let pool = ThreadExecutor::new(None);
        let gate = Arc::new(AtomicBool::new(false));
        let task = gated_task(&gate);

        pool.submit(Arc::clone(&task)).unwrap();
        assert!(matches!(
            pool.submit(Arc::clone(&task)),
            Err(TaskError::AlreadyRunning)
        ));

        gate.store(true, Ordering::SeqCst);
        assert!(pool.wait(&task, None).unwrap());
        pool.complete(&task).unwrap();
        assert!(matches!(pool.complete(&task), Err(TaskError::NoSuchTask)));
    }

    #[test]
    fn tasks_snapshot_reflects_running_set() {
        let pool = ThreadExecutor::new(None);
        let gate = Arc::new(AtomicBool::new(false));
        let task = gated_task(&gate);

        assert!(pool.tasks().unwrap().is_empty());
        pool.submit(Arc::clone(&task)).unwrap();
        assert_eq!(pool.tasks().unwrap().len(), 1);
        assert_eq!(pool.running_count().unwrap(), 1);

        gate.store(true, Ordering::SeqCst);
        pool.wait(&task, None).unwrap();
        pool.complete(&task).unwrap();
        assert!(pool.tasks().unwrap().is_empty());
    }
}

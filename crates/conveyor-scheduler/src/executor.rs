//! Scheduler executor -- the decision engine.
//!
//! [`SchedulerExecutor`] combines the callback queue, the postpone queue
//! and the thread pool into the single place that admits, postpones,
//! drops, expires, starts and completes records.  Every public entry
//! point hops onto the callback-queue worker; the descriptor table and
//! the postpone queue are only ever touched from there, so the decision
//! logic itself runs single-threaded.
//!
//! A submitted record moves `Submitted -> {Started | Pending | terminal}`
//! and `Pending -> Started -> terminal`, where terminal is one of
//! completed, dropped or expired -- announced as exactly one lifecycle
//! signal, after which the descriptor (and with it the record) is gone.
//!
//! # Shutdown
//!
//! Stopping a scheduler correctly is a strict sequence; skipping a step
//! races new work into a draining queue:
//!
//! 1. unsubscribe every source (the facade's job),
//! 2. [`SchedulerExecutor::cancel_postponed_tasks`],
//! 3. [`SchedulerExecutor::stop_running_tasks`],
//! 4. [`SchedulerExecutor::await_tasks`],
//!
//! and only then stop the callback queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use conveyor_signals::{CallbackQueue, SignalBus, SignalHandler, handler};
use conveyor_tasks::{
    CriticalSection, PoolSignal, SlotReservation, TaskError, TaskHandle, TaskKey, TaskNotice,
    ThreadExecutor,
};

use crate::error::{Result, SchedulerError};
use crate::queue::{PostponeQueue, QueueSignal};
use crate::record::{PostponePolicy, RecordHandle};

/// Lifecycle signals of the scheduler, payload [`RecordHandle`].
///
/// The executor emits the five `Task*` outcomes; the facade re-publishes
/// them verbatim and adds `TaskScheduled` for the uniform incoming
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerSignal {
    /// A record arrived from some source.
    TaskScheduled,
    /// The record was discarded and will not start.
    TaskDropped,
    /// The record was queued and will start later.
    TaskPostponed,
    /// The record's deadline passed before it could start.
    TaskExpired,
    /// The record's task started on a pool worker.
    TaskStarted,
    /// The record's task finished; the record is gone.
    TaskCompleted,
}

/// State of a submitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Registered, decision pending.
    Submitted,
    /// Waiting in the postpone queue.
    Pending,
    /// Running on a pool worker.
    Started,
}

struct TaskDescriptor {
    record: RecordHandle,
    state: TaskState,
}

struct ExecutorInner {
    queue: CallbackQueue,
    pool: ThreadExecutor,
    postponed: PostponeQueue,
    tasks: CriticalSection<HashMap<TaskKey, TaskDescriptor>>,
    signals: SignalBus<SchedulerSignal, RecordHandle>,
}

/// The scheduling decision engine.
#[derive(Clone)]
pub struct SchedulerExecutor {
    inner: Arc<ExecutorInner>,
    // Anchors for the wiring below; every bus holds its subscribers
    // weakly, so the owner keeps the strong references.
    _on_completed: Arc<SignalHandler<PoolSignal, TaskNotice>>,
    _on_completed_proxy: Arc<SignalHandler<PoolSignal, TaskNotice>>,
    _on_postponed: Arc<SignalHandler<QueueSignal, RecordHandle>>,
    _on_dropped: Arc<SignalHandler<QueueSignal, RecordHandle>>,
    _on_expired: Arc<SignalHandler<QueueSignal, RecordHandle>>,
}

impl SchedulerExecutor {
    /// Create an executor over a pool of `capacity` worker slots
    /// (`None` = unbounded).  The callback queue is created stopped; the
    /// owning facade starts it.
    pub fn new(capacity: Option<usize>) -> Result<Self> {
        let inner = Arc::new(ExecutorInner {
            queue: CallbackQueue::new(),
            pool: ThreadExecutor::new(capacity),
            postponed: PostponeQueue::new(),
            tasks: CriticalSection::new(HashMap::new()),
            signals: SignalBus::new([
                SchedulerSignal::TaskDropped,
                SchedulerSignal::TaskPostponed,
                SchedulerSignal::TaskExpired,
                SchedulerSignal::TaskStarted,
                SchedulerSignal::TaskCompleted,
            ]),
        });

        // Pool completions are marshalled onto the queue worker, where the
        // descriptor is retired and postponed work re-examined.
        let on_completed = {
            let weak = Arc::downgrade(&inner);
            handler(move |_kind, notice: &TaskNotice| {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(err) = ExecutorInner::handle_completed(&inner, notice) {
                    tracing::error!(error = %err, "task completion handling failed");
                }
            })
        };
        let on_completed_proxy = inner.queue.proxy(&on_completed);
        inner
            .pool
            .signals()
            .subscribe(PoolSignal::TaskCompleted, &on_completed_proxy)?;

        // The postpone queue announces its own verdicts; forward them as
        // scheduler lifecycle signals, retiring descriptors on the
        // terminal ones.  These run synchronously on the queue worker.
        let on_postponed = {
            let weak = Arc::downgrade(&inner);
            handler(move |_kind, record: &RecordHandle| {
                let Some(inner) = weak.upgrade() else { return };
                inner.forward(SchedulerSignal::TaskPostponed, record, false);
            })
        };
        inner
            .postponed
            .signals()
            .subscribe(QueueSignal::Postponed, &on_postponed)?;

        let on_dropped = {
            let weak = Arc::downgrade(&inner);
            handler(move |_kind, record: &RecordHandle| {
                let Some(inner) = weak.upgrade() else { return };
                inner.forward(SchedulerSignal::TaskDropped, record, true);
            })
        };
        inner
            .postponed
            .signals()
            .subscribe(QueueSignal::Dropped, &on_dropped)?;

        let on_expired = {
            let weak = Arc::downgrade(&inner);
            handler(move |_kind, record: &RecordHandle| {
                let Some(inner) = weak.upgrade() else { return };
                inner.forward(SchedulerSignal::TaskExpired, record, true);
            })
        };
        inner
            .postponed
            .signals()
            .subscribe(QueueSignal::Expired, &on_expired)?;

        Ok(Self {
            inner,
            _on_completed: on_completed,
            _on_completed_proxy: on_completed_proxy,
            _on_postponed: on_postponed,
            _on_dropped: on_dropped,
            _on_expired: on_expired,
        })
    }

    /// The executor's lifecycle bus.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<SchedulerSignal, RecordHandle> {
        &self.inner.signals
    }

    /// The callback queue driving this executor.
    #[must_use]
    pub fn queue(&self) -> &CallbackQueue {
        &self.inner.queue
    }

    /// Submit a record, fire-and-forget.  Rejections surface in the log
    /// and, for policy outcomes, as lifecycle signals.
    pub fn submit(&self, record: RecordHandle) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec(move || {
            let Some(inner) = weak.upgrade() else { return };
            if let Err(err) = inner.submit_on_worker(&record) {
                tracing::error!(error = %err, "record submission failed");
            }
        })?;
        Ok(())
    }

    /// Submit a record and wait for the admission decision; typed errors
    /// (such as a double-submitted task) come back to the caller.
    pub fn submit_blocking(&self, record: RecordHandle) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.submit_on_worker(&record),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }

    /// Submit from a callback that is already running on the queue worker.
    pub(crate) fn submit_local(&self, record: &RecordHandle) -> Result<()> {
        debug_assert!(self.inner.queue.is_inside());
        self.inner.submit_on_worker(record)
    }

    /// Drop every postponed record, announcing each as dropped.
    /// Shutdown step 2.
    pub fn cancel_postponed_tasks(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.cancel_postponed_on_worker(),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }

    /// Ask every started task that supports it to stop (or terminate).
    /// Tasks with neither capability are left to run out.  Shutdown
    /// step 3.
    pub fn stop_running_tasks(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.stop_running_on_worker(),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }

    /// Block until no task is running or postponed, interleaving pool
    /// waits with postponed re-admission passes.  `task_timeout` bounds
    /// each individual task wait; exceeding it fails with
    /// [`SchedulerError::AwaitTimeout`].  Shutdown step 4; must not be
    /// called from the queue worker.
    pub fn await_tasks(&self, task_timeout: Option<Duration>) -> Result<()> {
        let mut busy = self.has_tasks()?;
        while busy {
            for task in self.inner.pool.tasks()? {
                match self.inner.pool.wait(&task, task_timeout) {
                    Ok(true) => {}
                    Ok(false) => return Err(SchedulerError::AwaitTimeout),
                    // The task completed between the snapshot and the wait.
                    Err(TaskError::NoSuchTask) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            // Completions enqueued by the waits above drain before this
            // pass, so late arrivals from stop callbacks get re-admitted.
            let weak = Arc::downgrade(&self.inner);
            self.inner.queue.exec_blocking(
                move || match weak.upgrade() {
                    Some(inner) => inner.run_postponed(),
                    None => Err(SchedulerError::SchedulerGone),
                },
                None,
            )??;

            busy = self.has_tasks()?;
        }
        Ok(())
    }

    /// Snapshot of tasks currently in the started state.
    pub fn running_tasks(&self) -> Result<Vec<TaskHandle>> {
        self.tasks_where(|state| state == TaskState::Started)
    }

    /// Snapshot of tasks submitted but not (yet) started.
    pub fn pending_tasks(&self) -> Result<Vec<TaskHandle>> {
        self.tasks_where(|state| state != TaskState::Started)
    }

    fn tasks_where(&self, filter: fn(TaskState) -> bool) -> Result<Vec<TaskHandle>> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec_blocking(
            move || {
                let Some(inner) = weak.upgrade() else {
                    return Err(SchedulerError::SchedulerGone);
                };
                let tasks = inner.tasks.enter()?;
                Ok(tasks
                    .values()
                    .filter(|descriptor| filter(descriptor.state))
                    .map(|descriptor| Arc::clone(descriptor.record.task()))
                    .collect())
            },
            None,
        )?
    }

    fn has_tasks(&self) -> Result<bool> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => {
                    Ok(!inner.postponed.is_empty()? || inner.pool.running_count()? > 0)
                }
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }
}

impl ExecutorInner {
    /// The §submit algorithm; runs on the queue worker.
    fn submit_on_worker(&self, record: &RecordHandle) -> Result<()> {
        if record.is_expired(Utc::now()) {
            tracing::debug!(group = ?record.group_id(), "record expired at submission");
            self.signals
                .emit(SchedulerSignal::TaskExpired, record.clone())?;
            return Ok(());
        }

        let key = TaskKey::of(record.task());
        {
            let mut tasks = self.tasks.enter()?;
            if tasks.contains_key(&key) {
                return Err(SchedulerError::DuplicateTask);
            }
            tasks.insert(
                key,
                TaskDescriptor {
                    record: record.clone(),
                    state: TaskState::Submitted,
                },
            );
        }
        tracing::debug!(task = ?key, group = ?record.group_id(), "record submitted");

        if !self.record_eligible(record)? {
            return self.postpone_record(record);
        }

        match self.pool.reserve() {
            Ok(slot) => self.start_record(record, slot),
            Err(TaskError::NoFreeSlot) => self.postpone_record(record),
            Err(err) => Err(err.into()),
        }
    }

    /// Group eligibility: with a group and a positive bound, the count of
    /// started records of that group must stay below the bound.
    fn record_eligible(&self, record: &RecordHandle) -> Result<bool> {
        let Some(group_id) = record.group_id() else {
            return Ok(true);
        };
        let limit = record.simultaneous_runs();
        if limit == 0 {
            return Ok(true);
        }

        let tasks = self.tasks.enter()?;
        let started = tasks
            .values()
            .filter(|descriptor| {
                descriptor.state == TaskState::Started
                    && descriptor.record.group_id() == Some(group_id)
            })
            .count();
        Ok(started < limit as usize)
    }

    fn start_record(&self, record: &RecordHandle, slot: SlotReservation) -> Result<()> {
        let key = TaskKey::of(record.task());
        {
            let mut tasks = self.tasks.enter()?;
            let descriptor = tasks.get_mut(&key).ok_or(TaskError::NoSuchTask)?;
            descriptor.state = TaskState::Started;
        }
        slot.submit(Arc::clone(record.task()))?;
        tracing::debug!(task = ?key, "record started");
        self.signals
            .emit(SchedulerSignal::TaskStarted, record.clone())?;
        Ok(())
    }

    fn postpone_record(&self, record: &RecordHandle) -> Result<()> {
        let key = TaskKey::of(record.task());
        if record.postpone_policy() == PostponePolicy::Drop {
            self.tasks.enter()?.remove(&key);
            tracing::debug!(task = ?key, "record dropped by policy");
            self.signals
                .emit(SchedulerSignal::TaskDropped, record.clone())?;
            return Ok(());
        }

        {
            let mut tasks = self.tasks.enter()?;
            let descriptor = tasks.get_mut(&key).ok_or(TaskError::NoSuchTask)?;
            descriptor.state = TaskState::Pending;
        }
        // The queue announces the actual outcome (postponed, or a
        // dropped/expired replacement per its policy rules); the forward
        // handlers turn that into the lifecycle signal.
        self.postponed.postpone(record.clone())
    }

    /// Forward a postpone-queue verdict as a lifecycle signal, retiring
    /// the descriptor for terminal verdicts.
    fn forward(&self, kind: SchedulerSignal, record: &RecordHandle, terminal: bool) {
        if terminal {
            match self.tasks.enter() {
                Ok(mut tasks) => {
                    tasks.remove(&TaskKey::of(record.task()));
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to retire a record descriptor");
                }
            }
        }
        if let Err(err) = self.signals.emit(kind, record.clone()) {
            tracing::error!(signal = ?kind, error = %err, "lifecycle signal emission failed");
        }
    }

    /// Runs on the queue worker when a pool task finishes.
    fn handle_completed(inner: &Arc<Self>, notice: &TaskNotice) -> Result<()> {
        let task = &notice.task;
        inner.pool.wait(task, None)?;
        inner.pool.complete(task)?;

        let descriptor = inner
            .tasks
            .enter()?
            .remove(&TaskKey::of(task))
            .ok_or(TaskError::NoSuchTask)?;
        tracing::debug!(task = ?TaskKey::of(task), "record completed");
        inner
            .signals
            .emit(SchedulerSignal::TaskCompleted, descriptor.record)?;

        // The freed slot may admit postponed work; schedule a pass after
        // the current batch of queued callbacks.
        let weak = Arc::downgrade(inner);
        inner.queue.exec(move || {
            let Some(inner) = weak.upgrade() else { return };
            if let Err(err) = inner.run_postponed() {
                tracing::error!(error = %err, "postponed pass failed");
            }
        })?;
        Ok(())
    }

    /// Start eligible postponed records while slots are free; the sole
    /// place postponed work is re-examined.
    fn run_postponed(&self) -> Result<()> {
        loop {
            let slot = match self.pool.reserve() {
                Ok(slot) => slot,
                Err(TaskError::NoFreeSlot) => break,
                Err(err) => return Err(err.into()),
            };
            let next = self.postponed.next_record(|record| {
                self.record_eligible(record).unwrap_or_else(|err| {
                    tracing::error!(error = %err, "eligibility check failed");
                    false
                })
            })?;
            match next {
                Some(record) => self.start_record(&record, slot)?,
                None => break,
            }
        }
        Ok(())
    }

    fn cancel_postponed_on_worker(&self) -> Result<()> {
        while let Some(record) = self.postponed.next_record(|_| true)? {
            self.tasks.enter()?.remove(&TaskKey::of(record.task()));
            self.signals.emit(SchedulerSignal::TaskDropped, record)?;
        }
        tracing::debug!("postponed records cancelled");
        Ok(())
    }

    fn stop_running_on_worker(&self) -> Result<()> {
        let started: Vec<TaskHandle> = {
            let tasks = self.tasks.enter()?;
            tasks
                .values()
                .filter(|descriptor| descriptor.state == TaskState::Started)
                .map(|descriptor| Arc::clone(descriptor.record.task()))
                .collect()
        };

        for task in started {
            let key = TaskKey::of(&task);
            if task.supports_stop() {
                if let Err(err) = self.pool.stop_task(&task) {
                    tracing::warn!(task = ?key, error = %err, "stop request failed");
                }
            } else if task.supports_terminate() {
                if let Err(err) = self.pool.terminate_task(&task) {
                    tracing::warn!(task = ?key, error = %err, "terminate request failed");
                }
            } else {
                tracing::warn!(task = ?key, "task supports neither stop nor terminate; waiting it out");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

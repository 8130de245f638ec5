//! Chained task source: dependency-aware execution over a scheduler.
//!
//! Tasks register under an *api id* in a [`ChainRegistry`], declaring the
//! ids that must run before them.  [`ChainedSource::execute`] expands one
//! logical request into its transitive dependency closure, orders it so
//! every dependency precedes its dependents, and submits the ids one by
//! one as drop-policy records with an at-most-one-in-flight group bound
//! (`"<source-uid>--<api-id>"`, `simultaneous_runs = 1`).  A scheduler
//! answer other than started fails the whole request -- if the scheduler
//! is full, the chain fails fast rather than queue indefinitely.
//!
//! Progress is recorded in an append-only [`Datalog`] of
//! [`ChainLogEntry`]s: `Started` when the scheduler accepts an id,
//! `Completed` (with the result) when the task itself calls
//! [`ChainedTaskLog::save_result`].  A task that needs a dependency's
//! result blocks on [`ChainedTaskLog::wait_for`], which watches the same
//! log.  Ids that already appear in the log are not run again.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conveyor_signals::{CallbackQueue, SignalBus, SignalHandler, relay};
use conveyor_tasks::{Datalog, TaskError, TaskHandle, TaskResult};

use crate::error::{Result, SchedulerError};
use crate::executor::SchedulerSignal;
use crate::record::{
    PostponePolicy, RecordHandle, ScheduleRecord, ScheduleSource, SchedulerFeedback, SourceSignal,
};
use crate::scheduler::Scheduler;
use crate::sources::tracker::TrackerSource;

/// State of a chained task as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    /// The scheduler accepted the record and the task is in flight.
    Started,
    /// The task recorded its result.
    Completed,
}

/// One immutable event in the chain log.
#[derive(Debug, Clone)]
pub struct ChainLogEntry {
    api_id: String,
    uid: Uuid,
    event_time: DateTime<Utc>,
    state: ChainState,
    result: Option<TaskResult>,
}

impl ChainLogEntry {
    fn new(api_id: &str, uid: Uuid, state: ChainState, result: Option<TaskResult>) -> Self {
        Self {
            api_id: api_id.to_string(),
            uid,
            event_time: Utc::now(),
            state,
            result,
        }
    }

    /// The task's api id.
    #[must_use]
    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    /// The task instance this event belongs to.
    #[must_use]
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// When the event was observed.
    #[must_use]
    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    /// The recorded state.
    #[must_use]
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// The recorded result, for `Completed` entries that carry one.
    #[must_use]
    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }
}

/// Builds chained tasks and declares what must run before them.
pub trait ChainedTaskFactory: Send + Sync + 'static {
    /// Api ids that must be started before this task.
    fn dependencies(&self) -> Vec<String>;

    /// Build a task instance.  The handed [`ChainedTaskLog`] is the task's
    /// window into the chain: `wait_for` dependencies, `save_result` when
    /// done.
    fn create(&self, log: ChainedTaskLog) -> Result<TaskHandle>;
}

/// Factory registry keyed by api id.
pub struct ChainRegistry {
    factories: DashMap<String, Arc<dyn ChainedTaskFactory>>,
}

impl ChainRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            factories: DashMap::new(),
        })
    }

    /// Register a factory under `api_id`.
    pub fn register(
        &self,
        api_id: impl Into<String>,
        factory: Arc<dyn ChainedTaskFactory>,
    ) -> Result<()> {
        let api_id = api_id.into();
        if self.factories.contains_key(&api_id) {
            return Err(SchedulerError::DuplicateApi { api_id });
        }
        self.factories.insert(api_id, factory);
        Ok(())
    }

    /// Look a factory up.
    pub fn get(&self, api_id: &str) -> Result<Arc<dyn ChainedTaskFactory>> {
        self.factories
            .get(api_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SchedulerError::UnknownApi {
                api_id: api_id.to_string(),
            })
    }
}

/// A chained task's window into the chain log.
#[derive(Clone)]
pub struct ChainedTaskLog {
    datalog: Datalog<ChainLogEntry>,
    api_id: String,
    uid: Uuid,
}

impl ChainedTaskLog {
    /// The api id of the task this log handle was created for.
    #[must_use]
    pub fn api_id(&self) -> &str {
        &self.api_id
    }

    /// The task instance identifier.
    #[must_use]
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// The underlying log.
    #[must_use]
    pub fn datalog(&self) -> &Datalog<ChainLogEntry> {
        &self.datalog
    }

    /// Record this task's completion, with its result.
    ///
    /// Dependants blocked in [`ChainedTaskLog::wait_for`] wake on the
    /// appended entry; completion order is log-append order.
    ///
    /// Returns a [`TaskError`] so it can be called with `?` from a task's
    /// own `start`.
    pub fn save_result(&self, result: TaskResult) -> conveyor_tasks::Result<()> {
        self.datalog.append(ChainLogEntry::new(
            &self.api_id,
            self.uid,
            ChainState::Completed,
            Some(result),
        ))
    }

    /// Block until the log records a completion for `api_id`, returning
    /// its result.  `None` blocks forever; exceeding a timeout is a task
    /// failure.
    pub fn wait_for(
        &self,
        api_id: &str,
        timeout: Option<Duration>,
    ) -> conveyor_tasks::Result<Option<TaskResult>> {
        let entry = self.datalog.wait_matching(
            |entry| entry.api_id == api_id && entry.state == ChainState::Completed,
            timeout,
        )?;
        match entry {
            Some(entry) => Ok(entry.result),
            None => Err(TaskError::failed(format!(
                "timed out waiting for task `{api_id}` to complete"
            ))),
        }
    }
}

/// Dependency-resolving schedule source.
pub struct ChainedSource {
    queue: CallbackQueue,
    source_uid: String,
    registry: Arc<ChainRegistry>,
    datalog: Datalog<ChainLogEntry>,
    tracker: Arc<TrackerSource>,
    signals: SignalBus<SourceSignal, RecordHandle>,
    weak_self: Weak<ChainedSource>,
    /// Re-emits the tracker's submissions on this source's own bus, so a
    /// scheduler subscribed here sees them.
    _tracker_relay: Arc<SignalHandler<SourceSignal, RecordHandle>>,
}

impl ChainedSource {
    /// Create a source over `registry`, logging into `datalog`.
    #[must_use]
    pub fn new(datalog: Datalog<ChainLogEntry>, registry: Arc<ChainRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let signals = SignalBus::new([SourceSignal::TaskScheduled]);
            let tracker = TrackerSource::new();
            let tracker_relay = relay(&signals, SourceSignal::TaskScheduled);
            if let Err(err) = tracker
                .schedule_signals()
                .subscribe(SourceSignal::TaskScheduled, &tracker_relay)
            {
                tracing::error!(error = %err, "tracker relay subscription failed");
            }

            Self {
                queue: CallbackQueue::new(),
                source_uid: Uuid::new_v4().to_string(),
                registry,
                datalog,
                tracker,
                signals,
                weak_self: weak.clone(),
                _tracker_relay: tracker_relay,
            }
        })
    }

    /// The chain log.
    #[must_use]
    pub fn datalog(&self) -> &Datalog<ChainLogEntry> {
        &self.datalog
    }

    /// The factory registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    /// Start this source's own control loop.
    pub fn start(&self) -> Result<()> {
        self.queue.start()?;
        Ok(())
    }

    /// Stop the control loop.
    pub fn stop(&self) -> Result<()> {
        self.queue.stop()?;
        Ok(())
    }

    /// Execute `api_id` and its transitive dependencies, in dependency
    /// order, blocking until every record has been accepted.
    pub fn execute(&self, api_id: &str) -> Result<()> {
        let this = self.weak_self.upgrade().ok_or(SchedulerError::SourceGone)?;
        let api_id = api_id.to_string();
        self.queue
            .exec_blocking(move || this.execution_row(&api_id), None)?
    }

    /// Latest log entry for `api_id`, if any.
    pub fn last_entry(&self, api_id: &str) -> Result<Option<ChainLogEntry>> {
        Ok(self.datalog.find(|entry| entry.api_id() == api_id, true)?)
    }

    /// Expand and dispatch; runs on this source's queue worker.
    fn execution_row(&self, api_id: &str) -> Result<()> {
        debug_assert!(self.queue.is_inside());

        if let Some(entry) = self.last_entry(api_id)? {
            if entry.state() == ChainState::Started {
                return Err(SchedulerError::ChainActive {
                    api_id: api_id.to_string(),
                });
            }
        }

        let mut row: Vec<String> = vec![api_id.to_string()];
        let mut pending: Vec<Vec<String>> = vec![self.registry.get(api_id)?.dependencies()];

        while !pending.is_empty() {
            let mut next_level: BTreeSet<String> = BTreeSet::new();

            for dependencies in std::mem::take(&mut pending) {
                let required = self.skip_logged(dependencies.into_iter().collect())?;

                if required.iter().any(|id| row.contains(id)) {
                    return Err(SchedulerError::DependencyCycle {
                        api_id: api_id.to_string(),
                    });
                }

                for id in &required {
                    row.insert(0, id.clone());
                }
                next_level.extend(required);
            }

            pending = next_level
                .iter()
                .map(|id| self.registry.get(id).map(|factory| factory.dependencies()))
                .collect::<Result<Vec<_>>>()?;
        }

        tracing::debug!(api_id, order = ?row, "dependency expansion resolved");
        for id in &row {
            self.dispatch(id)?;
        }
        Ok(())
    }

    /// Submit one id through the tracker and log the acceptance.
    fn dispatch(&self, api_id: &str) -> Result<()> {
        let factory = self.registry.get(api_id)?;
        let uid = Uuid::new_v4();
        let task = factory.create(ChainedTaskLog {
            datalog: self.datalog.clone(),
            api_id: api_id.to_string(),
            uid,
        })?;

        let source: Arc<dyn ScheduleSource> =
            self.weak_self.upgrade().ok_or(SchedulerError::SourceGone)?;
        let record = ScheduleRecord::new(task, source)
            .with_group_id(format!("{}--{}", self.source_uid, api_id))
            .with_simultaneous_runs(1)
            .with_postpone_policy(PostponePolicy::Drop)
            .into_handle();

        match self.tracker.wait_response(record)? {
            SchedulerSignal::TaskStarted => {
                self.datalog
                    .append(ChainLogEntry::new(api_id, uid, ChainState::Started, None))?;
                tracing::info!(api_id, %uid, "chained task started");
                Ok(())
            }
            outcome => Err(SchedulerError::RecordRefused {
                api_id: api_id.to_string(),
                outcome: format!("{outcome:?}"),
            }),
        }
    }

    /// Drop ids that already appear in the log (started or completed);
    /// finished dependencies are not re-run.
    fn skip_logged(&self, ids: BTreeSet<String>) -> Result<BTreeSet<String>> {
        let mut remaining = ids;
        for entry in self.datalog.iterate()? {
            remaining.remove(entry.api_id());
        }
        Ok(remaining)
    }
}

impl ScheduleSource for ChainedSource {
    fn schedule_signals(&self) -> &SignalBus<SourceSignal, RecordHandle> {
        &self.signals
    }

    fn scheduler_feedback(&self, scheduler: &Scheduler, feedback: SchedulerFeedback) {
        self.tracker.scheduler_feedback(scheduler, feedback);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Scheduler facade.
//!
//! [`Scheduler`] is the thin surface the rest of the world talks to.  It
//! subscribes schedule sources, funnels their records into the decision
//! engine through the callback queue, and re-publishes the engine's five
//! lifecycle signals verbatim -- plus a uniform `TaskScheduled` for every
//! incoming record, independent of which source produced it.
//!
//! Sources are held weakly: a source that is dropped elsewhere simply
//! stops producing and its table entry is pruned.

use std::sync::{Arc, Weak};

use conveyor_signals::{SignalBus, SignalHandler, handler, relay};
use conveyor_tasks::CriticalSection;

use crate::error::{Result, SchedulerError};
use crate::executor::{SchedulerExecutor, SchedulerSignal};
use crate::record::{RecordHandle, ScheduleSource, SchedulerFeedback, SourceSignal};

struct SourceEntry {
    source: Weak<dyn ScheduleSource>,
    /// Identity of the source allocation.
    key: usize,
    /// The proxied handler registered on the source's bus; anchored here,
    /// removed on unsubscribe.
    callback: Arc<SignalHandler<SourceSignal, RecordHandle>>,
}

struct FacadeInner {
    executor: SchedulerExecutor,
    signals: SignalBus<SchedulerSignal, RecordHandle>,
    sources: CriticalSection<Vec<SourceEntry>>,
    /// Handler every source subscription proxies to: re-emit the uniform
    /// `TaskScheduled`, then delegate to the decision engine.
    on_scheduled: Arc<SignalHandler<SourceSignal, RecordHandle>>,
    /// Anchors for the verbatim lifecycle re-publication.
    _lifecycle: Vec<Arc<SignalHandler<SchedulerSignal, RecordHandle>>>,
}

/// The public scheduler.
///
/// Cheaply cloneable; all clones drive the same engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<FacadeInner>,
}

impl Scheduler {
    /// Create a scheduler over `capacity` worker slots (`None` =
    /// unbounded).  Call [`Scheduler::start`] before subscribing sources.
    pub fn new(capacity: Option<usize>) -> Result<Self> {
        let executor = SchedulerExecutor::new(capacity)?;
        let signals = SignalBus::new([
            SchedulerSignal::TaskScheduled,
            SchedulerSignal::TaskDropped,
            SchedulerSignal::TaskPostponed,
            SchedulerSignal::TaskExpired,
            SchedulerSignal::TaskStarted,
            SchedulerSignal::TaskCompleted,
        ]);

        let mut lifecycle = Vec::new();
        for kind in [
            SchedulerSignal::TaskDropped,
            SchedulerSignal::TaskPostponed,
            SchedulerSignal::TaskExpired,
            SchedulerSignal::TaskStarted,
            SchedulerSignal::TaskCompleted,
        ] {
            let republisher = relay(&signals, kind);
            executor.signals().subscribe(kind, &republisher)?;
            lifecycle.push(republisher);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<FacadeInner>| {
            let weak = weak.clone();
            let on_scheduled = handler(move |_kind, record: &RecordHandle| {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(err) = inner
                    .signals
                    .emit(SchedulerSignal::TaskScheduled, record.clone())
                {
                    tracing::error!(error = %err, "task_scheduled emission failed");
                }
                if let Err(err) = inner.executor.submit_local(record) {
                    tracing::error!(error = %err, "record rejected by the scheduler executor");
                }
            });
            FacadeInner {
                executor,
                signals,
                sources: CriticalSection::new(Vec::new()),
                on_scheduled,
                _lifecycle: lifecycle,
            }
        });

        Ok(Self { inner })
    }

    /// The scheduler's public bus: `TaskScheduled` plus the five
    /// lifecycle signals.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<SchedulerSignal, RecordHandle> {
        &self.inner.signals
    }

    /// The underlying decision engine.
    #[must_use]
    pub fn executor(&self) -> &SchedulerExecutor {
        &self.inner.executor
    }

    /// Start the control loop.
    pub fn start(&self) -> Result<()> {
        self.inner.executor.queue().start()?;
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Subscribe a source: records it emits from now on reach the engine.
    ///
    /// Fails with [`SchedulerError::DuplicateSource`] when the source is
    /// already subscribed.  The source is told about the binding through
    /// its `scheduler_feedback` hook.
    pub fn subscribe(&self, source: Arc<dyn ScheduleSource>) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let facade = self.clone();
        self.inner.executor.queue().exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.subscribe_on_worker(&facade, source),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }

    /// Unsubscribe a previously subscribed source.
    pub fn unsubscribe(&self, source: Arc<dyn ScheduleSource>) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let facade = self.clone();
        self.inner.executor.queue().exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.unsubscribe_on_worker(&facade, &source),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )?
    }

    /// Stop the scheduler: unsubscribe every source, cancel postponed
    /// records, ask running tasks to stop, wait for the rest, then stop
    /// the control loop.  After this returns no lifecycle signal is
    /// emitted and no task is running.
    pub fn stop(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let facade = self.clone();
        self.inner.executor.queue().exec_blocking(
            move || match weak.upgrade() {
                Some(inner) => inner.unsubscribe_all_on_worker(&facade),
                None => Err(SchedulerError::SchedulerGone),
            },
            None,
        )??;

        self.inner.executor.cancel_postponed_tasks()?;
        self.inner.executor.stop_running_tasks()?;
        self.inner.executor.await_tasks(None)?;
        self.inner.executor.queue().stop()?;
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

impl FacadeInner {
    fn subscribe_on_worker(
        &self,
        facade: &Scheduler,
        source: Arc<dyn ScheduleSource>,
    ) -> Result<()> {
        let key = source_key(&source);
        {
            let mut sources = self.sources.enter()?;
            sources.retain(|entry| entry.source.strong_count() > 0);
            if sources.iter().any(|entry| entry.key == key) {
                return Err(SchedulerError::DuplicateSource);
            }

            let callback = self.executor.queue().proxy(&self.on_scheduled);
            source
                .schedule_signals()
                .subscribe(SourceSignal::TaskScheduled, &callback)?;
            sources.push(SourceEntry {
                source: Arc::downgrade(&source),
                key,
                callback,
            });
        }
        tracing::info!("schedule source subscribed");
        source.scheduler_feedback(facade, SchedulerFeedback::Subscribed);
        Ok(())
    }

    fn unsubscribe_on_worker(
        &self,
        facade: &Scheduler,
        source: &Arc<dyn ScheduleSource>,
    ) -> Result<()> {
        let key = source_key(source);
        let entry = {
            let mut sources = self.sources.enter()?;
            let position = sources
                .iter()
                .position(|entry| entry.key == key)
                .ok_or(SchedulerError::UnknownSource)?;
            sources.remove(position)
        };

        source
            .schedule_signals()
            .unsubscribe(SourceSignal::TaskScheduled, &entry.callback)?;
        tracing::info!("schedule source unsubscribed");
        source.scheduler_feedback(facade, SchedulerFeedback::Unsubscribed);
        Ok(())
    }

    fn unsubscribe_all_on_worker(&self, facade: &Scheduler) -> Result<()> {
        let entries: Vec<SourceEntry> = {
            let mut sources = self.sources.enter()?;
            sources.drain(..).collect()
        };
        for entry in entries {
            let Some(source) = entry.source.upgrade() else {
                continue;
            };
            if let Err(err) = source
                .schedule_signals()
                .unsubscribe(SourceSignal::TaskScheduled, &entry.callback)
            {
                tracing::warn!(error = %err, "source callback removal failed");
            }
            source.scheduler_feedback(facade, SchedulerFeedback::Unsubscribed);
        }
        Ok(())
    }
}

fn source_key(source: &Arc<dyn ScheduleSource>) -> usize {
    Arc::as_ptr(source) as *const () as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

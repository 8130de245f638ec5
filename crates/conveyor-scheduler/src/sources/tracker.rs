//! Tracking source: submit one record and wait for the scheduler's
//! verdict.
//!
//! A [`TrackerSource`] may be bound to a single scheduler (through the
//! `scheduler_feedback` hook).  [`TrackerSource::wait_response`] emits a
//! record and blocks until the scheduler answers with `TaskStarted`,
//! `TaskDropped` or `TaskExpired` for exactly that record.  The record
//! must carry the `Drop` postpone policy -- a queueable record could keep
//! the caller blocked indefinitely.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use conveyor_signals::{SignalBus, SignalHandler, handler};
use conveyor_tasks::TaskError;

use crate::error::{Result, SchedulerError};
use crate::executor::SchedulerSignal;
use crate::record::{PostponePolicy, RecordHandle, ScheduleSource, SchedulerFeedback, SourceSignal};
use crate::scheduler::Scheduler;

struct TrackState {
    scheduler: Option<Scheduler>,
    tracked: Option<RecordHandle>,
    outcome: Option<SchedulerSignal>,
}

/// A single-scheduler source that tracks one record at a time.
pub struct TrackerSource {
    signals: SignalBus<SourceSignal, RecordHandle>,
    state: Mutex<TrackState>,
    answered: Condvar,
    /// Subscribed to the scheduler's started/dropped/expired signals;
    /// runs on the scheduler's worker and wakes the blocked caller.
    on_outcome: Arc<SignalHandler<SchedulerSignal, RecordHandle>>,
}

const OUTCOME_SIGNALS: [SchedulerSignal; 3] = [
    SchedulerSignal::TaskDropped,
    SchedulerSignal::TaskExpired,
    SchedulerSignal::TaskStarted,
];

impl TrackerSource {
    /// Create a new tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let on_outcome = handler(move |kind, record: &RecordHandle| {
                if let Some(tracker) = weak.upgrade() {
                    tracker.record_outcome(kind, record);
                }
            });
            Self {
                signals: SignalBus::new([SourceSignal::TaskScheduled]),
                state: Mutex::new(TrackState {
                    scheduler: None,
                    tracked: None,
                    outcome: None,
                }),
                answered: Condvar::new(),
                on_outcome,
            }
        })
    }

    /// The scheduler this source is bound to, if any.
    pub fn scheduler(&self) -> Result<Option<Scheduler>> {
        Ok(self.lock_state()?.scheduler.clone())
    }

    /// Emit `record` and block until the scheduler answers for it.
    ///
    /// Returns the answering signal: `TaskStarted`, `TaskDropped` or
    /// `TaskExpired`.
    pub fn wait_response(&self, record: RecordHandle) -> Result<SchedulerSignal> {
        {
            let mut state = self.lock_state()?;
            if state.scheduler.is_none() {
                return Err(SchedulerError::NoScheduler);
            }
            if record.postpone_policy() != PostponePolicy::Drop {
                return Err(SchedulerError::TrackedRecordPolicy);
            }
            if state.tracked.is_some() {
                return Err(SchedulerError::TrackerBusy);
            }
            state.tracked = Some(record.clone());
            state.outcome = None;
        }

        if let Err(err) = self.signals.emit(SourceSignal::TaskScheduled, record) {
            let mut state = self.lock_state()?;
            state.tracked = None;
            state.outcome = None;
            return Err(err.into());
        }

        let mut state = self.lock_state()?;
        while state.outcome.is_none() {
            state = self
                .answered
                .wait(state)
                .map_err(|_| TaskError::LockPoisoned)?;
        }
        let outcome = state.outcome.take().ok_or(SchedulerError::TrackerBusy)?;
        state.tracked = None;
        Ok(outcome)
    }

    fn record_outcome(&self, kind: SchedulerSignal, record: &RecordHandle) {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!("tracker state is poisoned; outcome lost");
            return;
        };
        let matches = state
            .tracked
            .as_ref()
            .is_some_and(|tracked| Arc::ptr_eq(tracked, record));
        if matches && state.outcome.is_none() {
            state.outcome = Some(kind);
            self.answered.notify_all();
        }
    }

    fn bind(&self, scheduler: &Scheduler) {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!("tracker state is poisoned; binding lost");
            return;
        };
        if state.scheduler.is_some() {
            tracing::error!("tracker source is already bound to a scheduler");
            return;
        }
        for kind in OUTCOME_SIGNALS {
            if let Err(err) = scheduler.signals().subscribe(kind, &self.on_outcome) {
                tracing::error!(signal = ?kind, error = %err, "tracker subscription failed");
            }
        }
        state.scheduler = Some(scheduler.clone());
    }

    fn unbind(&self) {
        let Ok(mut state) = self.lock_state() else {
            tracing::error!("tracker state is poisoned; unbinding lost");
            return;
        };
        let Some(scheduler) = state.scheduler.take() else {
            tracing::error!("tracker source is not bound to a scheduler");
            return;
        };
        for kind in OUTCOME_SIGNALS {
            if let Err(err) = scheduler.signals().unsubscribe(kind, &self.on_outcome) {
                tracing::warn!(signal = ?kind, error = %err, "tracker unsubscription failed");
            }
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, TrackState>> {
        self.state
            .lock()
            .map_err(|_| TaskError::LockPoisoned.into())
    }
}

impl ScheduleSource for TrackerSource {
    fn schedule_signals(&self) -> &SignalBus<SourceSignal, RecordHandle> {
        &self.signals
    }

    fn scheduler_feedback(&self, scheduler: &Scheduler, feedback: SchedulerFeedback) {
        match feedback {
            SchedulerFeedback::Subscribed => self.bind(scheduler),
            SchedulerFeedback::Unsubscribed => self.unbind(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ScheduleRecord;
    use conveyor_tasks::{FnTask, TaskOutput};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn drop_record(tracker: &Arc<TrackerSource>) -> RecordHandle {
        ScheduleRecord::new(
            FnTask::handle(|| Ok(TaskOutput::Null)),
            tracker.clone(),
        )
        .with_postpone_policy(PostponePolicy::Drop)
        .into_handle()
    }

    #[test]
    fn requires_a_bound_scheduler() {
        let tracker = TrackerSource::new();
        let record = drop_record(&tracker);
        assert!(matches!(
            tracker.wait_response(record),
            Err(SchedulerError::NoScheduler)
        ));
    }

    #[test]
    fn rejects_queueable_records() {
        let scheduler = Scheduler::new(None).unwrap();
        scheduler.start().unwrap();
        let tracker = TrackerSource::new();
        scheduler.subscribe(tracker.clone()).unwrap();

        let record = ScheduleRecord::new(
            FnTask::handle(|| Ok(TaskOutput::Null)),
            tracker.clone(),
        )
        .into_handle();
        assert!(matches!(
            tracker.wait_response(record),
            Err(SchedulerError::TrackedRecordPolicy)
        ));
        scheduler.stop().unwrap();
    }

    #[test]
    fn started_answer_comes_back() {
        let scheduler = Scheduler::new(Some(2)).unwrap();
        scheduler.start().unwrap();
        let tracker = TrackerSource::new();
        scheduler.subscribe(tracker.clone()).unwrap();
        assert!(tracker.scheduler().unwrap().is_some());

        let record = drop_record(&tracker);
        let answer = tracker.wait_response(record).unwrap();
        assert_eq!(answer, SchedulerSignal::TaskStarted);

        scheduler.stop().unwrap();
    }

    #[test]
    fn dropped_answer_comes_back_when_full() {
        let scheduler = Scheduler::new(Some(1)).unwrap();
        scheduler.start().unwrap();
        let tracker = TrackerSource::new();
        scheduler.subscribe(tracker.clone()).unwrap();

        // Fill the only slot with a gated task.
        let gate = Arc::new(AtomicBool::new(false));
        let blocker = {
            let gate = Arc::clone(&gate);
            ScheduleRecord::new(
                FnTask::handle(move || {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Ok(TaskOutput::Null)
                }),
                tracker.clone(),
            )
            .with_postpone_policy(PostponePolicy::Drop)
            .into_handle()
        };
        assert_eq!(
            tracker.wait_response(blocker).unwrap(),
            SchedulerSignal::TaskStarted
        );

        let refused = drop_record(&tracker);
        assert_eq!(
            tracker.wait_response(refused).unwrap(),
            SchedulerSignal::TaskDropped
        );

        gate.store(true, Ordering::SeqCst);
        scheduler.stop().unwrap();
    }

    #[test]
    fn unbinding_clears_the_scheduler() {
        let scheduler = Scheduler::new(None).unwrap();
        scheduler.start().unwrap();
        let tracker = TrackerSource::new();

        scheduler.subscribe(tracker.clone()).unwrap();
        scheduler.unsubscribe(tracker.clone()).unwrap();
        assert!(tracker.scheduler().unwrap().is_none());

        let record = drop_record(&tracker);
        assert!(matches!(
            tracker.wait_response(record),
            Err(SchedulerError::NoScheduler)
        ));
        scheduler.stop().unwrap();
    }
}

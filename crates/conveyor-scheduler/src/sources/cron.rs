//! Recurring source driven by cron schedules.
//!
//! A [`CronSource`] owns a registry of jobs, each a [`cron::Schedule`]
//! plus a task factory and the record policies to stamp on every firing.
//! A timer thread sleeps until the earliest upcoming occurrence, builds
//! the due records and emits them as `TaskScheduled`.  Adding a job or
//! stopping the source interrupts the sleep.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use conveyor_signals::SignalBus;
use conveyor_tasks::{TaskError, TaskHandle};

use crate::error::{Result, SchedulerError};
use crate::record::{
    PostponePolicy, RecordHandle, ScheduleRecord, ScheduleSource, SourceSignal,
};

/// A recurring job: when to fire and how to shape the record.
pub struct CronJob {
    /// Job name, used in logs and for [`CronSource::next_occurrence`].
    pub name: String,
    /// The firing schedule.
    pub schedule: cron::Schedule,
    /// Group id stamped on emitted records.
    pub group_id: Option<String>,
    /// Concurrency bound stamped on emitted records (`0` = no limit).
    pub simultaneous_runs: u32,
    /// Postpone policy stamped on emitted records.
    pub postpone_policy: PostponePolicy,
}

impl CronJob {
    /// A job with default record policies.
    #[must_use]
    pub fn new(name: impl Into<String>, schedule: cron::Schedule) -> Self {
        Self {
            name: name.into(),
            schedule,
            group_id: None,
            simultaneous_runs: 0,
            postpone_policy: PostponePolicy::default(),
        }
    }
}

type TaskFactory = Box<dyn Fn() -> TaskHandle + Send + Sync>;

struct CronEntry {
    job: CronJob,
    factory: TaskFactory,
    next_fire: Option<DateTime<Utc>>,
}

struct CronState {
    jobs: Vec<CronEntry>,
    running: bool,
    worker: Option<JoinHandle<()>>,
}

/// Schedule source that fires records on cron occurrences.
pub struct CronSource {
    signals: SignalBus<SourceSignal, RecordHandle>,
    state: Mutex<CronState>,
    wakeup: Condvar,
    weak_self: Weak<CronSource>,
}

impl CronSource {
    /// Create a source with no jobs.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            signals: SignalBus::new([SourceSignal::TaskScheduled]),
            state: Mutex::new(CronState {
                jobs: Vec::new(),
                running: false,
                worker: None,
            }),
            wakeup: Condvar::new(),
            weak_self: weak.clone(),
        })
    }

    /// Register a job.  `factory` builds a fresh task for every firing.
    pub fn add_job<F>(&self, job: CronJob, factory: F) -> Result<()>
    where
        F: Fn() -> TaskHandle + Send + Sync + 'static,
    {
        let mut state = self.lock_state()?;
        tracing::debug!(job = %job.name, "cron job registered");
        state.jobs.push(CronEntry {
            job,
            factory: Box::new(factory),
            next_fire: None,
        });
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> Result<usize> {
        Ok(self.lock_state()?.jobs.len())
    }

    /// Next planned firing of the named job, if the job exists and the
    /// schedule has a future occurrence.
    pub fn next_occurrence(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let state = self.lock_state()?;
        Ok(state
            .jobs
            .iter()
            .find(|entry| entry.job.name == name)
            .and_then(|entry| {
                entry
                    .next_fire
                    .or_else(|| entry.job.schedule.after(&Utc::now()).next())
            }))
    }

    /// Spawn the timer thread.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.running {
            return Err(SchedulerError::SourceAlreadyStarted);
        }
        state.running = true;

        let weak = self.weak_self.clone();
        let worker = thread::Builder::new()
            .name("conveyor-cron".to_string())
            .spawn(move || timer_loop(weak))
            .map_err(|err| TaskError::failed(format!("failed to spawn cron thread: {err}")))?;
        state.worker = Some(worker);
        tracing::debug!("cron source started");
        Ok(())
    }

    /// Stop the timer thread.
    pub fn stop(&self) -> Result<()> {
        let worker = {
            let mut state = self.lock_state()?;
            if !state.running {
                return Err(SchedulerError::SourceNotStarted);
            }
            state.running = false;
            state.worker.take()
        };
        self.wakeup.notify_all();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("cron timer thread exited abnormally");
            }
        }
        tracing::debug!("cron source stopped");
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CronState>> {
        self.state.lock().map_err(|_| TaskError::LockPoisoned.into())
    }
}

impl ScheduleSource for CronSource {
    fn schedule_signals(&self) -> &SignalBus<SourceSignal, RecordHandle> {
        &self.signals
    }
}

fn timer_loop(weak: Weak<CronSource>) {
    loop {
        let Some(source) = weak.upgrade() else { return };

        // One pass: refresh per-job occurrence times, collect what is due.
        let (due, sleep_until) = {
            let Ok(mut state) = source.state.lock() else {
                tracing::error!("cron state is poisoned; timer exiting");
                return;
            };
            if !state.running {
                return;
            }

            let now = Utc::now();
            let mut due: Vec<(String, RecordHandle)> = Vec::new();
            let source_dyn: Arc<dyn ScheduleSource> = Arc::clone(&source) as Arc<dyn ScheduleSource>;

            for entry in &mut state.jobs {
                if entry.next_fire.is_none() {
                    entry.next_fire = entry.job.schedule.after(&now).next();
                }
                let Some(when) = entry.next_fire else { continue };
                if when > now {
                    continue;
                }

                let task = (entry.factory)();
                let mut record = ScheduleRecord::new(task, Arc::clone(&source_dyn))
                    .with_simultaneous_runs(entry.job.simultaneous_runs)
                    .with_postpone_policy(entry.job.postpone_policy);
                if let Some(group_id) = &entry.job.group_id {
                    record = record.with_group_id(group_id.clone());
                }
                due.push((entry.job.name.clone(), record.into_handle()));
                entry.next_fire = entry.job.schedule.after(&now).next();
            }

            let sleep_until = state.jobs.iter().filter_map(|entry| entry.next_fire).min();
            (due, sleep_until)
        };

        for (name, record) in due {
            tracing::debug!(job = %name, "cron job fired");
            if let Err(err) = source.signals.emit(SourceSignal::TaskScheduled, record) {
                tracing::error!(job = %name, error = %err, "cron record emission failed");
            }
        }

        // Park until the next occurrence, a new job, or stop.
        let Ok(state) = source.state.lock() else {
            tracing::error!("cron state is poisoned; timer exiting");
            return;
        };
        if !state.running {
            return;
        }
        let parked = match sleep_until {
            // Idle park is capped so the thread notices when the last
            // outside handle to the source is gone.
            None => source
                .wakeup
                .wait_timeout(state, Duration::from_millis(500))
                .map(|(guard, _)| drop(guard)),
            Some(when) => {
                let pause = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if pause.is_zero() {
                    drop(state);
                    Ok(())
                } else {
                    source
                        .wakeup
                        .wait_timeout(state, pause)
                        .map(|(guard, _)| drop(guard))
                }
            }
        };
        if parked.is_err() {
            tracing::error!("cron state is poisoned; timer exiting");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_signals::handler;
    use conveyor_tasks::{FnTask, TaskOutput};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn every_second() -> cron::Schedule {
        cron::Schedule::from_str("* * * * * *").unwrap()
    }

    #[test]
    fn fires_on_schedule() {
        let source = CronSource::new();
        let fired = Arc::new(AtomicU32::new(0));

        let sink = {
            let fired = Arc::clone(&fired);
            handler(move |_, _: &RecordHandle| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        source
            .schedule_signals()
            .subscribe(SourceSignal::TaskScheduled, &sink)
            .unwrap();

        source
            .add_job(CronJob::new("tick", every_second()), || {
                FnTask::handle(|| Ok(TaskOutput::Null))
            })
            .unwrap();
        source.start().unwrap();

        thread::sleep(Duration::from_millis(2200));
        source.stop().unwrap();

        let count = fired.load(Ordering::SeqCst);
        assert!((1..=4).contains(&count), "fired {count} times");
    }

    #[test]
    fn emitted_records_carry_job_policies() {
        let source = CronSource::new();
        let seen: Arc<std::sync::Mutex<Vec<RecordHandle>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = {
            let seen = Arc::clone(&seen);
            handler(move |_, record: &RecordHandle| {
                seen.lock().unwrap().push(record.clone());
            })
        };
        source
            .schedule_signals()
            .subscribe(SourceSignal::TaskScheduled, &sink)
            .unwrap();

        let mut job = CronJob::new("shaped", every_second());
        job.group_id = Some("cron-group".to_string());
        job.simultaneous_runs = 1;
        job.postpone_policy = PostponePolicy::KeepLast;
        source
            .add_job(job, || FnTask::handle(|| Ok(TaskOutput::Null)))
            .unwrap();
        source.start().unwrap();

        thread::sleep(Duration::from_millis(1500));
        source.stop().unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let record = &seen[0];
        assert_eq!(record.group_id(), Some("cron-group"));
        assert_eq!(record.simultaneous_runs(), 1);
        assert_eq!(record.postpone_policy(), PostponePolicy::KeepLast);
    }

    #[test]
    fn lifecycle_errors() {
        let source = CronSource::new();
        assert!(matches!(
            source.stop(),
            Err(SchedulerError::SourceNotStarted)
        ));
        source.start().unwrap();
        assert!(matches!(
            source.start(),
            Err(SchedulerError::SourceAlreadyStarted)
        ));
        source.stop().unwrap();
    }

    #[test]
    fn next_occurrence_is_in_the_future() {
        let source = CronSource::new();
        source
            .add_job(CronJob::new("tick", every_second()), || {
                FnTask::handle(|| Ok(TaskOutput::Null))
            })
            .unwrap();

        let next = source.next_occurrence("tick").unwrap().unwrap();
        assert!(next > Utc::now() - chrono::TimeDelta::seconds(1));
        assert!(source.next_occurrence("ghost").unwrap().is_none());
        assert_eq!(source.job_count().unwrap(), 1);
    }
}

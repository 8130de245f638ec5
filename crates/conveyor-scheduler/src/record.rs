//! Schedule records and the source contract.
//!
//! A [`ScheduleRecord`] is the unit the scheduler works with: one task
//! plus the policies that govern its admission -- grouping, deadline,
//! concurrency bound and postpone policy.  Records are transient: a
//! source creates one, the scheduler emits exactly one terminal lifecycle
//! signal for it, and the record is dropped.
//!
//! A [`ScheduleSource`] is anything that emits records.  Its whole
//! contract is the single `TaskScheduled` signal plus an optional
//! feedback hook the scheduler calls on subscribe/unsubscribe.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conveyor_signals::SignalBus;
use conveyor_tasks::TaskHandle;

use crate::scheduler::Scheduler;

/// What to do with a record that cannot run immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostponePolicy {
    /// Queue the record and run it when capacity frees up.
    #[default]
    Wait,
    /// Drop the record instead of queueing it.
    Drop,
    /// Keep the earliest queued record of the group, drop this one if the
    /// group already has one waiting.
    KeepFirst,
    /// Drop every queued record of the group and keep this one.
    KeepLast,
}

/// Signals a schedule source emits, payload [`RecordHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceSignal {
    /// The source wants this record executed.
    TaskScheduled,
}

/// Feedback the scheduler gives a source on (un)subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerFeedback {
    /// The source is now subscribed to the notifying scheduler.
    Subscribed,
    /// The source is no longer subscribed.
    Unsubscribed,
}

/// An object that emits schedule records.
pub trait ScheduleSource: Send + Sync + 'static {
    /// The source's signal bus; the scheduler subscribes to
    /// [`SourceSignal::TaskScheduled`] on it.
    fn schedule_signals(&self) -> &SignalBus<SourceSignal, RecordHandle>;

    /// Called by the scheduler when this source is bound or unbound, so
    /// the source may remember the binding.  The default does nothing.
    fn scheduler_feedback(&self, _scheduler: &Scheduler, _feedback: SchedulerFeedback) {}
}

/// Shared handle to a record.
pub type RecordHandle = Arc<ScheduleRecord>;

/// One task plus its scheduling policy.
pub struct ScheduleRecord {
    task: TaskHandle,
    source: Arc<dyn ScheduleSource>,
    group_id: Option<String>,
    ttl: Option<DateTime<Utc>>,
    simultaneous_runs: u32,
    postpone_policy: PostponePolicy,
}

impl ScheduleRecord {
    /// Create a record with default policies: no group, no deadline, no
    /// concurrency bound, `Wait` postpone policy.
    #[must_use]
    pub fn new(task: TaskHandle, source: Arc<dyn ScheduleSource>) -> Self {
        Self {
            task,
            source,
            group_id: None,
            ttl: None,
            simultaneous_runs: 0,
            postpone_policy: PostponePolicy::default(),
        }
    }

    /// Set the grouping key.
    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the absolute deadline past which the record is unscheduleable.
    #[must_use]
    pub fn with_ttl(mut self, ttl: DateTime<Utc>) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Bound concurrently running records of this group.  `0` means no
    /// limit.
    #[must_use]
    pub fn with_simultaneous_runs(mut self, simultaneous_runs: u32) -> Self {
        self.simultaneous_runs = simultaneous_runs;
        self
    }

    /// Set the postpone policy.
    #[must_use]
    pub fn with_postpone_policy(mut self, postpone_policy: PostponePolicy) -> Self {
        self.postpone_policy = postpone_policy;
        self
    }

    /// Wrap into the shared handle the rest of the runtime passes around.
    #[must_use]
    pub fn into_handle(self) -> RecordHandle {
        Arc::new(self)
    }

    /// The task to execute.
    #[must_use]
    pub fn task(&self) -> &TaskHandle {
        &self.task
    }

    /// The source that emitted this record.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn ScheduleSource> {
        &self.source
    }

    /// The grouping key, if any.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub fn ttl(&self) -> Option<DateTime<Utc>> {
        self.ttl
    }

    /// Concurrency bound for the group; `0` means no limit.
    #[must_use]
    pub fn simultaneous_runs(&self) -> u32 {
        self.simultaneous_runs
    }

    /// The postpone policy.
    #[must_use]
    pub fn postpone_policy(&self) -> PostponePolicy {
        self.postpone_policy
    }

    /// Whether the deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| ttl < now)
    }
}

impl fmt::Debug for ScheduleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleRecord")
            .field("group_id", &self.group_id)
            .field("ttl", &self.ttl)
            .field("simultaneous_runs", &self.simultaneous_runs)
            .field("postpone_policy", &self.postpone_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::instant::InstantSource;
    use chrono::TimeDelta;
    use conveyor_tasks::{FnTask, TaskOutput};

    fn probe_record() -> ScheduleRecord {
        let source = InstantSource::new();
        ScheduleRecord::new(FnTask::handle(|| Ok(TaskOutput::Null)), source)
    }

    #[test]
    fn defaults_match_the_contract() {
        let record = probe_record();
        assert_eq!(record.group_id(), None);
        assert_eq!(record.ttl(), None);
        assert_eq!(record.simultaneous_runs(), 0);
        assert_eq!(record.postpone_policy(), PostponePolicy::Wait);
    }

    #[test]
    fn builder_setters_stick() {
        let record = probe_record()
            .with_group_id("batch")
            .with_simultaneous_runs(2)
            .with_postpone_policy(PostponePolicy::KeepLast);
        assert_eq!(record.group_id(), Some("batch"));
        assert_eq!(record.simultaneous_runs(), 2);
        assert_eq!(record.postpone_policy(), PostponePolicy::KeepLast);
    }

    #[test]
    fn expiry_is_strict_past() {
        let now = Utc::now();
        let expired = probe_record().with_ttl(now - TimeDelta::seconds(1));
        let live = probe_record().with_ttl(now + TimeDelta::seconds(60));
        let eternal = probe_record();

        assert!(expired.is_expired(now));
        assert!(!live.is_expired(now));
        assert!(!eternal.is_expired(now));
    }
}

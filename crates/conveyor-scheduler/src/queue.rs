//! Postpone queue.
//!
//! An ordered holding area for records that cannot run right now.  This is
//! not a priority queue: records leave in arrival order, subject to the
//! caller's eligibility filter.  The queue applies two rules on entry, in
//! this order:
//!
//! 1. **TTL** -- a record whose deadline has already passed is announced
//!    as `Expired` and never enters.
//! 2. **Postpone policy** -- `Drop` never enters (`Dropped`); `Wait`
//!    appends; `KeepLast` first drops every queued record of the same
//!    group; `KeepFirst` drops the *new* record when the group already has
//!    one waiting.  Records without a group always append.
//!
//! A record that expires while queued is announced as `Expired` exactly
//! once, when [`PostponeQueue::next_record`] removes it on its way past.
//!
//! The queue is driven from the scheduler's callback-queue worker; its own
//! lock only guards against snapshot readers.

use std::collections::VecDeque;

use chrono::Utc;

use conveyor_signals::SignalBus;
use conveyor_tasks::CriticalSection;

use crate::error::Result;
use crate::record::{PostponePolicy, RecordHandle};

/// Signals of the postpone queue, payload [`RecordHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueSignal {
    /// The record was discarded by policy and will not start.
    Dropped,
    /// The record was queued and will be re-examined later.
    Postponed,
    /// The record's deadline passed before it could start.
    Expired,
}

/// Ordered holding area for postponed records.
pub struct PostponeQueue {
    records: CriticalSection<VecDeque<RecordHandle>>,
    signals: SignalBus<QueueSignal, RecordHandle>,
}

impl PostponeQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: CriticalSection::new(VecDeque::new()),
            signals: SignalBus::new([
                QueueSignal::Dropped,
                QueueSignal::Postponed,
                QueueSignal::Expired,
            ]),
        }
    }

    /// The queue's bus.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<QueueSignal, RecordHandle> {
        &self.signals
    }

    /// Number of queued records.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.enter()?.len())
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.records.enter()?.is_empty())
    }

    /// Queue a record, or discard it per its TTL and postpone policy.
    ///
    /// Every outcome is announced on the bus: `Expired`, `Dropped` (which
    /// may hit *other* records of the group under `KeepLast`), or
    /// `Postponed`.
    pub fn postpone(&self, record: RecordHandle) -> Result<()> {
        if record.is_expired(Utc::now()) {
            self.signals.emit(QueueSignal::Expired, record)?;
            return Ok(());
        }

        match record.postpone_policy() {
            PostponePolicy::Drop => {
                self.signals.emit(QueueSignal::Dropped, record)?;
                Ok(())
            }
            PostponePolicy::Wait => self.append(record),
            PostponePolicy::KeepLast => {
                let Some(group_id) = record.group_id().map(str::to_string) else {
                    return self.append(record);
                };
                let displaced: Vec<RecordHandle> = {
                    let mut records = self.records.enter()?;
                    let mut displaced = Vec::new();
                    records.retain(|queued| {
                        if queued.group_id() == Some(group_id.as_str()) {
                            displaced.push(queued.clone());
                            false
                        } else {
                            true
                        }
                    });
                    displaced
                };
                for old in displaced {
                    self.signals.emit(QueueSignal::Dropped, old)?;
                }
                self.append(record)
            }
            PostponePolicy::KeepFirst => {
                let Some(group_id) = record.group_id().map(str::to_string) else {
                    return self.append(record);
                };
                let occupied = {
                    let records = self.records.enter()?;
                    records
                        .iter()
                        .any(|queued| queued.group_id() == Some(group_id.as_str()))
                };
                if occupied {
                    self.signals.emit(QueueSignal::Dropped, record)?;
                    Ok(())
                } else {
                    self.append(record)
                }
            }
        }
    }

    /// Remove and return the earliest queued record accepted by `filter`.
    ///
    /// Records found expired along the way are removed and announced as
    /// `Expired`; records the filter rejects stay queued in place.
    pub fn next_record<F>(&self, filter: F) -> Result<Option<RecordHandle>>
    where
        F: Fn(&RecordHandle) -> bool,
    {
        let now = Utc::now();
        let (expired, selected) = {
            let mut records = self.records.enter()?;
            let mut expired = Vec::new();
            let mut selected = None;
            let mut index = 0;
            while index < records.len() {
                if records[index].is_expired(now) {
                    if let Some(record) = records.remove(index) {
                        expired.push(record);
                    }
                    continue;
                }
                if filter(&records[index]) {
                    selected = records.remove(index);
                    break;
                }
                index += 1;
            }
            (expired, selected)
        };

        for record in expired {
            self.signals.emit(QueueSignal::Expired, record)?;
        }
        Ok(selected)
    }

    fn append(&self, record: RecordHandle) -> Result<()> {
        self.records.enter()?.push_back(record.clone());
        self.signals.emit(QueueSignal::Postponed, record)?;
        Ok(())
    }
}

impl Default for PostponeQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

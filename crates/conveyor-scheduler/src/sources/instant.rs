//! The simplest source: emit a record immediately.

use std::sync::Arc;

use conveyor_signals::SignalBus;

use crate::error::Result;
use crate::record::{RecordHandle, ScheduleSource, SourceSignal};

/// A source whose [`InstantSource::schedule`] hands the record straight
/// to whoever is subscribed.
pub struct InstantSource {
    signals: SignalBus<SourceSignal, RecordHandle>,
}

impl InstantSource {
    /// Create a new source.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signals: SignalBus::new([SourceSignal::TaskScheduled]),
        })
    }

    /// Emit a record.
    pub fn schedule(&self, record: RecordHandle) -> Result<()> {
        self.signals.emit(SourceSignal::TaskScheduled, record)?;
        Ok(())
    }
}

impl ScheduleSource for InstantSource {
    fn schedule_signals(&self) -> &SignalBus<SourceSignal, RecordHandle> {
        &self.signals
    }
}

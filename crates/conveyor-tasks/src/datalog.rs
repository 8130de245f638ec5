//! Append-only datalog.
//!
//! [`Datalog`] is an in-memory append-only sequence.  Entries are appended
//! in observation order and never mutated; iteration hands out a
//! point-in-time snapshot, so concurrent appends after an iteration
//! started are not observed by it.  `truncate` only ever removes the
//! oldest entries.
//!
//! Every append is announced on the log's bus (`NewEntry`), and
//! [`Datalog::wait_matching`] blocks until some entry satisfies a
//! predicate -- the primitive chained tasks use to wait for a
//! dependency's recorded result.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use conveyor_signals::SignalBus;

use crate::critical::CriticalSection;
use crate::error::{Result, TaskError};

/// Datalog signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatalogSignal {
    /// An entry was appended; the payload is the entry.
    NewEntry,
}

struct LogInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    entries: CriticalSection<Vec<T>>,
    generation: Mutex<u64>,
    appended: Condvar,
    signals: SignalBus<DatalogSignal, T>,
}

/// Append-only in-memory log.
pub struct Datalog<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<LogInner<T>>,
}

impl<T> Clone for Datalog<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Datalog<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LogInner {
                entries: CriticalSection::new(Vec::new()),
                generation: Mutex::new(0),
                appended: Condvar::new(),
                signals: SignalBus::new([DatalogSignal::NewEntry]),
            }),
        }
    }

    /// The log's bus.
    #[must_use]
    pub fn signals(&self) -> &SignalBus<DatalogSignal, T> {
        &self.inner.signals
    }

    /// Append an entry to the tail.
    pub fn append(&self, entry: T) -> Result<()> {
        self.inner.entries.enter()?.push(entry.clone());

        {
            let mut generation = self
                .inner
                .generation
                .lock()
                .map_err(|_| TaskError::LockPoisoned)?;
            *generation += 1;
        }
        self.inner.appended.notify_all();

        self.inner.signals.emit(DatalogSignal::NewEntry, entry)?;
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.entries.enter()?.len())
    }

    /// True when no entry has been appended (or all were truncated).
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.entries.enter()?.is_empty())
    }

    /// Point-in-time snapshot, oldest first.
    pub fn iterate(&self) -> Result<Vec<T>> {
        Ok(self.inner.entries.enter()?.clone())
    }

    /// Point-in-time snapshot, newest first.
    pub fn iterate_rev(&self) -> Result<Vec<T>> {
        let mut snapshot = self.iterate()?;
        snapshot.reverse();
        Ok(snapshot)
    }

    /// Keep the `min_length` newest entries, dropping the oldest.
    pub fn truncate(&self, min_length: usize) -> Result<()> {
        let mut entries = self.inner.entries.enter()?;
        if min_length == 0 {
            entries.clear();
        } else if entries.len() > min_length {
            let excess = entries.len() - min_length;
            entries.drain(..excess);
        }
        Ok(())
    }

    /// Closest entry accepted by `filter`: the oldest match, or the newest
    /// when `reverse` is set.
    pub fn find<F>(&self, filter: F, reverse: bool) -> Result<Option<T>>
    where
        F: Fn(&T) -> bool,
    {
        let entries = self.inner.entries.enter()?;
        let hit = if reverse {
            entries.iter().rev().find(|entry| filter(entry))
        } else {
            entries.iter().find(|entry| filter(entry))
        };
        Ok(hit.cloned())
    }

    /// Block until some entry satisfies `filter`, returning it.
    ///
    /// Entries already in the log count.  Returns `Ok(None)` when
    /// `timeout` elapses first; `None` blocks forever.
    pub fn wait_matching<F>(&self, filter: F, timeout: Option<Duration>) -> Result<Option<T>>
    where
        F: Fn(&T) -> bool,
    {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let seen = *self
                .inner
                .generation
                .lock()
                .map_err(|_| TaskError::LockPoisoned)?;

            if let Some(hit) = self.find(&filter, true)? {
                return Ok(Some(hit));
            }

            let mut generation = self
                .inner
                .generation
                .lock()
                .map_err(|_| TaskError::LockPoisoned)?;
            while *generation == seen {
                generation = match deadline {
                    None => self
                        .inner
                        .appended
                        .wait(generation)
                        .map_err(|_| TaskError::LockPoisoned)?,
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(None);
                        }
                        self.inner
                            .appended
                            .wait_timeout(generation, deadline - now)
                            .map_err(|_| TaskError::LockPoisoned)?
                            .0
                    }
                };
            }
        }
    }
}

impl<T> Default for Datalog<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_signals::handler;
    use std::thread;

    #[test]
    fn append_preserves_observation_order() {
        let log: Datalog<u32> = Datalog::new();
        for i in 0..5 {
            log.append(i).unwrap();
        }
        assert_eq!(log.iterate().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(log.iterate_rev().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(log.len().unwrap(), 5);
    }

    #[test]
    fn iteration_is_a_snapshot() {
        let log: Datalog<u32> = Datalog::new();
        log.append(1).unwrap();
        let snapshot = log.iterate().unwrap();
        log.append(2).unwrap();
        assert_eq!(snapshot, vec![1]);
        assert_eq!(log.iterate().unwrap(), vec![1, 2]);
    }

    #[test]
    fn truncate_drops_only_the_oldest() {
        let log: Datalog<u32> = Datalog::new();
        for i in 0..6 {
            log.append(i).unwrap();
        }
        log.truncate(4).unwrap();
        assert_eq!(log.iterate().unwrap(), vec![2, 3, 4, 5]);

        log.truncate(10).unwrap();
        assert_eq!(log.len().unwrap(), 4);

        log.truncate(0).unwrap();
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn find_respects_direction() {
        let log: Datalog<u32> = Datalog::new();
        for i in [1, 2, 3, 2, 1] {
            log.append(i).unwrap();
        }
        assert_eq!(log.find(|e| *e == 2, false).unwrap(), Some(2));
        assert_eq!(log.find(|e| *e >= 2, true).unwrap(), Some(2));
        assert_eq!(log.find(|e| *e == 9, false).unwrap(), None);
    }

    #[test]
    fn append_emits_new_entry() {
        let log: Datalog<u32> = Datalog::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            handler(move |_, entry: &u32| seen.lock().unwrap().push(*entry))
        };
        log.signals().subscribe(DatalogSignal::NewEntry, &sink).unwrap();

        log.append(7).unwrap();
        log.append(8).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[7, 8]);
    }

    #[test]
    fn wait_matching_blocks_until_a_match() {
        let log: Datalog<u32> = Datalog::new();

        let writer = {
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                log.append(1).unwrap();
                log.append(42).unwrap();
            })
        };

        let hit = log.wait_matching(|e| *e == 42, None).unwrap();
        assert_eq!(hit, Some(42));
        writer.join().unwrap();
    }

    #[test]
    fn wait_matching_times_out() {
        let log: Datalog<u32> = Datalog::new();
        let hit = log
            .wait_matching(|e| *e == 1, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(hit, None);

        log.append(1).unwrap();
        let hit = log
            .wait_matching(|e| *e == 1, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(hit, Some(1));
    }
}

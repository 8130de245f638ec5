//! Critical-section helper.
//!
//! [`CriticalSection`] wraps a mutex and turns poisoning into a typed
//! error instead of a panic, so components that share state with task
//! threads keep returning `Result` even after a worker dies mid-hold.
//! [`CriticalSection::try_enter`] gives the non-blocking poll variant.

use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::error::{Result, TaskError};

/// A mutex-protected value with `Result`-based acquisition.
#[derive(Debug, Default)]
pub struct CriticalSection<T> {
    lock: Mutex<T>,
}

impl<T> CriticalSection<T> {
    /// Wrap a value.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
        }
    }

    /// Acquire the section, blocking until it is free.
    pub fn enter(&self) -> Result<MutexGuard<'_, T>> {
        self.lock.lock().map_err(|_| TaskError::LockPoisoned)
    }

    /// Acquire the section without blocking.
    pub fn try_enter(&self) -> Result<MutexGuard<'_, T>> {
        self.lock.try_lock().map_err(|err| match err {
            TryLockError::WouldBlock => TaskError::Contended,
            TryLockError::Poisoned(_) => TaskError::LockPoisoned,
        })
    }
}

//! Typed broadcast signal bus.
//!
//! A [`SignalBus`] is a set of named broadcast channels owned by one
//! emitting component.  The set of signal kinds is fixed when the bus is
//! constructed; emitting or subscribing to a kind outside that set fails
//! with [`SignalError::UnknownSignal`].  Kinds are small `Copy` enums
//! declared next to the component that owns the bus, so every component's
//! signal vocabulary is visible in one place.
//!
//! # Delivery model
//!
//! `emit` runs every live subscriber synchronously on the emitting thread,
//! in no guaranteed order.  Subscribers that need to defer work should
//! register through a [`CallbackQueue`](crate::queue::CallbackQueue) proxy
//! instead of blocking the emitter.
//!
//! # Subscriber lifetime
//!
//! Subscribers are held as [`Weak`] references.  A callback that is kept
//! alive only by the bus disappears together with its owner; callers must
//! anchor the `Arc` they subscribe for as long as they want deliveries.
//! Re-subscribing the same `Arc` is idempotent, and unsubscribing a
//! callback that was never registered fails with
//! [`SignalError::NotSubscribed`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::error::{Result, SignalError};

/// Marker bounds for a signal-kind enum.
///
/// Implemented automatically for any `Copy + Eq + Hash + Debug` type, which
/// is what a `#[derive]`d fieldless enum gives you.
pub trait SignalKind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> SignalKind for T where T: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// A subscriber callback: receives the signal kind and a reference to the
/// emitted value.
pub type SignalHandler<K, V> = dyn Fn(K, &V) + Send + Sync;

/// A value predicate installed for a single signal kind at construction.
pub type ValueCheck<V> = Box<dyn Fn(&V) -> bool + Send + Sync>;

/// Wrap a closure into the `Arc` form the bus subscribes.
pub fn handler<K, V, F>(f: F) -> Arc<SignalHandler<K, V>>
where
    K: SignalKind,
    V: Send + Sync + 'static,
    F: Fn(K, &V) + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Subscriber<K, V>
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    /// Identity of the subscribed `Arc` allocation.
    key: usize,
    callback: Weak<SignalHandler<K, V>>,
}

struct BusInner<K, V>
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    /// One subscriber list per declared kind.  Kinds are inserted at
    /// construction and never added afterwards; a missing key therefore
    /// means "unknown signal".
    subscribers: DashMap<K, Vec<Subscriber<K, V>>>,
    /// Optional value predicates, also fixed at construction.
    checks: HashMap<K, ValueCheck<V>>,
}

/// Named, typed broadcast channels on an object.
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
pub struct SignalBus<K, V>
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    inner: Arc<BusInner<K, V>>,
}

impl<K, V> Clone for SignalBus<K, V>
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> SignalBus<K, V>
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    /// Create a bus with the given declared signal set and no value checks.
    #[must_use]
    pub fn new<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        Self::new_checked(kinds, Vec::new())
    }

    /// Create a bus with declared signals and per-kind value predicates.
    ///
    /// A predicate listed for a kind outside `kinds` is ignored.
    #[must_use]
    pub fn new_checked<I>(kinds: I, checks: Vec<(K, ValueCheck<V>)>) -> Self
    where
        I: IntoIterator<Item = K>,
    {
        let subscribers = DashMap::new();
        for kind in kinds {
            subscribers.insert(kind, Vec::new());
        }
        let checks = checks
            .into_iter()
            .filter(|(kind, _)| subscribers.contains_key(kind))
            .collect();
        Self {
            inner: Arc::new(BusInner {
                subscribers,
                checks,
            }),
        }
    }

    /// Emit a signal, synchronously invoking every live subscriber on the
    /// caller's thread.
    ///
    /// The value is validated against the kind's predicate (if any) before
    /// any subscriber runs.  Dead subscribers are pruned along the way.
    pub fn emit(&self, kind: K, value: V) -> Result<()> {
        if let Some(check) = self.inner.checks.get(&kind) {
            if !check(&value) {
                return Err(SignalError::InvalidValue {
                    signal: format!("{kind:?}"),
                });
            }
        }

        let callbacks: Vec<Arc<SignalHandler<K, V>>> = {
            let mut entry = self.inner.subscribers.get_mut(&kind).ok_or_else(|| {
                SignalError::UnknownSignal {
                    signal: format!("{kind:?}"),
                }
            })?;
            entry.retain(|s| s.callback.strong_count() > 0);
            entry.iter().filter_map(|s| s.callback.upgrade()).collect()
        };

        tracing::trace!(signal = ?kind, subscribers = callbacks.len(), "signal emitted");

        for callback in callbacks {
            callback(kind, &value);
        }
        Ok(())
    }

    /// Register a callback for a signal kind.
    ///
    /// The bus holds the callback weakly; the caller must keep the `Arc`
    /// alive elsewhere.  Registering the same `Arc` twice is a no-op.
    pub fn subscribe(&self, kind: K, callback: &Arc<SignalHandler<K, V>>) -> Result<()> {
        let key = callback_key(callback);
        let mut entry = self.inner.subscribers.get_mut(&kind).ok_or_else(|| {
            SignalError::UnknownSignal {
                signal: format!("{kind:?}"),
            }
        })?;
        entry.retain(|s| s.callback.strong_count() > 0);
        if entry.iter().any(|s| s.key == key) {
            return Ok(());
        }
        entry.push(Subscriber {
            key,
            callback: Arc::downgrade(callback),
        });
        Ok(())
    }

    /// Remove a previously registered callback.
    pub fn unsubscribe(&self, kind: K, callback: &Arc<SignalHandler<K, V>>) -> Result<()> {
        let key = callback_key(callback);
        let mut entry = self.inner.subscribers.get_mut(&kind).ok_or_else(|| {
            SignalError::UnknownSignal {
                signal: format!("{kind:?}"),
            }
        })?;
        let before = entry.len();
        entry.retain(|s| s.key != key);
        if entry.len() == before {
            return Err(SignalError::NotSubscribed {
                signal: format!("{kind:?}"),
            });
        }
        Ok(())
    }

    /// Number of live subscribers for a signal kind.
    pub fn subscriber_count(&self, kind: K) -> Result<usize> {
        let entry = self.inner.subscribers.get(&kind).ok_or_else(|| {
            SignalError::UnknownSignal {
                signal: format!("{kind:?}"),
            }
        })?;
        Ok(entry
            .iter()
            .filter(|s| s.callback.strong_count() > 0)
            .count())
    }
}

fn callback_key<K, V>(callback: &Arc<SignalHandler<K, V>>) -> usize
where
    K: SignalKind,
    V: Send + Sync + 'static,
{
    Arc::as_ptr(callback) as *const () as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

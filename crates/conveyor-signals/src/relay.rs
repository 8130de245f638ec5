//! Relay and bound-callback helpers.
//!
//! Two small building blocks used to wire buses together:
//!
//! - [`relay`] returns a handler that re-emits whatever it receives on a
//!   second bus, under a possibly different signal kind.
//! - [`bound`] wraps a method of a weakly-held owner, so that dropping the
//!   owner silently retires the subscription instead of leaving a dead
//!   callback behind.

use std::sync::Arc;

use crate::bus::{SignalBus, SignalHandler, SignalKind, handler};

/// Build a handler that forwards every received value to `target`, emitted
/// as `target_kind`.
///
/// Forwarding failures are logged and swallowed; a relay is fire-and-forget
/// by construction.
pub fn relay<K1, K2, V>(target: &SignalBus<K2, V>, target_kind: K2) -> Arc<SignalHandler<K1, V>>
where
    K1: SignalKind,
    K2: SignalKind,
    V: Clone + Send + Sync + 'static,
{
    let target = target.clone();
    handler(move |kind: K1, value: &V| {
        if let Err(err) = target.emit(target_kind, value.clone()) {
            tracing::error!(source_signal = ?kind, target_signal = ?target_kind, error = %err, "signal relay failed");
        }
    })
}

/// Build a handler that invokes `method` on `owner` for as long as the
/// owner is alive.  Once the owner is dropped the handler becomes a no-op,
/// and the bus's weak subscriber table will prune it on the next emission.
pub fn bound<T, K, V, F>(owner: &Arc<T>, method: F) -> Arc<SignalHandler<K, V>>
where
    T: Send + Sync + 'static,
    K: SignalKind,
    V: Send + Sync + 'static,
    F: Fn(&T, K, &V) + Send + Sync + 'static,
{
    let owner = Arc::downgrade(owner);
    handler(move |kind, value: &V| {
        if let Some(owner) = owner.upgrade() {
            method(&owner, kind, value);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Upstream {
        Fired,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Downstream {
        Renamed,
    }

    #[test]
    fn relay_reemits_under_new_kind() {
        let upstream: SignalBus<Upstream, String> = SignalBus::new([Upstream::Fired]);
        let downstream: SignalBus<Downstream, String> = SignalBus::new([Downstream::Renamed]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            handler(move |kind, value: &String| {
                assert_eq!(kind, Downstream::Renamed);
                seen.lock().unwrap().push(value.clone());
            })
        };
        downstream.subscribe(Downstream::Renamed, &sink).unwrap();

        let bridge = relay(&downstream, Downstream::Renamed);
        upstream.subscribe(Upstream::Fired, &bridge).unwrap();

        upstream.emit(Upstream::Fired, "hello".to_string()).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &["hello".to_string()]);
    }

    #[test]
    fn bound_handler_dies_with_owner() {
        struct Counter(AtomicU32);

        let bus: SignalBus<Upstream, u32> = SignalBus::new([Upstream::Fired]);
        let owner = Arc::new(Counter(AtomicU32::new(0)));

        let cb = bound(&owner, |c: &Counter, _, value: &u32| {
            c.0.fetch_add(*value, Ordering::SeqCst);
        });
        bus.subscribe(Upstream::Fired, &cb).unwrap();

        bus.emit(Upstream::Fired, 5).unwrap();
        assert_eq!(owner.0.load(Ordering::SeqCst), 5);

        let weak = Arc::downgrade(&owner);
        drop(owner);
        bus.emit(Upstream::Fired, 7).unwrap();
        assert!(weak.upgrade().is_none());
    }
}

//! Integration tests for the conveyor-signals crate.
//!
//! These exercise the bus and the callback queue together the way the
//! scheduler uses them: emissions on arbitrary threads, handlers serialised
//! onto one worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use conveyor_signals::{CallbackQueue, SignalBus, handler, relay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Stage {
    Produced,
    Forwarded,
}

#[test]
fn concurrent_emitters_are_serialised_by_the_queue() {
    let queue = CallbackQueue::new();
    queue.start().unwrap();

    let bus: SignalBus<Stage, u32> = SignalBus::new([Stage::Produced]);
    let total = Arc::new(AtomicU32::new(0));

    let original = {
        let total = Arc::clone(&total);
        handler(move |_, value: &u32| {
            total.fetch_add(*value, Ordering::SeqCst);
        })
    };
    let wrapped = queue.proxy(&original);
    bus.subscribe(Stage::Produced, &wrapped).unwrap();

    let mut emitters = Vec::new();
    for _ in 0..8 {
        let bus = bus.clone();
        emitters.push(thread::spawn(move || {
            for _ in 0..50 {
                bus.emit(Stage::Produced, 1).unwrap();
            }
        }));
    }
    for emitter in emitters {
        emitter.join().unwrap();
    }

    // Flush everything enqueued so far.
    queue.exec_blocking(|| (), None).unwrap();
    assert_eq!(total.load(Ordering::SeqCst), 400);

    queue.stop().unwrap();
}

#[test]
fn relayed_signals_keep_their_payload() {
    let upstream: SignalBus<Stage, String> = SignalBus::new([Stage::Produced]);
    let downstream: SignalBus<Stage, String> = SignalBus::new([Stage::Forwarded]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        handler(move |kind, value: &String| {
            assert_eq!(kind, Stage::Forwarded);
            seen.lock().unwrap().push(value.clone());
        })
    };
    downstream.subscribe(Stage::Forwarded, &sink).unwrap();

    let bridge = relay(&downstream, Stage::Forwarded);
    upstream.subscribe(Stage::Produced, &bridge).unwrap();

    upstream.emit(Stage::Produced, "one".into()).unwrap();
    upstream.emit(Stage::Produced, "two".into()).unwrap();

    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &["one".to_string(), "two".to_string()]
    );
}

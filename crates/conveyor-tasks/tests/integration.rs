//! Integration tests for the conveyor-tasks crate.
//!
//! These exercise the executor and the datalog as integrated subsystems:
//! a bounded pool draining a backlog, and a log coordinating producers
//! with a blocked consumer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use conveyor_signals::handler;
use conveyor_tasks::{
    Datalog, FnTask, PoolSignal, TaskError, TaskHandle, TaskNotice, TaskResult, ThreadExecutor,
};

#[test]
fn bounded_pool_drains_a_backlog() -> Result<()> {
    let pool = ThreadExecutor::new(Some(2));
    let finished = Arc::new(AtomicU32::new(0));

    let sink = {
        let finished = Arc::clone(&finished);
        handler(move |_, _: &TaskNotice| {
            finished.fetch_add(1, Ordering::SeqCst);
        })
    };
    pool.signals().subscribe(PoolSignal::TaskCompleted, &sink)?;

    let mut backlog: Vec<TaskHandle> = (0..6)
        .map(|i| FnTask::handle(move || Ok(json!(i))))
        .collect();

    // Feed the backlog through two slots, completing as we go.
    let mut running: Vec<TaskHandle> = Vec::new();
    while !backlog.is_empty() || !running.is_empty() {
        while let Some(task) = backlog.pop() {
            match pool.submit(Arc::clone(&task)) {
                Ok(()) => running.push(task),
                Err(TaskError::NoFreeSlot) => {
                    backlog.push(task);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(task) = running.pop() {
            assert!(pool.wait(&task, None)?);
            pool.complete(&task)?;
        }
    }

    assert_eq!(finished.load(Ordering::SeqCst), 6);
    assert_eq!(pool.running_count()?, 0);
    Ok(())
}

#[test]
fn completion_notice_carries_the_task_result() -> Result<()> {
    let pool = ThreadExecutor::new(None);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let sink = {
        let outcomes = Arc::clone(&outcomes);
        handler(move |_, notice: &TaskNotice| {
            outcomes.lock().unwrap().push(notice.result.clone());
        })
    };
    pool.signals().subscribe(PoolSignal::TaskCompleted, &sink)?;

    let ok = FnTask::handle(|| Ok(json!(42)));
    let bad = FnTask::handle(|| Err(TaskError::failed("expected")));

    pool.submit(Arc::clone(&ok))?;
    assert!(pool.wait(&ok, None)?);
    pool.complete(&ok)?;

    pool.submit(Arc::clone(&bad))?;
    assert!(pool.wait(&bad, None)?);
    pool.complete(&bad)?;

    let outcomes = outcomes.lock().unwrap();
    assert!(matches!(
        outcomes[0],
        Some(TaskResult::Completed(ref v)) if *v == json!(42)
    ));
    assert!(matches!(outcomes[1], Some(TaskResult::Failed(_))));
    Ok(())
}

#[test]
fn stop_capability_unblocks_a_waiting_pool() -> Result<()> {
    struct Looper(AtomicBool);
    impl conveyor_tasks::Task for Looper {
        fn start(&self) -> conveyor_tasks::Result<serde_json::Value> {
            while !self.0.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            Ok(serde_json::Value::Null)
        }
        fn supports_stop(&self) -> bool {
            true
        }
        fn stop(&self) -> conveyor_tasks::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    let pool = ThreadExecutor::new(Some(1));
    let task: TaskHandle = Arc::new(Looper(AtomicBool::new(false)));

    pool.submit(Arc::clone(&task))?;
    assert!(!pool.wait(&task, Some(Duration::from_millis(10)))?);

    pool.stop_task(&task)?;
    assert!(pool.wait(&task, None)?);
    pool.complete(&task)?;
    Ok(())
}

#[test]
fn datalog_coordinates_producer_and_consumer() -> Result<()> {
    let log: Datalog<(String, u32)> = Datalog::new();

    let producer = {
        let log = log.clone();
        thread::spawn(move || {
            for i in 0..3 {
                thread::sleep(Duration::from_millis(10));
                log.append(("step".to_string(), i)).unwrap();
            }
        })
    };

    let hit = log.wait_matching(|(name, i)| name == "step" && *i == 2, None)?;
    assert_eq!(hit, Some(("step".to_string(), 2)));
    producer.join().unwrap();

    // The log saw every append, in order.
    let names: Vec<u32> = log.iterate()?.into_iter().map(|(_, i)| i).collect();
    assert_eq!(names, vec![0, 1, 2]);
    Ok(())
}

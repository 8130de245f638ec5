//! Task execution primitives for the conveyor job runtime.
//!
//! This crate provides:
//!
//! - **[`task`]** -- the [`Task`] trait (blocking `start`, optional
//!   stop/terminate capabilities), the tagged [`TaskResult`], and the
//!   [`FnTask`] closure adapter.
//! - **[`threaded`]** -- [`ThreadedTask`]: one task on one dedicated
//!   thread with lifecycle signals and panic capture.
//! - **[`executor`]** -- [`ThreadExecutor`]: a bounded worker pool with
//!   non-blocking submission, slot reservation, and a single pool-level
//!   completion signal.
//! - **[`datalog`]** -- [`Datalog`]: an append-only, snapshot-iterated
//!   in-memory log.
//! - **[`critical`]** -- [`CriticalSection`]: `Result`-based mutex
//!   acquisition shared by the pieces above.
//!
//! All public types are `Send + Sync`; tasks run on plain OS threads.

pub mod critical;
pub mod datalog;
pub mod error;
pub mod executor;
pub mod task;
pub mod threaded;

pub use critical::CriticalSection;
pub use datalog::{Datalog, DatalogSignal};
pub use error::{Result, TaskError};
pub use executor::{PoolSignal, SlotReservation, ThreadExecutor};
pub use task::{FnTask, Task, TaskHandle, TaskKey, TaskNotice, TaskOutput, TaskResult};
pub use threaded::{TaskSignal, ThreadedTask};

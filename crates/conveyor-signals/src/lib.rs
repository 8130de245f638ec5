//! Signal plumbing for the conveyor job runtime.
//!
//! This crate provides the two primitives every other conveyor component is
//! built from:
//!
//! - **[`bus`]** -- [`SignalBus`]: named, typed broadcast channels with a
//!   declared signal set, optional value predicates, and weakly-held
//!   subscribers.
//! - **[`queue`]** -- [`CallbackQueue`]: a single worker thread draining a
//!   channel of closures, used as the single writer for a component's
//!   mutable state.  Signal handlers can be marshalled onto it with
//!   [`CallbackQueue::proxy`].
//! - **[`relay`]** -- helpers to forward signals between buses and to bind
//!   handlers to weakly-held owners.
//!
//! All public types are `Send + Sync`; emission is synchronous on the
//! emitting thread unless routed through a queue proxy.

pub mod bus;
pub mod error;
pub mod queue;
pub mod relay;

pub use bus::{SignalBus, SignalHandler, SignalKind, ValueCheck, handler};
pub use error::{Result, SignalError};
pub use queue::CallbackQueue;
pub use relay::{bound, relay};

//! # Concurrency primitives underpinning the engine.
//!
//! Leaf building blocks used by the supervisor, topics, and scheduler:
//! - [`TaskSet`] - wait for any of a dynamically changing set of tasks
//! - [`ReservationLock`] - reservation-gated mutual exclusion
//! - [`DelayedThrottle`] - collapse bursts into one delayed invocation
//! - [`Memoized`] - compute-once slot for an expensive async initializer
//! - [`Parker`] - multi-holder flow-control gate

mod memo;
mod parker;
mod reserve;
mod task_set;
mod throttle;

pub use memo::Memoized;
pub use parker::Parker;
pub use reserve::{ReservationLock, ReservationToken};
pub use task_set::{FinishedTask, TaskHandle, TaskSet};
pub use throttle::DelayedThrottle;

pub(crate) use task_set::flatten_join;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard if a holder panicked.
pub(crate) fn hold<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

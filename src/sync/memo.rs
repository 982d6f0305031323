//! # Compute-once slot for an expensive async initializer.
//!
//! [`Memoized`] runs a fallible async initializer at most once per
//! "generation": concurrent `get` callers share a single in-flight run,
//! a success freezes the value until [`Memoized::clear`], and a failure
//! empties the slot so the next caller retries.
//!
//! A generation counter guards the slot against stale writers: a `clear`
//! racing an in-flight run bumps the generation, so the finishing run
//! discards its result instead of resurrecting a value that was just
//! invalidated.
//!
//! Backs the shared broker channel: many publishers call `get`
//! concurrently, one connect attempt runs, all observe the same outcome.

use std::future::Future;
use std::sync::Mutex;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use super::hold;

type InitFn<T, E> = Box<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type SharedInit<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Shared slot holding the result of an async initializer.
pub struct Memoized<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    init: InitFn<T, E>,
    state: Mutex<MemoState<T, E>>,
}

struct MemoState<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    generation: u64,
    slot: Slot<T, E>,
}

enum Slot<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    Empty,
    InFlight(SharedInit<T, E>),
    Ready(T),
}

impl<T, E> Memoized<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty slot that will run `init` on first `get`.
    pub fn new<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            init: Box::new(move || init().boxed()),
            state: Mutex::new(MemoState {
                generation: 0,
                slot: Slot::Empty,
            }),
        }
    }

    /// Returns the memoized value, running the initializer if needed.
    ///
    /// Concurrent callers share one initializer run and all receive its
    /// outcome. `Err` empties the slot, so a later call retries.
    pub async fn get(&self) -> Result<T, E> {
        let (shared, generation) = {
            let mut state = hold(&self.state);
            match &state.slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::InFlight(shared) => (shared.clone(), state.generation),
                Slot::Empty => {
                    let shared = (self.init)().shared();
                    state.slot = Slot::InFlight(shared.clone());
                    (shared, state.generation)
                }
            }
        };

        let result = shared.await;

        let mut state = hold(&self.state);
        if state.generation == generation {
            state.generation += 1;
            state.slot = match &result {
                Ok(value) => Slot::Ready(value.clone()),
                Err(_) => Slot::Empty,
            };
        }
        result
    }

    /// Invalidates the slot. The next `get` reruns the initializer; an
    /// in-flight run finishes but its result is discarded.
    pub fn clear(&self) {
        let mut state = hold(&self.state);
        state.generation += 1;
        state.slot = Slot::Empty;
    }

    /// Returns the memoized value without triggering the initializer.
    pub fn peek(&self) -> Option<T> {
        match &hold(&self.state).slot {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }
}

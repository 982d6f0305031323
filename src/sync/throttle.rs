//! # Collapse bursts of calls into one delayed invocation.
//!
//! [`DelayedThrottle`] wraps an async callback and guarantees at most one
//! invocation per delay window. Calls landing inside an open window only
//! replace the pending argument; when the window closes, the callback runs
//! once with the most recent argument.
//!
//! Used for cursor persistence: a burst of cursor updates becomes a single
//! store write carrying the latest position.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;

type ThrottledFn<T> = Box<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Burst-coalescing wrapper around an async callback.
///
/// Cheap to clone; clones share the same window and pending argument.
pub struct DelayedThrottle<T: Send + 'static> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T: Send + 'static> Clone for DelayedThrottle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ThrottleInner<T> {
    delay: Duration,
    call: ThrottledFn<T>,
    state: Mutex<ThrottleState<T>>,
}

struct ThrottleState<T> {
    args: Option<T>,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DelayedThrottle<T> {
    /// Wraps `call` so it runs at most once per `delay` window.
    pub fn new<F, Fut>(delay: Duration, call: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(ThrottleInner {
                delay,
                call: Box::new(move |args| call(args).boxed()),
                state: Mutex::new(ThrottleState {
                    args: None,
                    pending: None,
                }),
            }),
        }
    }

    /// Records `args` for the next invocation, opening a delay window if
    /// none is open. Within a window, later calls replace earlier args.
    pub async fn call(&self, args: T) {
        let mut state = self.inner.state.lock().await;
        state.args = Some(args);
        if state.pending.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        state.pending = Some(tokio::spawn(async move {
            time::sleep(inner.delay).await;
            let mut state = inner.state.lock().await;
            state.pending = None;
            if let Some(args) = state.args.take() {
                // Invoked under the state lock so a concurrent flush cannot
                // run the callback a second time with the same args.
                (inner.call)(args).await;
            }
        }));
    }

    /// Runs the pending invocation now, if any, cancelling its window.
    pub async fn flush(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        if let Some(args) = state.args.take() {
            (self.inner.call)(args).await;
        }
    }

    /// Discards the pending invocation, if any, without running it.
    pub async fn cancel(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.args = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (DelayedThrottle<u64>, Arc<StdMutex<Vec<u64>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let throttle = DelayedThrottle::new(Duration::from_millis(100), move |v| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(v);
            }
        });
        (throttle, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_args() {
        let (throttle, seen) = recorder();
        throttle.call(1).await;
        throttle.call(2).await;
        throttle.call(3).await;

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), [3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_each_invoke() {
        let (throttle, seen) = recorder();
        throttle.call(1).await;
        time::sleep(Duration::from_millis(150)).await;
        throttle.call(2).await;
        time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*seen.lock().unwrap(), [1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_runs_immediately_once() {
        let (throttle, seen) = recorder();
        throttle.call(7).await;
        throttle.flush().await;
        assert_eq!(*seen.lock().unwrap(), [7]);

        // The aborted window must not fire again.
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*seen.lock().unwrap(), [7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_pending_is_noop() {
        let (throttle, seen) = recorder();
        throttle.flush().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_pending() {
        let (throttle, seen) = recorder();
        throttle.call(9).await;
        throttle.cancel().await;

        time::sleep(Duration::from_millis(200)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_one_window() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let throttle = DelayedThrottle::new(Duration::from_millis(100), move |_: u64| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let clone = throttle.clone();
        throttle.call(1).await;
        clone.call(2).await;
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

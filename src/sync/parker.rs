//! # Multi-holder flow-control gate.
//!
//! [`Parker`] blocks a loop while any holder keeps it parked. Holders are
//! named; the gate opens only when the last holder unparks. Used to pause
//! queue fetching while the executor or resource pool is saturated.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::hold;

/// Named multi-holder gate.
///
/// Cheap to clone; clones share the same holder set.
#[derive(Clone, Default)]
pub struct Parker {
    inner: Arc<ParkerInner>,
}

#[derive(Default)]
struct ParkerInner {
    holders: Mutex<HashSet<String>>,
    changed: Notify,
}

impl Parker {
    /// Creates an open gate with no holders.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the gate on behalf of `holder`. Parking twice under the same
    /// name is a no-op.
    pub fn park(&self, holder: impl Into<String>) {
        hold(&self.inner.holders).insert(holder.into());
    }

    /// Removes `holder` from the gate; opens it when no holders remain.
    pub fn unpark(&self, holder: &str) {
        let mut holders = hold(&self.inner.holders);
        if holders.remove(holder) && holders.is_empty() {
            self.inner.changed.notify_waiters();
        }
    }

    /// Returns `true` while any holder keeps the gate closed.
    pub fn parked(&self) -> bool {
        !hold(&self.inner.holders).is_empty()
    }

    /// Suspends until the gate is open.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.parked() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_open_gate_passes_immediately() {
        let parker = Parker::new();
        assert!(!parker.parked());
        parker.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_unpark() {
        let parker = Parker::new();
        parker.park("executor");
        assert!(timeout(Duration::from_millis(10), parker.wait())
            .await
            .is_err());

        let waiter = {
            let parker = parker.clone();
            tokio::spawn(async move { parker.wait().await })
        };
        parker.unpark("executor");
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_gate_opens_only_after_last_holder() {
        let parker = Parker::new();
        parker.park("a");
        parker.park("b");

        parker.unpark("a");
        assert!(parker.parked());
        assert!(timeout(Duration::from_millis(10), parker.wait())
            .await
            .is_err());

        parker.unpark("b");
        assert!(!parker.parked());
        parker.wait().await;
    }

    #[tokio::test]
    async fn test_duplicate_park_needs_one_unpark() {
        let parker = Parker::new();
        parker.park("x");
        parker.park("x");
        parker.unpark("x");
        assert!(!parker.parked());
    }

    #[tokio::test]
    async fn test_unpark_unknown_holder_is_noop() {
        let parker = Parker::new();
        parker.park("a");
        parker.unpark("ghost");
        assert!(parker.parked());
    }
}

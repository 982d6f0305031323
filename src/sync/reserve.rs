//! # Reservation-gated mutual exclusion.
//!
//! [`ReservationLock`] splits acquisition in two phases: a caller first
//! *reserves* (bounded by a configurable slot count), then *acquires* the
//! exclusive lock through its [`ReservationToken`]. Holding a reservation
//! without the lock is how a publisher queues up behind the current leader
//! without unbounded pile-up.
//!
//! ## Rules
//! - At most `max_reservations` tokens exist at once (`0` = unbounded).
//! - At most one token holds the lock at any moment.
//! - `acquire` on a token that already holds the lock is a no-op.
//! - Dropping a token releases both the lock (if held) and the reservation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Reservation-gated exclusive lock.
///
/// Cheap to clone; clones share the same slots and lock.
#[derive(Clone)]
pub struct ReservationLock {
    inner: Arc<LockInner>,
}

struct LockInner {
    slots: Option<Arc<Semaphore>>,
    mutex: Arc<Mutex<()>>,
    /// Id of the token currently holding the lock; `0` means none.
    locker: AtomicU64,
    next_id: AtomicU64,
}

/// A held reservation, and possibly the lock itself.
///
/// Obtained from [`ReservationLock::reserve`]. The reservation slot is
/// freed when the token is dropped; the lock, if held, is released first.
pub struct ReservationToken {
    id: u64,
    inner: Arc<LockInner>,
    guard: Option<OwnedMutexGuard<()>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl ReservationLock {
    /// Creates a lock admitting at most `max_reservations` concurrent
    /// reservations. `0` means unbounded.
    pub fn new(max_reservations: usize) -> Self {
        Self {
            inner: Arc::new(LockInner {
                slots: (max_reservations > 0)
                    .then(|| Arc::new(Semaphore::new(max_reservations))),
                mutex: Arc::new(Mutex::new(())),
                locker: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Takes a reservation slot, suspending while all slots are taken.
    pub async fn reserve(&self) -> ReservationToken {
        let permit = match &self.inner.slots {
            Some(slots) => Some(
                Arc::clone(slots)
                    .acquire_owned()
                    .await
                    .expect("reservation slots are never closed"),
            ),
            None => None,
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        ReservationToken {
            id,
            inner: Arc::clone(&self.inner),
            guard: None,
            _permit: permit,
        }
    }

    /// Returns `true` while some token holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.locker.load(Ordering::Acquire) != 0
    }

    /// Returns `true` while the lock is held or every reservation slot is
    /// taken. Always equals `locked()` for unbounded locks.
    pub fn locked_or_reserving(&self) -> bool {
        if self.locked() {
            return true;
        }
        match &self.inner.slots {
            Some(slots) => slots.available_permits() == 0,
            None => false,
        }
    }
}

impl ReservationToken {
    /// Acquires the exclusive lock, suspending while another token holds
    /// it. A token that already holds the lock returns immediately.
    pub async fn acquire(&mut self) {
        if self.guard.is_some() {
            return;
        }
        let guard = Arc::clone(&self.inner.mutex).lock_owned().await;
        self.inner.locker.store(self.id, Ordering::Release);
        self.guard = Some(guard);
    }

    /// Releases the lock if this token holds it. The reservation stays.
    pub fn release(&mut self) {
        if let Some(guard) = self.guard.take() {
            // Clear the id before the mutex opens so a racing `locked()`
            // never reports this token after the lock changed hands.
            self.inner.locker.store(0, Ordering::Release);
            drop(guard);
        }
    }

    /// Returns `true` while this token holds the lock.
    pub fn locked(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_acquire_is_idempotent_per_token() {
        let lock = ReservationLock::new(2);
        let mut token = lock.reserve().await;
        token.acquire().await;
        assert!(token.locked());
        // Re-acquiring from the holder must not deadlock.
        token.acquire().await;
        assert!(token.locked());
        assert!(lock.locked());

        token.release();
        assert!(!token.locked());
        assert!(!lock.locked());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_across_tokens() {
        let lock = ReservationLock::new(2);
        let mut first = lock.reserve().await;
        let mut second = lock.reserve().await;

        first.acquire().await;
        assert!(timeout(Duration::from_millis(10), second.acquire())
            .await
            .is_err());

        first.release();
        second.acquire().await;
        assert!(second.locked());
        assert!(!first.locked());
    }

    #[tokio::test]
    async fn test_capacity_bounds_reservations() {
        let lock = ReservationLock::new(1);
        let token = lock.reserve().await;
        assert!(lock.locked_or_reserving());

        assert!(timeout(Duration::from_millis(10), lock.reserve())
            .await
            .is_err());

        drop(token);
        let _again = lock.reserve().await;
    }

    #[tokio::test]
    async fn test_drop_releases_lock_and_slot() {
        let lock = ReservationLock::new(1);
        {
            let mut token = lock.reserve().await;
            token.acquire().await;
            assert!(lock.locked());
        }
        assert!(!lock.locked());
        assert!(!lock.locked_or_reserving());

        let mut token = lock.reserve().await;
        token.acquire().await;
        assert!(lock.locked());
    }

    #[tokio::test]
    async fn test_unbounded_lock_never_reports_reserving() {
        let lock = ReservationLock::new(0);
        let _a = lock.reserve().await;
        let _b = lock.reserve().await;
        assert!(!lock.locked_or_reserving());
    }
}

//! Cursor persistence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::JobError;
use crate::sync::hold;

use super::Cursor;

/// Persists one job's resume cursor.
///
/// Writes may be buffered; `flush` forces them out. A store is scoped to
/// a single job.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Loads the last saved cursor, or `None` for a fresh job.
    async fn load_cursor(&self) -> Result<Option<Cursor>, JobError>;

    /// Records `cursor` as the resume position.
    async fn save_cursor(&self, cursor: Cursor) -> Result<(), JobError>;

    /// Forces buffered writes out.
    async fn flush(&self) -> Result<(), JobError>;
}

/// Volatile in-process store, for embedded jobs and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    cursor: Mutex<Option<Cursor>>,
    saves: AtomicUsize,
}

impl MemoryJobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already positioned at `cursor`.
    pub fn with_cursor(cursor: impl Into<Cursor>) -> Self {
        Self {
            cursor: Mutex::new(Some(cursor.into())),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of saves performed, for diagnostics.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load_cursor(&self) -> Result<Option<Cursor>, JobError> {
        Ok(hold(&self.cursor).clone())
    }

    async fn save_cursor(&self, cursor: Cursor) -> Result<(), JobError> {
        *hold(&self.cursor) = Some(cursor);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<(), JobError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let store = MemoryJobStore::new();
        assert!(store.load_cursor().await.unwrap().is_none());

        store.save_cursor("41".into()).await.unwrap();
        store.save_cursor("42".into()).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap().as_deref(), Some("42"));
        assert_eq!(store.save_count(), 2);
    }
}

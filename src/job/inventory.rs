//! Inventories: ordered item sources walked in batches.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::JobError;

use super::Cursor;

/// One inventory item: a work unit plus the cursor that resumes after it.
#[derive(Clone, Debug)]
pub struct InventoryItem {
    /// Stable item id, used as the message id downstream.
    pub id: String,

    /// Cursor positioned just past this item.
    pub cursor: Cursor,

    /// Arguments describing the work unit.
    pub args: Map<String, Value>,
}

/// An ordered source of work items.
///
/// Batches must be stable with respect to cursors: `next_batch` with the
/// cursor of item `n` returns items strictly after `n`, and an empty
/// batch means the inventory is exhausted.
#[async_trait]
pub trait Inventory: Send + Sync + 'static {
    /// Returns the next batch after `after`, or an empty batch at the end.
    async fn next_batch(&self, after: Option<Cursor>) -> Result<Vec<InventoryItem>, JobError>;
}

/// Inventory over the integer range `0..end`.
///
/// Cursors are decimal indices. Mostly useful for tests and for jobs
/// whose items are naturally index-addressable.
pub struct RangeInventory {
    end: u64,
    batch: usize,
}

impl RangeInventory {
    /// Inventory of `end` items fetched `batch` at a time.
    pub fn new(end: u64, batch: usize) -> Self {
        Self { end, batch }
    }
}

#[async_trait]
impl Inventory for RangeInventory {
    async fn next_batch(&self, after: Option<Cursor>) -> Result<Vec<InventoryItem>, JobError> {
        let start = match after {
            None => 0,
            Some(cursor) => {
                let index: u64 = cursor.parse().map_err(|_| JobError::BadCursor {
                    cursor: cursor.clone(),
                })?;
                index + 1
            }
        };

        let items = (start..self.end)
            .take(self.batch)
            .map(|index| {
                let mut args = Map::new();
                args.insert("index".into(), index.into());
                InventoryItem {
                    id: format!("item-{index}"),
                    cursor: index.to_string(),
                    args,
                }
            })
            .collect();
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batches_walk_the_range() {
        let inventory = RangeInventory::new(5, 2);

        let first = inventory.next_batch(None).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].cursor, "0");

        let second = inventory.next_batch(Some("1".into())).await.unwrap();
        assert_eq!(second[0].cursor, "2");

        let tail = inventory.next_batch(Some("3".into())).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, "item-4");

        assert!(inventory.next_batch(Some("4".into())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_cursor_is_rejected() {
        let inventory = RangeInventory::new(5, 2);
        assert!(matches!(
            inventory.next_batch(Some("not a number".into())).await,
            Err(JobError::BadCursor { cursor }) if cursor == "not a number"
        ));
    }
}

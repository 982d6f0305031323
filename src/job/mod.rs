//! # Batch jobs as topics.
//!
//! A job walks an [`Inventory`] in batches and exposes the items as a
//! consume-only [`Topic`](crate::topics::Topic). Progress is a [`Cursor`]
//! persisted through a [`JobStore`], so an interrupted job resumes where
//! it stopped instead of replaying the whole inventory.
//!
//! ```text
//!   JobStore ──cursor──▶ Inventory ──batch──▶ buffer ──▶ next()
//!       ▲                                        │
//!       └───── throttled save ◀── item yielded ──┘
//! ```

mod inventory;
mod store;
mod topic;

pub use inventory::{Inventory, InventoryItem, RangeInventory};
pub use store::{JobStore, MemoryJobStore};
pub use topic::JobTopic;

/// Opaque resume position within an inventory.
///
/// Produced by the inventory alongside each item; interpreted only by the
/// inventory that minted it.
pub type Cursor = String;

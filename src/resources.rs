//! # Leasable named resources.
//!
//! [`ResourcesManager`] pools [`Resource`]s by type. Pipelines declare the
//! resource types they need; the executor leases one resource per type
//! before running and returns it after. Removal of a leased resource is
//! deferred until its lease comes back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::sync::hold;

/// One leasable resource: a named instance of a resource type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    /// Instance name, unique within its type.
    pub name: String,

    /// Resource type, matched against pipeline requirements.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Free-form description merged into pipeline args on lease.
    #[serde(default)]
    pub data: Value,
}

/// Pools resources by type and hands out leases.
///
/// Cheap to clone; clones share the pools.
#[derive(Clone, Default)]
pub struct ResourcesManager {
    inner: Arc<ManagerInner>,
}

#[derive(Default)]
struct ManagerInner {
    pools: Mutex<HashMap<String, TypePool>>,
    changed: Notify,
}

#[derive(Default)]
struct TypePool {
    available: VecDeque<Resource>,
    leased: HashSet<String>,
    dropped: HashSet<String>,
}

impl ResourcesManager {
    /// Creates a manager with no resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `resource` to its type pool, replacing an available resource
    /// of the same name and cancelling any pending removal.
    pub fn add(&self, resource: Resource) {
        {
            let mut pools = hold(&self.inner.pools);
            let pool = pools.entry(resource.type_name.clone()).or_default();
            pool.dropped.remove(&resource.name);
            pool.available.retain(|r| r.name != resource.name);
            if !pool.leased.contains(&resource.name) {
                pool.available.push_back(resource);
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Removes the resource named `name` from the `type_name` pool.
    ///
    /// A leased resource is not reclaimed; it is discarded when its lease
    /// returns.
    pub fn remove(&self, type_name: &str, name: &str) {
        let mut pools = hold(&self.inner.pools);
        let Some(pool) = pools.get_mut(type_name) else {
            return;
        };
        if pool.leased.contains(name) {
            debug!(resource = %name, r#type = %type_name, "resource leased; removal deferred");
            pool.dropped.insert(name.to_string());
        } else {
            pool.available.retain(|r| r.name != name);
        }
    }

    /// Leases a resource of `type_name` without waiting.
    pub fn try_acquire(&self, type_name: &str) -> Option<ResourceLease> {
        let mut pools = hold(&self.inner.pools);
        let pool = pools.get_mut(type_name)?;
        let resource = pool.available.pop_front()?;
        pool.leased.insert(resource.name.clone());
        Some(ResourceLease {
            resource: Some(resource),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Leases a resource of `type_name`, suspending until one is
    /// available.
    pub async fn acquire(&self, type_name: &str) -> ResourceLease {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(lease) = self.try_acquire(type_name) {
                return lease;
            }
            notified.await;
        }
    }

    /// Number of available resources of `type_name`, for diagnostics.
    pub fn available(&self, type_name: &str) -> usize {
        hold(&self.inner.pools)
            .get(type_name)
            .map_or(0, |pool| pool.available.len())
    }
}

/// A held resource. Returns to its pool on drop unless removed meanwhile.
pub struct ResourceLease {
    resource: Option<Resource>,
    inner: Arc<ManagerInner>,
}

impl ResourceLease {
    /// The leased resource.
    pub fn resource(&self) -> &Resource {
        // The slot is only emptied by drop.
        self.resource
            .as_ref()
            .expect("lease accessed after release")
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        {
            let mut pools = hold(&self.inner.pools);
            let Some(pool) = pools.get_mut(&resource.type_name) else {
                return;
            };
            pool.leased.remove(&resource.name);
            if pool.dropped.remove(&resource.name) {
                debug!(resource = %resource.name, "deferred removal applied on lease return");
            } else {
                pool.available.push_back(resource);
            }
        }
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn gpu(name: &str) -> Resource {
        Resource {
            name: name.into(),
            type_name: "gpu".into(),
            data: json!({"device": name}),
        }
    }

    #[tokio::test]
    async fn test_lease_returns_to_pool_on_drop() {
        let manager = ResourcesManager::new();
        manager.add(gpu("gpu0"));

        let lease = manager.acquire("gpu").await;
        assert_eq!(lease.resource().name, "gpu0");
        assert_eq!(manager.available("gpu"), 0);

        drop(lease);
        assert_eq!(manager.available("gpu"), 1);
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_wait() {
        let manager = ResourcesManager::new();
        assert!(manager.try_acquire("gpu").is_none());

        manager.add(gpu("gpu0"));
        assert!(manager.try_acquire("gpu").is_some());
        assert!(manager.try_acquire("gpu").is_none());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let manager = ResourcesManager::new();
        manager.add(gpu("gpu0"));
        let lease = manager.acquire("gpu").await;

        assert!(timeout(Duration::from_millis(10), manager.acquire("gpu"))
            .await
            .is_err());

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("gpu").await })
        };
        drop(lease);
        let lease = waiter.await.unwrap();
        assert_eq!(lease.resource().name, "gpu0");
    }

    #[tokio::test]
    async fn test_removal_of_leased_resource_is_deferred() {
        let manager = ResourcesManager::new();
        manager.add(gpu("gpu0"));
        let lease = manager.acquire("gpu").await;

        manager.remove("gpu", "gpu0");
        drop(lease);
        assert_eq!(manager.available("gpu"), 0);
        assert!(manager.try_acquire("gpu").is_none());
    }

    #[tokio::test]
    async fn test_add_wakes_waiters() {
        let manager = ResourcesManager::new();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("gpu").await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        manager.add(gpu("gpu1"));
        assert_eq!(waiter.await.unwrap().resource().name, "gpu1");
    }

    #[tokio::test]
    async fn test_readding_available_resource_replaces_data() {
        let manager = ResourcesManager::new();
        manager.add(gpu("gpu0"));
        manager.add(Resource {
            name: "gpu0".into(),
            type_name: "gpu".into(),
            data: json!({"device": "updated"}),
        });
        assert_eq!(manager.available("gpu"), 1);

        let lease = manager.acquire("gpu").await;
        assert_eq!(lease.resource().data["device"], "updated");
    }
}

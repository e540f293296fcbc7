//! Cluster-wide map of live scheduler instances.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::BusResult;

/// A consistent key-value map shared by all nodes of a cluster.
///
/// Schedulers register themselves under their agent id on start, remove
/// themselves on stop, and remove departed peers on node-left events.
#[async_trait]
pub trait ClusterMap: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> BusResult<()>;

    async fn get(&self, key: &str) -> BusResult<Option<String>>;

    /// Returns true if the key was present.
    async fn remove(&self, key: &str) -> BusResult<bool>;

    async fn keys(&self) -> BusResult<Vec<String>>;
}

/// Single-node [`ClusterMap`].
#[derive(Default)]
pub struct InMemoryClusterMap {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryClusterMap {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterMap for InMemoryClusterMap {
    async fn put(&self, key: &str, value: &str) -> BusResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> BusResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> BusResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> BusResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove() {
        let map = InMemoryClusterMap::new();
        map.put("node-b", "1").await.unwrap();
        map.put("node-a", "2").await.unwrap();
        assert_eq!(map.get("node-a").await.unwrap().as_deref(), Some("2"));
        assert_eq!(map.keys().await.unwrap(), vec!["node-a", "node-b"]);
        assert!(map.remove("node-a").await.unwrap());
        assert!(!map.remove("node-a").await.unwrap());
        assert_eq!(map.keys().await.unwrap(), vec!["node-b"]);
    }
}

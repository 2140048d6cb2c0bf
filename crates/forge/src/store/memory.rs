use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{group_by_type, ClusterFilter, Storage};
use crate::error::{Error, Result};
use crate::state::{CloudKind, ClusterKey, ClusterType, StateDocument};

/// A store that keeps documents in process memory.
///
/// Clones share the same documents but each clone is bound to its own
/// identity, so one backing map can serve several operations.
#[derive(Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<HashMap<ClusterKey, StateDocument>>>,
    bound: Mutex<Option<ClusterKey>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn bound_key(&self) -> Result<ClusterKey> {
        self.bound
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::storage("lookup", "store used before setup"))
    }

    /// Number of documents currently stored.
    pub async fn len(&self) -> usize {
        self.docs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            docs: self.docs.clone(),
            bound: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn setup(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        *self.bound.lock().await = Some(ClusterKey::new(cloud, region, name, cluster_type));
        Ok(())
    }

    async fn read(&self) -> Result<StateDocument> {
        let key = self.bound_key().await?;
        self.docs
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                cluster: key.to_string(),
            })
    }

    async fn write(&self, state: &StateDocument) -> Result<()> {
        let key = self.bound_key().await?;
        if state.key() != key {
            return Err(Error::storage(
                "write",
                format!("document for {} written to store bound to {}", state.key(), key),
            ));
        }
        self.docs.lock().await.insert(key, state.clone());
        Ok(())
    }

    async fn delete_cluster(&self) -> Result<()> {
        let key = self.bound_key().await?;
        self.docs
            .lock()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound {
                cluster: key.to_string(),
            })
    }

    async fn get_one_or_more_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<HashMap<ClusterType, Vec<StateDocument>>> {
        let docs = self.docs.lock().await;
        Ok(group_by_type(
            docs.iter()
                .filter(|(key, _)| filter.matches(key))
                .map(|(_, doc)| doc.clone()),
        ))
    }

    async fn already_created(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        let key = ClusterKey::new(cloud, region, name, cluster_type);
        if self.docs.lock().await.contains_key(&key) {
            Ok(())
        } else {
            Err(Error::NotFound {
                cluster: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn clones_share_documents_but_not_binding() {
        let store = MemoryStore::new();
        store
            .setup(CloudKind::Aws, "us-east-1", "demo", ClusterType::Managed)
            .await
            .expect("setup");
        let doc = StateDocument::new(&ClusterKey::new(
            CloudKind::Aws,
            "us-east-1",
            "demo",
            ClusterType::Managed,
        ));
        store.write(&doc).await.expect("write");

        let other = store.clone();
        assert!(other.read().await.is_err());
        other
            .already_created(CloudKind::Aws, "us-east-1", "demo", ClusterType::Managed)
            .await
            .expect("document visible through clone");
    }

    #[tokio::test]
    async fn rejects_documents_for_another_identity() {
        let store = MemoryStore::new();
        store
            .setup(CloudKind::Aws, "us-east-1", "demo", ClusterType::Managed)
            .await
            .expect("setup");
        let doc = StateDocument::new(&ClusterKey::new(
            CloudKind::Aws,
            "us-east-1",
            "other",
            ClusterType::Managed,
        ));
        assert!(store.write(&doc).await.is_err());
        assert!(store.is_empty().await);
    }
}

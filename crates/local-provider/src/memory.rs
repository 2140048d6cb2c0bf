use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use forge::ledger::ResourceLedger;
use forge::orchestrator::scripts::SAMPLE_K3S_KUBECONFIG;

use crate::api::{KindApi, KindConfig};

/// A [`KindApi`] that keeps clusters in memory.
#[derive(Default)]
pub struct InMemoryKind {
    ledger: ResourceLedger,
    clusters: Mutex<HashMap<String, (String, String, KindConfig)>>,
}

impl InMemoryKind {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// The image and config cluster `name` was created with.
    pub fn cluster(&self, name: &str) -> Option<(String, KindConfig)> {
        let clusters = self.clusters.lock().ok()?;
        let (_, image, config) = clusters.get(name)?;
        Some((image.clone(), config.clone()))
    }
}

#[async_trait]
impl KindApi for InMemoryKind {
    async fn create_cluster(&self, name: &str, image: &str, config: &KindConfig) -> anyhow::Result<()> {
        let mut clusters = self
            .clusters
            .lock()
            .map_err(|_| anyhow!("cluster table poisoned"))?;
        anyhow::ensure!(!clusters.contains_key(name), "cluster {} already exists", name);
        let id = self.ledger.create("kind")?;
        clusters.insert(name.to_string(), (id, image.to_string(), config.clone()));
        Ok(())
    }

    async fn get_kubeconfig(&self, name: &str) -> anyhow::Result<String> {
        self.ledger.check("get kubeconfig")?;
        let clusters = self
            .clusters
            .lock()
            .map_err(|_| anyhow!("cluster table poisoned"))?;
        anyhow::ensure!(clusters.contains_key(name), "cluster {} not found", name);
        Ok(SAMPLE_K3S_KUBECONFIG.replace("default", &format!("kind-{}", name)))
    }

    async fn delete_cluster(&self, name: &str) -> anyhow::Result<()> {
        let (id, _, _) = self
            .clusters
            .lock()
            .map_err(|_| anyhow!("cluster table poisoned"))?
            .remove(name)
            .ok_or_else(|| anyhow!("cluster {} not found", name))?;
        self.ledger.delete("kind", &id)
    }
}

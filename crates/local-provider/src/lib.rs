//! A kubeforge backend running clusters on the local machine with
//! [kind](https://kind.sigs.k8s.io).
//!
//! Only the managed topology exists here: the kind cluster plays the part of
//! the vendor hosted control plane, and the network, firewall, VM and SSH key
//! operations have nothing to do.

use std::sync::Arc;

use async_trait::async_trait;
use forge::kubeconfig;
use forge::store::Storage;
use forge::{ClusterMetadata, CloudKind, Error, Provider, Result, Role, StateDocument};
use tracing::{debug, info, instrument};

pub mod api;
mod cli;
mod memory;

pub use api::{KindApi, KindConfig};
pub use cli::KindCli;
pub use memory::InMemoryKind;

const REGIONS: &[&str] = &["local"];
const NODE_IMAGE: &str = "kindest/node";
const NODE_SIZE: &str = "local";

/// The node image for `version`, padded to a full `major.minor.patch`.
fn node_image(version: &str) -> String {
    let version = version.trim_start_matches('v');
    let parts = version.split('.').count();
    let padding = ".0".repeat(3usize.saturating_sub(parts));
    format!("{}:v{}{}", NODE_IMAGE, version, padding)
}

/// Provides clusters through kind.
pub struct LocalProvider {
    meta: ClusterMetadata,
    api: Arc<dyn KindApi>,
}

impl LocalProvider {
    pub fn new(meta: ClusterMetadata, api: Arc<dyn KindApi>) -> Self {
        LocalProvider { meta, api }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn cloud(&self) -> CloudKind {
        CloudKind::Local
    }

    fn metadata(&self) -> &ClusterMetadata {
        &self.meta
    }

    fn supports_self_managed(&self) -> bool {
        false
    }

    fn regions(&self) -> &[&'static str] {
        REGIONS
    }

    async fn new_network(&self, _state: &mut StateDocument, _store: &dyn Storage) -> Result<()> {
        Ok(())
    }

    async fn del_network(&self, _state: &mut StateDocument, _store: &dyn Storage) -> Result<()> {
        Ok(())
    }

    async fn new_firewall(
        &self,
        _state: &mut StateDocument,
        _store: &dyn Storage,
        _role: Role,
    ) -> Result<()> {
        Ok(())
    }

    async fn del_firewall(
        &self,
        _state: &mut StateDocument,
        _store: &dyn Storage,
        _role: Role,
    ) -> Result<()> {
        Ok(())
    }

    async fn new_vm(
        &self,
        _state: &mut StateDocument,
        _store: &dyn Storage,
        _role: Role,
        _index: usize,
    ) -> Result<()> {
        Ok(())
    }

    async fn del_vm(
        &self,
        _state: &mut StateDocument,
        _store: &dyn Storage,
        _role: Role,
        _index: usize,
    ) -> Result<()> {
        Ok(())
    }

    async fn create_upload_ssh_key_pair(
        &self,
        _state: &mut StateDocument,
        _store: &dyn Storage,
    ) -> Result<()> {
        Ok(())
    }

    async fn del_ssh_key_pair(&self, _state: &mut StateDocument, _store: &dyn Storage) -> Result<()> {
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()> {
        let name = self.meta.name.clone();

        if state.cloud_infra.managed.cluster_id.is_empty() {
            let image = node_image(&self.meta.k8s_version);
            let config = KindConfig::with_nodes(node_count);
            self.api
                .create_cluster(&name, &image, &config)
                .await
                .map_err(|e| Error::backend("create kind cluster", &name, e))?;
            let managed = &mut state.cloud_infra.managed;
            managed.cluster_id = name.clone();
            managed.cluster_name = name.clone();
            managed.node_size = NODE_SIZE.to_string();
            managed.node_count = node_count;
            store.write(state).await?;
            info!(%image, "created kind cluster");
        } else {
            debug!("kind cluster already created");
        }

        if !state.cluster_kubeconfig.is_empty() {
            return Ok(());
        }
        let raw = self
            .api
            .get_kubeconfig(&name)
            .await
            .map_err(|e| Error::backend("fetch kubeconfig", &name, e))?;
        let parsed = kubeconfig::validate(&raw)?;
        state.cluster_kubeconfig_context = parsed
            .current_context
            .unwrap_or_else(|| format!("kind-{}", name));
        state.cluster_kubeconfig = raw;
        store.write(state).await?;
        info!("kind cluster ready");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        let name = state.cloud_infra.managed.cluster_name.clone();
        if name.is_empty() {
            debug!("kind cluster already deleted");
            return Ok(());
        }
        self.api
            .delete_cluster(&name)
            .await
            .map_err(|e| Error::backend("delete kind cluster", &name, e))?;
        state.cloud_infra.managed = Default::default();
        state.cluster_kubeconfig.clear();
        state.cluster_kubeconfig_context.clear();
        store.write(state).await?;
        info!(%name, "deleted kind cluster");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use forge::store::MemoryStore;
    use forge::{ClusterType, ErrorKind, Operation};

    fn provider(cluster_type: ClusterType) -> (LocalProvider, Arc<InMemoryKind>) {
        let mut meta = ClusterMetadata::new("demo", "local", CloudKind::Local, cluster_type);
        meta.k8s_version = "1.30".to_string();
        meta.managed_node_count = 3;
        let api = Arc::new(InMemoryKind::new());
        (LocalProvider::new(meta, api.clone()), api)
    }

    #[test]
    fn node_images_carry_a_full_version() {
        assert_eq!(node_image("1.30"), "kindest/node:v1.30.0");
        assert_eq!(node_image("v1.29.4"), "kindest/node:v1.29.4");
        assert_eq!(node_image("1"), "kindest/node:v1.0.0");
    }

    #[tokio::test]
    async fn self_managed_clusters_are_rejected() {
        let (provider, _) = provider(ClusterType::SelfManaged);
        let err = provider
            .init_state(&MemoryStore::new(), Operation::Create)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUserInput);
    }

    #[tokio::test]
    async fn kind_cluster_lifecycle() {
        let (provider, api) = provider(ClusterType::Managed);
        let store = MemoryStore::new();
        let mut state = provider.init_state(&store, Operation::Create).await.unwrap();

        provider.new_network(&mut state, &store).await.unwrap();
        provider
            .new_managed_cluster(&mut state, &store, 3)
            .await
            .unwrap();
        provider
            .new_managed_cluster(&mut state, &store, 3)
            .await
            .unwrap();

        let (image, config) = api.cluster("demo").unwrap();
        assert_eq!(image, "kindest/node:v1.30.0");
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(api.ledger().created("kind"), 1);
        assert_eq!(state.cluster_kubeconfig_context, "kind-demo");
        assert!(state.cloud_infra.network.is_empty());

        provider.del_managed_cluster(&mut state, &store).await.unwrap();
        assert!(api.cluster("demo").is_none());
        assert!(state.cluster_kubeconfig.is_empty());
        assert_eq!(store.read().await.unwrap(), state);
    }
}

//! A kubeforge backend for [Civo](https://www.civo.com).
//!
//! Self-managed clusters are built from a private network, one firewall per
//! role and plain instances. Managed clusters use Civo's hosted k3s.

use std::sync::Arc;

use async_trait::async_trait;
use forge::config::ManagedPollSettings;
use forge::firewall::rules_for;
use forge::kubeconfig;
use forge::provider::{
    ensure_ssh_identity, firewall_name, network_name, poll_until_ready, vm_name, vm_size,
};
use forge::state::VmInfo;
use forge::store::Storage;
use forge::{ClusterMetadata, CloudKind, Error, Provider, Result, Role, StateDocument};
use tracing::{debug, info, instrument};

pub mod api;
mod client;
mod memory;

pub use api::CivoApi;
pub use client::CivoClient;
pub use memory::InMemoryCivo;

const REGIONS: &[&str] = &["lon1", "fra1", "nyc1", "phx1"];
const NETWORK_CIDR: &str = "10.1.0.0/16";
const DISK_IMAGE: &str = "ubuntu-jammy";
const DEFAULT_NODE_SIZE: &str = "g4s.kube.small";

/// Provides clusters on Civo.
pub struct CivoProvider {
    meta: ClusterMetadata,
    api: Arc<dyn CivoApi>,
    ssh_user: String,
    poll: ManagedPollSettings,
}

impl CivoProvider {
    pub fn new(
        meta: ClusterMetadata,
        api: Arc<dyn CivoApi>,
        ssh_user: impl Into<String>,
        poll: ManagedPollSettings,
    ) -> Self {
        CivoProvider {
            meta,
            api,
            ssh_user: ssh_user.into(),
            poll,
        }
    }

    fn region(&self) -> String {
        self.meta.region.to_uppercase()
    }

    fn kubernetes_version(&self) -> String {
        let version = self.meta.k8s_version.trim_start_matches('v');
        if version.contains("k3s") {
            version.to_string()
        } else {
            format!("{}-k3s1", version)
        }
    }

    async fn wait_for_instance(&self, id: &str, name: &str) -> Result<()> {
        poll_until_ready(&self.poll, name, || {
            let api = self.api.clone();
            let region = self.region();
            let id = id.to_string();
            async move {
                let instance = api
                    .get_instance(&region, &id)
                    .await
                    .map_err(|e| Error::backend("get instance", &id, e))?;
                Ok(instance.status == api::INSTANCE_ACTIVE && !instance.public_ip.is_empty())
            }
        })
        .await
    }
}

#[async_trait]
impl Provider for CivoProvider {
    fn cloud(&self) -> CloudKind {
        CloudKind::Civo
    }

    fn metadata(&self) -> &ClusterMetadata {
        &self.meta
    }

    fn regions(&self) -> &[&'static str] {
        REGIONS
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        if !state.cloud_infra.network.network_id.is_empty() {
            debug!(id = %state.cloud_infra.network.network_id, "network already created");
            return Ok(());
        }
        let name = network_name(&self.meta.name);
        let network = self
            .api
            .create_network(&self.region(), &name, NETWORK_CIDR)
            .await
            .map_err(|e| Error::backend("create network", &name, e))?;

        let net = &mut state.cloud_infra.network;
        net.network_id = network.id;
        net.network_name = name;
        net.cidr = if network.cidr.is_empty() {
            NETWORK_CIDR.to_string()
        } else {
            network.cidr
        };
        store.write(state).await?;
        info!(id = %state.cloud_infra.network.network_id, "created network");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        let id = state.cloud_infra.network.network_id.clone();
        if id.is_empty() {
            debug!("network already deleted");
            return Ok(());
        }
        self.api
            .delete_network(&self.region(), &id)
            .await
            .map_err(|e| Error::backend("delete network", &id, e))?;
        state.cloud_infra.network = Default::default();
        store.write(state).await?;
        info!(%id, "deleted network");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()> {
        if !state.cloud_infra.role(role).firewall_id.is_empty() {
            debug!(%role, "firewall already created");
            return Ok(());
        }
        let name = firewall_name(&self.meta.name, role);
        let rules = rules_for(role, &state.cloud_infra.network.cidr);
        let id = self
            .api
            .create_firewall(
                &self.region(),
                &name,
                &state.cloud_infra.network.network_id,
                &rules,
            )
            .await
            .map_err(|e| {
                Error::backend("create firewall", format!("{} firewall {}", role, name), e)
            })?;

        let infra = state.cloud_infra.role_mut(role);
        infra.firewall_id = id;
        infra.firewall_name = name;
        store.write(state).await?;
        info!(%role, "created firewall");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()> {
        let id = state.cloud_infra.role(role).firewall_id.clone();
        if id.is_empty() {
            debug!(%role, "firewall already deleted");
            return Ok(());
        }
        self.api
            .delete_firewall(&self.region(), &id)
            .await
            .map_err(|e| {
                Error::backend("delete firewall", format!("{} firewall {}", role, id), e)
            })?;
        let infra = state.cloud_infra.role_mut(role);
        infra.firewall_id.clear();
        infra.firewall_name.clear();
        store.write(state).await?;
        info!(%role, %id, "deleted firewall");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()> {
        let existing = state
            .cloud_infra
            .role(role)
            .vm(index)
            .cloned()
            .unwrap_or_default();
        if !existing.id.is_empty() && !existing.public_ip.is_empty() {
            debug!(%role, index, "vm already created");
            return Ok(());
        }

        let name = vm_name(&self.meta.name, role, index);
        let id = if existing.id.is_empty() {
            let region = self.region();
            let template_id = self
                .api
                .disk_image_id(&region, DISK_IMAGE)
                .await
                .map_err(|e| Error::backend("find disk image", DISK_IMAGE, e))?;
            let request = api::InstanceRequest {
                hostname: name.clone(),
                size: vm_size(&self.meta, state, role),
                region,
                template_id,
                network_id: state.cloud_infra.network.network_id.clone(),
                firewall_id: state.cloud_infra.role(role).firewall_id.clone(),
                sshkey_id: state.ssh_key.id.clone(),
                initial_user: self.ssh_user.clone(),
                public_ip: "create".to_string(),
            };
            let id = self
                .api
                .create_instance(&request)
                .await
                .map_err(|e| Error::backend("create vm", format!("{} vm {}", role, name), e))?;

            let vm = state.cloud_infra.role_mut(role).vm_mut(index);
            vm.id = id.clone();
            vm.name = name.clone();
            vm.size = request.size;
            store.write(state).await?;
            id
        } else {
            existing.id
        };

        self.wait_for_instance(&id, &name).await?;
        let instance = self
            .api
            .get_instance(&self.region(), &id)
            .await
            .map_err(|e| Error::backend("get instance", format!("{} vm {}", role, id), e))?;

        let vm = state.cloud_infra.role_mut(role).vm_mut(index);
        vm.hostname = if instance.hostname.is_empty() {
            name
        } else {
            instance.hostname
        };
        vm.public_ip = instance.public_ip;
        vm.private_ip = instance.private_ip;
        store.write(state).await?;
        info!(%role, index, %id, "created vm");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()> {
        let id = match state.cloud_infra.role(role).vm(index) {
            Some(vm) if !vm.id.is_empty() => vm.id.clone(),
            _ => {
                debug!(%role, index, "vm already deleted");
                return Ok(());
            }
        };
        self.api
            .delete_instance(&self.region(), &id)
            .await
            .map_err(|e| Error::backend("delete vm", format!("{} vm {}", role, id), e))?;
        *state.cloud_infra.role_mut(role).vm_mut(index) = VmInfo::default();
        store.write(state).await?;
        info!(%role, index, %id, "deleted vm");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn create_upload_ssh_key_pair(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        let public_key = ensure_ssh_identity(state, store, &self.ssh_user).await?;
        if !state.ssh_key.id.is_empty() {
            debug!("ssh key already uploaded");
            return Ok(());
        }
        let name = state.ssh_key.name.clone();
        let id = self
            .api
            .create_ssh_key(&name, &public_key)
            .await
            .map_err(|e| Error::backend("upload ssh key", &name, e))?;
        state.ssh_key.id = id;
        store.write(state).await?;
        info!(%name, "uploaded ssh key");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_ssh_key_pair(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        let id = state.ssh_key.id.clone();
        if id.is_empty() {
            debug!("ssh key already deleted");
            return Ok(());
        }
        self.api
            .delete_ssh_key(&id)
            .await
            .map_err(|e| Error::backend("delete ssh key", &id, e))?;
        state.ssh_key = Default::default();
        store.write(state).await?;
        info!(%id, "deleted ssh key");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()> {
        let region = self.region();
        if state.cloud_infra.managed.cluster_id.is_empty() {
            let node_size = if self.meta.managed_node_size.is_empty() {
                DEFAULT_NODE_SIZE.to_string()
            } else {
                self.meta.managed_node_size.clone()
            };
            let request = api::ClusterRequest {
                name: self.meta.name.clone(),
                region: region.clone(),
                network_id: state.cloud_infra.network.network_id.clone(),
                num_target_nodes: node_count,
                target_nodes_size: node_size.clone(),
                kubernetes_version: self.kubernetes_version(),
            };
            let id = self
                .api
                .create_cluster(&request)
                .await
                .map_err(|e| Error::backend("create managed cluster", &self.meta.name, e))?;

            let managed = &mut state.cloud_infra.managed;
            managed.cluster_id = id;
            managed.cluster_name = self.meta.name.clone();
            managed.node_size = node_size;
            managed.node_count = node_count;
            store.write(state).await?;
            info!(id = %state.cloud_infra.managed.cluster_id, "created managed cluster");
        } else {
            debug!("managed cluster already created");
        }

        if !state.cluster_kubeconfig.is_empty() {
            return Ok(());
        }

        let id = state.cloud_infra.managed.cluster_id.clone();
        poll_until_ready(&self.poll, &id, || {
            let api = self.api.clone();
            let region = region.clone();
            let id = id.clone();
            async move {
                let cluster = api
                    .get_cluster(&region, &id)
                    .await
                    .map_err(|e| Error::backend("get managed cluster", &id, e))?;
                Ok(cluster.ready)
            }
        })
        .await?;

        let cluster = self
            .api
            .get_cluster(&region, &id)
            .await
            .map_err(|e| Error::backend("get managed cluster", &id, e))?;
        let raw = cluster
            .kubeconfig
            .ok_or_else(|| Error::backend("fetch kubeconfig", &id, "cluster reported no kubeconfig"))?;
        let parsed = kubeconfig::validate(&raw)?;

        state.cluster_kubeconfig_context = parsed
            .current_context
            .unwrap_or_else(|| state.context_name());
        state.cluster_kubeconfig = raw;
        store.write(state).await?;
        info!(%id, "managed cluster ready");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        let id = state.cloud_infra.managed.cluster_id.clone();
        if id.is_empty() {
            debug!("managed cluster already deleted");
            return Ok(());
        }
        self.api
            .delete_cluster(&self.region(), &id)
            .await
            .map_err(|e| Error::backend("delete managed cluster", &id, e))?;
        state.cloud_infra.managed = Default::default();
        state.cluster_kubeconfig.clear();
        state.cluster_kubeconfig_context.clear();
        store.write(state).await?;
        info!(%id, "deleted managed cluster");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use forge::store::MemoryStore;
    use forge::{ClusterType, ErrorKind};
    use std::time::Duration;

    fn meta(cluster_type: ClusterType) -> ClusterMetadata {
        let mut meta = ClusterMetadata::new("demo", "lon1", CloudKind::Civo, cluster_type);
        meta.cp_size = "g3.small".to_string();
        meta.wp_size = "g3.medium".to_string();
        meta.ds_size = "g3.small".to_string();
        meta.lb_size = "g3.small".to_string();
        meta
    }

    fn poll() -> ManagedPollSettings {
        ManagedPollSettings {
            attempts: 5,
            interval: Duration::ZERO,
        }
    }

    async fn setup(
        cluster_type: ClusterType,
    ) -> (CivoProvider, Arc<InMemoryCivo>, MemoryStore, StateDocument) {
        let api = Arc::new(InMemoryCivo::new());
        let provider = CivoProvider::new(meta(cluster_type), api.clone(), "kubeforge", poll());
        let store = MemoryStore::new();
        let state = provider
            .init_state(&store, forge::Operation::Create)
            .await
            .expect("init state");
        (provider, api, store, state)
    }

    #[tokio::test]
    async fn repeated_calls_create_each_resource_once() {
        let (provider, api, store, mut state) = setup(ClusterType::SelfManaged).await;

        for _ in 0..2 {
            provider.new_network(&mut state, &store).await.unwrap();
            provider
                .new_firewall(&mut state, &store, Role::ControlPlane)
                .await
                .unwrap();
            provider
                .new_vm(&mut state, &store, Role::ControlPlane, 0)
                .await
                .unwrap();
        }

        assert_eq!(api.ledger().created("network"), 1);
        assert_eq!(api.ledger().created("firewall"), 1);
        assert_eq!(api.ledger().created("instance"), 1);

        let vm = state.cloud_infra.control_plane.vm(0).unwrap();
        assert_eq!(vm.name, "demo-vm-cp-0");
        assert!(!vm.public_ip.is_empty());
        assert!(!vm.private_ip.is_empty());
        assert_eq!(store.read().await.unwrap(), state);
    }

    #[tokio::test]
    async fn deleting_missing_resources_is_a_no_op() {
        let (provider, api, store, mut state) = setup(ClusterType::SelfManaged).await;
        provider.del_vm(&mut state, &store, Role::WorkerPlane, 3).await.unwrap();
        provider
            .del_firewall(&mut state, &store, Role::LoadBalancer)
            .await
            .unwrap();
        provider.del_network(&mut state, &store).await.unwrap();
        provider.del_managed_cluster(&mut state, &store).await.unwrap();
        assert!(api.ledger().live_ids().is_empty());
    }

    #[tokio::test]
    async fn deletions_clear_recorded_identifiers() {
        let (provider, api, store, mut state) = setup(ClusterType::SelfManaged).await;
        provider.new_network(&mut state, &store).await.unwrap();
        provider
            .new_firewall(&mut state, &store, Role::Datastore)
            .await
            .unwrap();
        provider
            .new_vm(&mut state, &store, Role::Datastore, 0)
            .await
            .unwrap();

        provider
            .del_vm(&mut state, &store, Role::Datastore, 0)
            .await
            .unwrap();
        provider
            .del_firewall(&mut state, &store, Role::Datastore)
            .await
            .unwrap();
        provider.del_network(&mut state, &store).await.unwrap();

        assert!(!state.cloud_infra.has_network_dependents());
        assert!(state.cloud_infra.network.is_empty());
        assert!(api.ledger().live_ids().is_empty());
        assert_eq!(store.read().await.unwrap(), state);
    }

    #[tokio::test]
    async fn backend_failures_name_step_and_resource() {
        let (provider, api, store, mut state) = setup(ClusterType::SelfManaged).await;
        api.ledger().fail("create network");
        let err = provider.new_network(&mut state, &store).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert!(err.to_string().contains("create network"));
        assert!(err.to_string().contains("demo-net"));
        assert!(state.cloud_infra.network.network_id.is_empty());
    }

    #[tokio::test]
    async fn vm_failures_name_the_role() {
        let (provider, api, store, mut state) = setup(ClusterType::SelfManaged).await;
        provider.new_network(&mut state, &store).await.unwrap();
        provider
            .new_firewall(&mut state, &store, Role::WorkerPlane)
            .await
            .unwrap();
        provider
            .new_vm(&mut state, &store, Role::WorkerPlane, 0)
            .await
            .unwrap();

        api.ledger().fail("delete instance");
        let err = provider
            .del_vm(&mut state, &store, Role::WorkerPlane, 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert!(err.to_string().contains("delete vm"));
        assert!(err.to_string().contains("workerplane vm"));

        api.ledger().fail("delete firewall");
        let err = provider
            .del_firewall(&mut state, &store, Role::WorkerPlane)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("workerplane firewall"));
    }

    #[tokio::test]
    async fn managed_cluster_waits_for_readiness_and_stores_kubeconfig() {
        let (provider, api, store, mut state) = setup(ClusterType::Managed).await;
        provider.new_network(&mut state, &store).await.unwrap();
        provider
            .new_managed_cluster(&mut state, &store, 3)
            .await
            .unwrap();
        provider
            .new_managed_cluster(&mut state, &store, 3)
            .await
            .unwrap();

        assert_eq!(api.ledger().created("cluster"), 1);
        assert_eq!(state.cloud_infra.managed.node_count, 3);
        assert_eq!(state.cloud_infra.managed.node_size, DEFAULT_NODE_SIZE);
        assert!(state.cluster_kubeconfig.contains("203.0.113.200"));
        assert_eq!(state.cluster_kubeconfig_context, "default");

        provider.del_managed_cluster(&mut state, &store).await.unwrap();
        assert!(state.cluster_kubeconfig.is_empty());
        assert_eq!(api.ledger().live("cluster"), 0);
    }

    #[tokio::test]
    async fn rejects_unknown_regions() {
        let mut meta = meta(ClusterType::SelfManaged);
        meta.region = "mars1".to_string();
        let provider = CivoProvider::new(meta, Arc::new(InMemoryCivo::new()), "kubeforge", poll());
        let err = provider
            .init_state(&MemoryStore::new(), forge::Operation::Create)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUserInput);
    }

    #[test]
    fn versions_get_the_k3s_suffix() {
        let mut meta = meta(ClusterType::Managed);
        meta.k8s_version = "1.30.2".to_string();
        let provider = CivoProvider::new(meta, Arc::new(InMemoryCivo::new()), "kubeforge", poll());
        assert_eq!(provider.kubernetes_version(), "1.30.2-k3s1");
    }
}

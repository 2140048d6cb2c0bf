//! A kubeforge backend for Microsoft Azure.
//!
//! A cluster lives in its own resource group. The group, a virtual network
//! and one subnet form the network. Each role gets a network security group,
//! and each VM gets a public address, an interface, the machine itself and
//! its OS disk. Managed clusters are AKS clusters in the same group.

use std::sync::Arc;

use async_trait::async_trait;
use forge::config::ManagedPollSettings;
use forge::firewall::rules_for;
use forge::kubeconfig;
use forge::provider::{
    ensure_ssh_identity, firewall_name, network_name, poll_until_ready, vm_name, vm_size,
};
use forge::state::{SshKeyInfo, VmInfo};
use forge::store::Storage;
use forge::{ClusterMetadata, CloudKind, Error, Provider, Result, Role, StateDocument};
use tracing::{debug, info, instrument};

pub mod api;
mod memory;

pub use api::AzureApi;
pub use memory::InMemoryAzure;

const REGIONS: &[&str] = &[
    "eastus",
    "eastus2",
    "westus2",
    "westeurope",
    "northeurope",
    "uksouth",
    "centralindia",
    "southeastasia",
];
const NETWORK_CIDR: &str = "10.1.0.0/16";
const SUBNET_CIDR: &str = "10.1.0.0/16";
const VM_IMAGE: &str = "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest";
const DEFAULT_NODE_SIZE: &str = "Standard_DS2_v2";

fn resource_group_name(cluster: &str) -> String {
    format!("{}-rg", cluster)
}

fn subnet_name(cluster: &str) -> String {
    format!("{}-subnet", cluster)
}

/// Provides clusters on Azure.
pub struct AzureProvider {
    meta: ClusterMetadata,
    api: Arc<dyn AzureApi>,
    ssh_user: String,
    poll: ManagedPollSettings,
}

impl AzureProvider {
    pub fn new(
        meta: ClusterMetadata,
        api: Arc<dyn AzureApi>,
        ssh_user: impl Into<String>,
        poll: ManagedPollSettings,
    ) -> Self {
        AzureProvider {
            meta,
            api,
            ssh_user: ssh_user.into(),
            poll,
        }
    }

    fn group(state: &StateDocument) -> Result<String> {
        let group = &state.cloud_infra.network.resource_group;
        if group.is_empty() {
            return Err(Error::backend(
                "resolve resource group",
                &state.cluster_name,
                "no resource group recorded",
            ));
        }
        Ok(group.clone())
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn cloud(&self) -> CloudKind {
        CloudKind::Azure
    }

    fn metadata(&self) -> &ClusterMetadata {
        &self.meta
    }

    fn regions(&self) -> &[&'static str] {
        REGIONS
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        let cluster = self.meta.name.clone();

        if state.cloud_infra.network.resource_group.is_empty() {
            let name = resource_group_name(&cluster);
            self.api
                .create_resource_group(&name, &self.meta.region)
                .await
                .map_err(|e| Error::backend("create resource group", &name, e))?;
            state.cloud_infra.network.resource_group = name;
            store.write(state).await?;
            info!("created resource group");
        } else {
            debug!("resource group already created");
        }
        let group = Self::group(state)?;

        if state.cloud_infra.network.network_id.is_empty() {
            let name = network_name(&cluster);
            let id = self
                .api
                .create_virtual_network(&group, &name, NETWORK_CIDR)
                .await
                .map_err(|e| Error::backend("create virtual network", &name, e))?;
            let net = &mut state.cloud_infra.network;
            net.network_id = id;
            net.network_name = name;
            net.cidr = NETWORK_CIDR.to_string();
            store.write(state).await?;
            info!("created virtual network");
        } else {
            debug!("virtual network already created");
        }

        if state.cloud_infra.network.subnet_id.is_empty() {
            let name = subnet_name(&cluster);
            let network = state.cloud_infra.network.network_name.clone();
            let id = self
                .api
                .create_subnet(&group, &network, &name, SUBNET_CIDR)
                .await
                .map_err(|e| Error::backend("create subnet", &name, e))?;
            let net = &mut state.cloud_infra.network;
            net.subnet_id = id;
            net.subnet_name = name;
            store.write(state).await?;
            info!("created subnet");
        } else {
            debug!("subnet already created");
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        if state.cloud_infra.network.is_empty() {
            debug!("network already deleted");
            return Ok(());
        }
        let group = state.cloud_infra.network.resource_group.clone();

        if !state.cloud_infra.network.subnet_id.is_empty() {
            let net = &state.cloud_infra.network;
            let (network, subnet) = (net.network_name.clone(), net.subnet_name.clone());
            self.api
                .delete_subnet(&group, &network, &subnet)
                .await
                .map_err(|e| Error::backend("delete subnet", &subnet, e))?;
            let net = &mut state.cloud_infra.network;
            net.subnet_id.clear();
            net.subnet_name.clear();
            store.write(state).await?;
            info!(%subnet, "deleted subnet");
        }

        if !state.cloud_infra.network.network_id.is_empty() {
            let network = state.cloud_infra.network.network_name.clone();
            self.api
                .delete_virtual_network(&group, &network)
                .await
                .map_err(|e| Error::backend("delete virtual network", &network, e))?;
            let net = &mut state.cloud_infra.network;
            net.network_id.clear();
            net.network_name.clear();
            store.write(state).await?;
            info!(%network, "deleted virtual network");
        }

        if !group.is_empty() {
            self.api
                .delete_resource_group(&group)
                .await
                .map_err(|e| Error::backend("delete resource group", &group, e))?;
            state.cloud_infra.network = Default::default();
            store.write(state).await?;
            info!(%group, "deleted resource group");
        }
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
            debug!(%role, "security group already created");
            return Ok(());
        }
        let group = Self::group(state)?;
        let name = firewall_name(&self.meta.name, role);
        let rules = rules_for(role, &state.cloud_infra.network.cidr);
        let id = self
            .api
            .create_security_group(&group, &name, &rules)
            .await
            .map_err(|e| {
                Error::backend("create security group", format!("{} firewall {}", role, name), e)
            })?;

        let infra = state.cloud_infra.role_mut(role);
        infra.firewall_id = id;
        infra.firewall_name = name;
        store.write(state).await?;
        info!(%role, "created security group");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()> {
        let name = state.cloud_infra.role(role).firewall_name.clone();
        if state.cloud_infra.role(role).firewall_id.is_empty() {
            debug!(%role, "security group already deleted");
            return Ok(());
        }
        let group = Self::group(state)?;
        self.api
            .delete_security_group(&group, &name)
            .await
            .map_err(|e| {
                Error::backend("delete security group", format!("{} firewall {}", role, name), e)
            })?;
        let infra = state.cloud_infra.role_mut(role);
        infra.firewall_id.clear();
        infra.firewall_name.clear();
        store.write(state).await?;
        info!(%role, %name, "deleted security group");
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
        let group = Self::group(state)?;
        let name = vm_name(&self.meta.name, role, index);
        let existing = state
            .cloud_infra
            .role(role)
            .vm(index)
            .cloned()
            .unwrap_or_default();
        if !existing.id.is_empty() {
            debug!(%role, index, "vm already created");
            return Ok(());
        }

        if existing.public_ip_id.is_empty() {
            let ip_name = format!("{}-pip", name);
            let ip = self
                .api
                .create_public_ip(&group, &ip_name)
                .await
                .map_err(|e| {
                    Error::backend("create public ip", format!("{} vm {}", role, ip_name), e)
                })?;
            let vm = state.cloud_infra.role_mut(role).vm_mut(index);
            vm.name = name.clone();
            vm.public_ip_id = ip.id;
            vm.public_ip = ip.address;
            store.write(state).await?;
            debug!(%role, index, "created public ip");
        }

        if existing.nic_id.is_empty() {
            let nic_name = format!("{}-nic", name);
            let subnet_id = state.cloud_infra.network.subnet_id.clone();
            let nsg_id = state.cloud_infra.role(role).firewall_id.clone();
            let public_ip_id = state
                .cloud_infra
                .role(role)
                .vm(index)
                .map(|vm| vm.public_ip_id.clone())
                .unwrap_or_default();
            let nic = self
                .api
                .create_network_interface(&group, &nic_name, &subnet_id, &nsg_id, &public_ip_id)
                .await
                .map_err(|e| {
                    Error::backend(
                        "create network interface",
                        format!("{} vm {}", role, nic_name),
                        e,
                    )
                })?;
            let vm = state.cloud_infra.role_mut(role).vm_mut(index);
            vm.nic_id = nic.id;
            vm.private_ip = nic.private_ip;
            store.write(state).await?;
            debug!(%role, index, "created network interface");
        }

        let nic_id = state
            .cloud_infra
            .role(role)
            .vm(index)
            .map(|vm| vm.nic_id.clone())
            .unwrap_or_default();
        let request = api::VmRequest {
            resource_group: group,
            name: name.clone(),
            location: self.meta.region.clone(),
            size: vm_size(&self.meta, state, role),
            nic_id,
            admin_user: self.ssh_user.clone(),
            ssh_public_key: state.ssh_key.public_key.clone(),
            image: VM_IMAGE.to_string(),
        };
        let machine = self
            .api
            .create_vm(&request)
            .await
            .map_err(|e| Error::backend("create vm", format!("{} vm {}", role, name), e))?;

        let vm = state.cloud_infra.role_mut(role).vm_mut(index);
        vm.id = machine.id;
        vm.disk_id = machine.os_disk_id;
        vm.hostname = name;
        vm.size = request.size;
        store.write(state).await?;
        info!(%role, index, "created vm");
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
        let vm = match state.cloud_infra.role(role).vm(index) {
            Some(vm) if !vm.is_empty() => vm.clone(),
            _ => {
                debug!(%role, index, "vm already deleted");
                return Ok(());
            }
        };
        let group = Self::group(state)?;

        if !vm.id.is_empty() {
            self.api
                .delete_vm(&group, &vm.id)
                .await
                .map_err(|e| Error::backend("delete vm", format!("{} vm {}", role, vm.name), e))?;
            state.cloud_infra.role_mut(role).vm_mut(index).id.clear();
            store.write(state).await?;
        }
        if !vm.disk_id.is_empty() {
            self.api
                .delete_disk(&group, &vm.disk_id)
                .await
                .map_err(|e| {
                    Error::backend("delete disk", format!("{} vm {}", role, vm.disk_id), e)
                })?;
            state.cloud_infra.role_mut(role).vm_mut(index).disk_id.clear();
            store.write(state).await?;
        }
        if !vm.nic_id.is_empty() {
            self.api
                .delete_network_interface(&group, &vm.nic_id)
                .await
                .map_err(|e| {
                    Error::backend(
                        "delete network interface",
                        format!("{} vm {}", role, vm.nic_id),
                        e,
                    )
                })?;
            state.cloud_infra.role_mut(role).vm_mut(index).nic_id.clear();
            store.write(state).await?;
        }
        if !vm.public_ip_id.is_empty() {
            self.api
                .delete_public_ip(&group, &vm.public_ip_id)
                .await
                .map_err(|e| {
                    Error::backend(
                        "delete public ip",
                        format!("{} vm {}", role, vm.public_ip_id),
                        e,
                    )
                })?;
        }
        *state.cloud_infra.role_mut(role).vm_mut(index) = VmInfo::default();
        store.write(state).await?;
        info!(%role, index, name = %vm.name, "deleted vm");
        Ok(())
    }

    /// Azure takes the public key at VM creation, so nothing is uploaded.
    #[instrument(level = "info", skip(self, state, store))]
    async fn create_upload_ssh_key_pair(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        ensure_ssh_identity(state, store, &self.ssh_user).await?;
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_ssh_key_pair(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        if state.ssh_key == SshKeyInfo::default() {
            return Ok(());
        }
        state.ssh_key = SshKeyInfo::default();
        store.write(state).await?;
        info!("forgot ssh identity");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()> {
        let group = Self::group(state)?;
        let name = self.meta.name.clone();

        if state.cloud_infra.managed.cluster_id.is_empty() {
            let node_size = if self.meta.managed_node_size.is_empty() {
                DEFAULT_NODE_SIZE.to_string()
            } else {
                self.meta.managed_node_size.clone()
            };
            let request = api::AksRequest {
                resource_group: group.clone(),
                name: name.clone(),
                location: self.meta.region.clone(),
                kubernetes_version: self.meta.k8s_version.trim_start_matches('v').to_string(),
                node_count,
                node_size: node_size.clone(),
                subnet_id: state.cloud_infra.network.subnet_id.clone(),
            };
            let id = self
                .api
                .create_aks(&request)
                .await
                .map_err(|e| Error::backend("create aks cluster", &name, e))?;
            let managed = &mut state.cloud_infra.managed;
            managed.cluster_id = id;
            managed.cluster_name = name.clone();
            managed.node_size = node_size;
            managed.node_count = node_count;
            store.write(state).await?;
            info!("created aks cluster");
        } else {
            debug!("aks cluster already created");
        }

        if !state.cluster_kubeconfig.is_empty() {
            return Ok(());
        }

        poll_until_ready(&self.poll, &name, || {
            let api = self.api.clone();
            let group = group.clone();
            let name = name.clone();
            async move {
                let cluster = api
                    .get_aks(&group, &name)
                    .await
                    .map_err(|e| Error::backend("get aks cluster", &name, e))?;
                Ok(cluster.provisioning_state == api::PROVISIONING_SUCCEEDED)
            }
        })
        .await?;

        let cluster = self
            .api
            .get_aks(&group, &name)
            .await
            .map_err(|e| Error::backend("get aks cluster", &name, e))?;
        let raw = cluster.kubeconfig.ok_or_else(|| {
            Error::backend("fetch kubeconfig", &name, "cluster reported no kubeconfig")
        })?;
        let parsed = kubeconfig::validate(&raw)?;

        state.cluster_kubeconfig_context = parsed
            .current_context
            .unwrap_or_else(|| state.context_name());
        state.cluster_kubeconfig = raw;
        store.write(state).await?;
        info!("aks cluster ready");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        if state.cloud_infra.managed.cluster_id.is_empty() {
            debug!("aks cluster already deleted");
            return Ok(());
        }
        let group = Self::group(state)?;
        let name = state.cloud_infra.managed.cluster_name.clone();
        self.api
            .delete_aks(&group, &name)
            .await
            .map_err(|e| Error::backend("delete aks cluster", &name, e))?;
        state.cloud_infra.managed = Default::default();
        state.cluster_kubeconfig.clear();
        state.cluster_kubeconfig_context.clear();
        store.write(state).await?;
        info!(%name, "deleted aks cluster");
        Ok(())
    }
}

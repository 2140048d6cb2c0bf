//! A kubeforge backend for Amazon Web Services.
//!
//! The network is a VPC with one public subnet, an internet gateway and a
//! route table sending everything else through the gateway. Roles map to
//! security groups and VMs to EC2 instances. Managed clusters run on EKS.

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
mod memory;

pub use api::AwsApi;
pub use memory::InMemoryAws;

const REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-south-1",
    "ap-southeast-1",
];
const VPC_CIDR: &str = "10.1.0.0/16";
const SUBNET_CIDR: &str = "10.1.0.0/20";
const IMAGE_NAME: &str = "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*";
const DEFAULT_NODE_TYPE: &str = "t3.medium";

/// Provides clusters on AWS.
pub struct AwsProvider {
    meta: ClusterMetadata,
    api: Arc<dyn AwsApi>,
    ssh_user: String,
    poll: ManagedPollSettings,
}

impl AwsProvider {
    pub fn new(
        meta: ClusterMetadata,
        api: Arc<dyn AwsApi>,
        ssh_user: impl Into<String>,
        poll: ManagedPollSettings,
    ) -> Self {
        AwsProvider {
            meta,
            api,
            ssh_user: ssh_user.into(),
            poll,
        }
    }

    fn region(&self) -> &str {
        &self.meta.region
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn cloud(&self) -> CloudKind {
        CloudKind::Aws
    }

    fn metadata(&self) -> &ClusterMetadata {
        &self.meta
    }

    fn regions(&self) -> &[&'static str] {
        REGIONS
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        let region = self.region();

        if state.cloud_infra.network.network_id.is_empty() {
            let name = network_name(&self.meta.name);
            let id = self
                .api
                .create_vpc(region, &name, VPC_CIDR)
                .await
                .map_err(|e| Error::backend("create vpc", &name, e))?;
            let net = &mut state.cloud_infra.network;
            net.network_id = id;
            net.network_name = name;
            net.cidr = VPC_CIDR.to_string();
            store.write(state).await?;
            info!("created vpc");
        } else {
            debug!("vpc already created");
        }
        let vpc_id = state.cloud_infra.network.network_id.clone();

        if state.cloud_infra.network.subnet_id.is_empty() {
            let id = self
                .api
                .create_subnet(region, &vpc_id, SUBNET_CIDR)
                .await
                .map_err(|e| Error::backend("create subnet", &vpc_id, e))?;
            let net = &mut state.cloud_infra.network;
            net.subnet_id = id;
            net.subnet_name = format!("{}-subnet", self.meta.name);
            store.write(state).await?;
            info!("created subnet");
        }

        if state.cloud_infra.network.gateway_id.is_empty() {
            let id = self
                .api
                .create_internet_gateway(region, &vpc_id)
                .await
                .map_err(|e| Error::backend("create internet gateway", &vpc_id, e))?;
            state.cloud_infra.network.gateway_id = id;
            store.write(state).await?;
            info!("created internet gateway");
        }

        if state.cloud_infra.network.route_table_id.is_empty() {
            let net = &state.cloud_infra.network;
            let (subnet_id, gateway_id) = (net.subnet_id.clone(), net.gateway_id.clone());
            let id = self
                .api
                .create_route_table(region, &vpc_id, &subnet_id, &gateway_id)
                .await
                .map_err(|e| Error::backend("create route table", &vpc_id, e))?;
            state.cloud_infra.network.route_table_id = id;
            store.write(state).await?;
            info!("created route table");
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        if state.cloud_infra.network.is_empty() {
            debug!("network already deleted");
            return Ok(());
        }
        let region = self.region();
        let vpc_id = state.cloud_infra.network.network_id.clone();

        let route_table_id = state.cloud_infra.network.route_table_id.clone();
        if !route_table_id.is_empty() {
            self.api
                .delete_route_table(region, &route_table_id)
                .await
                .map_err(|e| Error::backend("delete route table", &route_table_id, e))?;
            state.cloud_infra.network.route_table_id.clear();
            store.write(state).await?;
        }

        let gateway_id = state.cloud_infra.network.gateway_id.clone();
        if !gateway_id.is_empty() {
            self.api
                .delete_internet_gateway(region, &vpc_id, &gateway_id)
                .await
                .map_err(|e| Error::backend("delete internet gateway", &gateway_id, e))?;
            state.cloud_infra.network.gateway_id.clear();
            store.write(state).await?;
        }

        let subnet_id = state.cloud_infra.network.subnet_id.clone();
        if !subnet_id.is_empty() {
            self.api
                .delete_subnet(region, &subnet_id)
                .await
                .map_err(|e| Error::backend("delete subnet", &subnet_id, e))?;
            let net = &mut state.cloud_infra.network;
            net.subnet_id.clear();
            net.subnet_name.clear();
            store.write(state).await?;
        }

        if !vpc_id.is_empty() {
            self.api
                .delete_vpc(region, &vpc_id)
                .await
                .map_err(|e| Error::backend("delete vpc", &vpc_id, e))?;
        }
        state.cloud_infra.network = Default::default();
        store.write(state).await?;
        info!(%vpc_id, "deleted vpc");
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
        let name = firewall_name(&self.meta.name, role);
        let rules = rules_for(role, &state.cloud_infra.network.cidr);
        let id = self
            .api
            .create_security_group(
                self.region(),
                &state.cloud_infra.network.network_id,
                &name,
                &rules,
            )
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
        let id = state.cloud_infra.role(role).firewall_id.clone();
        if id.is_empty() {
            debug!(%role, "security group already deleted");
            return Ok(());
        }
        self.api
            .delete_security_group(self.region(), &id)
            .await
            .map_err(|e| {
                Error::backend("delete security group", format!("{} firewall {}", role, id), e)
            })?;
        let infra = state.cloud_infra.role_mut(role);
        infra.firewall_id.clear();
        infra.firewall_name.clear();
        store.write(state).await?;
        info!(%role, %id, "deleted security group");
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
            debug!(%role, index, "instance already created");
            return Ok(());
        }
        let region = self.region().to_string();
        let name = vm_name(&self.meta.name, role, index);

        let id = if existing.id.is_empty() {
            let image_id = self
                .api
                .image_id(&region, IMAGE_NAME)
                .await
                .map_err(|e| Error::backend("find image", IMAGE_NAME, e))?;
            let request = api::RunInstanceRequest {
                name: name.clone(),
                image_id,
                instance_type: vm_size(&self.meta, state, role),
                subnet_id: state.cloud_infra.network.subnet_id.clone(),
                security_group_id: state.cloud_infra.role(role).firewall_id.clone(),
                key_name: state.ssh_key.name.clone(),
            };
            let id = self
                .api
                .run_instance(&region, &request)
                .await
                .map_err(|e| Error::backend("run instance", format!("{} vm {}", role, name), e))?;
            let vm = state.cloud_infra.role_mut(role).vm_mut(index);
            vm.id = id.clone();
            vm.name = name.clone();
            vm.size = request.instance_type;
            store.write(state).await?;
            id
        } else {
            existing.id
        };

        poll_until_ready(&self.poll, &name, || {
            let api = self.api.clone();
            let region = region.clone();
            let id = id.clone();
            async move {
                let instance = api
                    .describe_instance(&region, &id)
                    .await
                    .map_err(|e| {
                        Error::backend("describe instance", format!("{} vm {}", role, id), e)
                    })?;
                Ok(instance.state == api::INSTANCE_RUNNING && !instance.public_ip.is_empty())
            }
        })
        .await?;
        let instance = self
            .api
            .describe_instance(&region, &id)
            .await
            .map_err(|e| Error::backend("describe instance", format!("{} vm {}", role, id), e))?;

        let vm = state.cloud_infra.role_mut(role).vm_mut(index);
        vm.public_ip = instance.public_ip;
        vm.private_ip = instance.private_ip;
        vm.hostname = instance.private_dns_name;
        store.write(state).await?;
        info!(%role, index, %id, "created instance");
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
                debug!(%role, index, "instance already terminated");
                return Ok(());
            }
        };
        self.api
            .terminate_instance(self.region(), &id)
            .await
            .map_err(|e| Error::backend("terminate instance", format!("{} vm {}", role, id), e))?;
        *state.cloud_infra.role_mut(role).vm_mut(index) = VmInfo::default();
        store.write(state).await?;
        info!(%role, index, %id, "terminated instance");
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
            debug!("key pair already imported");
            return Ok(());
        }
        let name = state.ssh_key.name.clone();
        let id = self
            .api
            .import_key_pair(self.region(), &name, &public_key)
            .await
            .map_err(|e| Error::backend("import key pair", &name, e))?;
        state.ssh_key.id = id;
        store.write(state).await?;
        info!(%name, "imported key pair");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_ssh_key_pair(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        if state.ssh_key.id.is_empty() {
            debug!("key pair already deleted");
            return Ok(());
        }
        let name = state.ssh_key.name.clone();
        self.api
            .delete_key_pair(self.region(), &name)
            .await
            .map_err(|e| Error::backend("delete key pair", &name, e))?;
        state.ssh_key = Default::default();
        store.write(state).await?;
        info!(%name, "deleted key pair");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()> {
        let region = self.region().to_string();
        let name = self.meta.name.clone();

        if state.cloud_infra.managed.cluster_id.is_empty() {
            let node_type = if self.meta.managed_node_size.is_empty() {
                DEFAULT_NODE_TYPE.to_string()
            } else {
                self.meta.managed_node_size.clone()
            };
            let request = api::EksRequest {
                name: name.clone(),
                kubernetes_version: self.meta.k8s_version.trim_start_matches('v').to_string(),
                subnet_ids: vec![state.cloud_infra.network.subnet_id.clone()],
                node_count,
                node_type: node_type.clone(),
            };
            let id = self
                .api
                .create_eks_cluster(&region, &request)
                .await
                .map_err(|e| Error::backend("create eks cluster", &name, e))?;
            let managed = &mut state.cloud_infra.managed;
            managed.cluster_id = id;
            managed.cluster_name = name.clone();
            managed.node_size = node_type;
            managed.node_count = node_count;
            store.write(state).await?;
            info!("created eks cluster");
        } else {
            debug!("eks cluster already created");
        }

        if !state.cluster_kubeconfig.is_empty() {
            return Ok(());
        }

        poll_until_ready(&self.poll, &name, || {
            let api = self.api.clone();
            let region = region.clone();
            let name = name.clone();
            async move {
                let cluster = api
                    .describe_eks_cluster(&region, &name)
                    .await
                    .map_err(|e| Error::backend("describe eks cluster", &name, e))?;
                Ok(cluster.status == api::CLUSTER_ACTIVE)
            }
        })
        .await?;

        let cluster = self
            .api
            .describe_eks_cluster(&region, &name)
            .await
            .map_err(|e| Error::backend("describe eks cluster", &name, e))?;
        let raw = cluster.kubeconfig.ok_or_else(|| {
            Error::backend("fetch kubeconfig", &name, "cluster reported no kubeconfig")
        })?;
        let parsed = kubeconfig::validate(&raw)?;

        state.cluster_kubeconfig_context = parsed
            .current_context
            .unwrap_or_else(|| state.context_name());
        state.cluster_kubeconfig = raw;
        store.write(state).await?;
        info!("eks cluster ready");
        Ok(())
    }

    #[instrument(level = "info", skip(self, state, store))]
    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        if state.cloud_infra.managed.cluster_id.is_empty() {
            debug!("eks cluster already deleted");
            return Ok(());
        }
        let name = state.cloud_infra.managed.cluster_name.clone();
        self.api
            .delete_eks_cluster(self.region(), &name)
            .await
            .map_err(|e| Error::backend("delete eks cluster", &name, e))?;
        state.cloud_infra.managed = Default::default();
        state.cluster_kubeconfig.clear();
        state.cluster_kubeconfig_context.clear();
        store.write(state).await?;
        info!(%name, "deleted eks cluster");
        Ok(())
    }
}

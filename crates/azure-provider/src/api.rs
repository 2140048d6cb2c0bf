//! The Azure Resource Manager calls the provider needs.

use async_trait::async_trait;
use forge::firewall::FirewallRule;
use serde::{Deserialize, Serialize};

/// Provisioning state Azure reports once a resource is usable.
pub const PROVISIONING_SUCCEEDED: &str = "Succeeded";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub private_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmRequest {
    pub resource_group: String,
    pub name: String,
    pub location: String,
    pub size: String,
    pub nic_id: String,
    pub admin_user: String,
    pub ssh_public_key: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub os_disk_id: String,
    #[serde(default)]
    pub provisioning_state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AksRequest {
    pub resource_group: String,
    pub name: String,
    pub location: String,
    pub kubernetes_version: String,
    pub node_count: usize,
    pub node_size: String,
    pub subnet_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AksCluster {
    pub id: String,
    #[serde(default)]
    pub provisioning_state: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

/// Calls against Azure. Everything except the resource group itself lives in
/// a resource group.
#[async_trait]
pub trait AzureApi: Send + Sync {
    async fn create_resource_group(&self, name: &str, location: &str) -> anyhow::Result<String>;

    async fn delete_resource_group(&self, name: &str) -> anyhow::Result<()>;

    async fn create_virtual_network(
        &self,
        resource_group: &str,
        name: &str,
        cidr: &str,
    ) -> anyhow::Result<String>;

    async fn delete_virtual_network(&self, resource_group: &str, name: &str) -> anyhow::Result<()>;

    async fn create_subnet(
        &self,
        resource_group: &str,
        network: &str,
        name: &str,
        cidr: &str,
    ) -> anyhow::Result<String>;

    async fn delete_subnet(
        &self,
        resource_group: &str,
        network: &str,
        name: &str,
    ) -> anyhow::Result<()>;

    /// Creates a network security group holding exactly `rules`.
    async fn create_security_group(
        &self,
        resource_group: &str,
        name: &str,
        rules: &[FirewallRule],
    ) -> anyhow::Result<String>;

    async fn delete_security_group(&self, resource_group: &str, name: &str) -> anyhow::Result<()>;

    async fn create_public_ip(&self, resource_group: &str, name: &str) -> anyhow::Result<PublicIp>;

    async fn delete_public_ip(&self, resource_group: &str, id: &str) -> anyhow::Result<()>;

    async fn create_network_interface(
        &self,
        resource_group: &str,
        name: &str,
        subnet_id: &str,
        security_group_id: &str,
        public_ip_id: &str,
    ) -> anyhow::Result<NetworkInterface>;

    async fn delete_network_interface(&self, resource_group: &str, id: &str) -> anyhow::Result<()>;

    async fn create_vm(&self, request: &VmRequest) -> anyhow::Result<VirtualMachine>;

    async fn delete_vm(&self, resource_group: &str, id: &str) -> anyhow::Result<()>;

    async fn delete_disk(&self, resource_group: &str, id: &str) -> anyhow::Result<()>;

    async fn create_aks(&self, request: &AksRequest) -> anyhow::Result<String>;

    async fn get_aks(&self, resource_group: &str, name: &str) -> anyhow::Result<AksCluster>;

    async fn delete_aks(&self, resource_group: &str, name: &str) -> anyhow::Result<()>;
}

//! The slice of the Civo API the provider relies on.

use async_trait::async_trait;
use forge::firewall::FirewallRule;
use serde::{Deserialize, Serialize};

/// Instance status reported once a machine has booted.
pub const INSTANCE_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, alias = "cidr_v4")]
    pub cidr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceRequest {
    pub hostname: String,
    pub size: String,
    pub region: String,
    pub template_id: String,
    pub network_id: String,
    pub firewall_id: String,
    pub sshkey_id: String,
    pub initial_user: String,
    pub public_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterRequest {
    pub name: String,
    pub region: String,
    pub network_id: String,
    pub num_target_nodes: usize,
    pub target_nodes_size: String,
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManagedCluster {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

/// Calls against Civo. `region` is always the upper-case Civo region code.
#[async_trait]
pub trait CivoApi: Send + Sync {
    async fn create_network(&self, region: &str, label: &str, cidr: &str) -> anyhow::Result<Network>;

    async fn delete_network(&self, region: &str, id: &str) -> anyhow::Result<()>;

    /// Creates a firewall on `network_id` holding exactly `rules`.
    async fn create_firewall(
        &self,
        region: &str,
        name: &str,
        network_id: &str,
        rules: &[FirewallRule],
    ) -> anyhow::Result<String>;

    async fn delete_firewall(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> anyhow::Result<String>;

    async fn delete_ssh_key(&self, id: &str) -> anyhow::Result<()>;

    /// Looks up the disk image called `name`.
    async fn disk_image_id(&self, region: &str, name: &str) -> anyhow::Result<String>;

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<String>;

    async fn get_instance(&self, region: &str, id: &str) -> anyhow::Result<Instance>;

    async fn delete_instance(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn create_cluster(&self, request: &ClusterRequest) -> anyhow::Result<String>;

    async fn get_cluster(&self, region: &str, id: &str) -> anyhow::Result<ManagedCluster>;

    async fn delete_cluster(&self, region: &str, id: &str) -> anyhow::Result<()>;
}

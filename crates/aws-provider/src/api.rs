//! The EC2 and EKS calls the provider needs.

use async_trait::async_trait;
use forge::firewall::FirewallRule;
use serde::{Deserialize, Serialize};

/// Instance state once the machine is up.
pub const INSTANCE_RUNNING: &str = "running";
/// EKS cluster status once the control plane answers.
pub const CLUSTER_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Clone, Serialize)]
pub struct RunInstanceRequest {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub key_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub private_dns_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EksRequest {
    pub name: String,
    pub kubernetes_version: String,
    pub subnet_ids: Vec<String>,
    pub node_count: usize,
    pub node_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EksCluster {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
}

/// Calls against one AWS region.
#[async_trait]
pub trait AwsApi: Send + Sync {
    async fn create_vpc(&self, region: &str, name: &str, cidr: &str) -> anyhow::Result<String>;

    async fn delete_vpc(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn create_subnet(
        &self,
        region: &str,
        vpc_id: &str,
        cidr: &str,
    ) -> anyhow::Result<String>;

    async fn delete_subnet(&self, region: &str, id: &str) -> anyhow::Result<()>;

    /// Creates an internet gateway and attaches it to `vpc_id`.
    async fn create_internet_gateway(&self, region: &str, vpc_id: &str) -> anyhow::Result<String>;

    /// Detaches the gateway from `vpc_id` and deletes it.
    async fn delete_internet_gateway(
        &self,
        region: &str,
        vpc_id: &str,
        id: &str,
    ) -> anyhow::Result<()>;

    /// Creates a route table with a default route through `gateway_id` and
    /// associates it with `subnet_id`.
    async fn create_route_table(
        &self,
        region: &str,
        vpc_id: &str,
        subnet_id: &str,
        gateway_id: &str,
    ) -> anyhow::Result<String>;

    async fn delete_route_table(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn create_security_group(
        &self,
        region: &str,
        vpc_id: &str,
        name: &str,
        rules: &[FirewallRule],
    ) -> anyhow::Result<String>;

    async fn delete_security_group(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn import_key_pair(
        &self,
        region: &str,
        name: &str,
        public_key: &str,
    ) -> anyhow::Result<String>;

    async fn delete_key_pair(&self, region: &str, name: &str) -> anyhow::Result<()>;

    /// Resolves an image name to an AMI id.
    async fn image_id(&self, region: &str, name: &str) -> anyhow::Result<String>;

    async fn run_instance(&self, region: &str, request: &RunInstanceRequest) -> anyhow::Result<String>;

    async fn describe_instance(&self, region: &str, id: &str) -> anyhow::Result<Instance>;

    async fn terminate_instance(&self, region: &str, id: &str) -> anyhow::Result<()>;

    async fn create_eks_cluster(&self, region: &str, request: &EksRequest) -> anyhow::Result<String>;

    async fn describe_eks_cluster(&self, region: &str, name: &str) -> anyhow::Result<EksCluster>;

    async fn delete_eks_cluster(&self, region: &str, name: &str) -> anyhow::Result<()>;
}

//! The persisted record of everything created so far for one cluster.
//!
//! An empty string in any identifier field means "not created yet". Providers
//! check these fields before calling their backend, which is what makes every
//! provisioning step safe to repeat after a partial failure.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The infrastructure backend a cluster lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    Civo,
    Azure,
    Aws,
    Local,
}

impl CloudKind {
    pub const ALL: [CloudKind; 4] = [
        CloudKind::Civo,
        CloudKind::Azure,
        CloudKind::Aws,
        CloudKind::Local,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudKind::Civo => "civo",
            CloudKind::Azure => "azure",
            CloudKind::Aws => "aws",
            CloudKind::Local => "local",
        }
    }
}

impl fmt::Display for CloudKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "civo" => Ok(CloudKind::Civo),
            "azure" => Ok(CloudKind::Azure),
            "aws" => Ok(CloudKind::Aws),
            "local" => Ok(CloudKind::Local),
            other => Err(Error::invalid_input(
                "provider",
                format!("unknown provider {:?}", other),
            )),
        }
    }
}

/// Whether the control plane is hosted by the vendor or built by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Managed,
    SelfManaged,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Managed => "managed",
            ClusterType::SelfManaged => "selfmanaged",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(ClusterType::Managed),
            "selfmanaged" | "self-managed" | "ha" => Ok(ClusterType::SelfManaged),
            other => Err(Error::invalid_input(
                "cluster type",
                format!("unknown cluster type {:?}", other),
            )),
        }
    }
}

/// A class of node with its own firewall policy and bootstrap script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    WorkerPlane,
    LoadBalancer,
    Datastore,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::ControlPlane,
        Role::WorkerPlane,
        Role::LoadBalancer,
        Role::Datastore,
    ];

    /// Short form used in resource names, e.g. `demo-vm-cp-0`.
    pub fn short(&self) -> &'static str {
        match self {
            Role::ControlPlane => "cp",
            Role::WorkerPlane => "wp",
            Role::LoadBalancer => "lb",
            Role::Datastore => "db",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::ControlPlane => "controlplane",
            Role::WorkerPlane => "workerplane",
            Role::LoadBalancer => "loadbalancer",
            Role::Datastore => "datastore",
        };
        f.write_str(name)
    }
}

/// The identity a state document is keyed by in every storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterKey {
    pub cloud: CloudKind,
    pub region: String,
    pub name: String,
    pub cluster_type: ClusterType,
}

impl ClusterKey {
    pub fn new(
        cloud: CloudKind,
        region: impl Into<String>,
        name: impl Into<String>,
        cluster_type: ClusterType,
    ) -> Self {
        ClusterKey {
            cloud,
            region: region.into(),
            name: name.into(),
            cluster_type,
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.cloud, self.cluster_type, self.region, self.name
        )
    }
}

/// One virtual machine and the per-VM resources created alongside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmInfo {
    pub name: String,
    pub id: String,
    pub hostname: String,
    pub size: String,
    pub public_ip: String,
    pub private_ip: String,
    /// Identifier of a separately allocated public address (Azure, AWS)
    pub public_ip_id: String,
    pub nic_id: String,
    pub disk_id: String,
}

impl VmInfo {
    /// True when no backend resource is recorded for this slot.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
            && self.public_ip_id.is_empty()
            && self.nic_id.is_empty()
            && self.disk_id.is_empty()
    }
}

/// Everything recorded for one role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleInfra {
    pub firewall_id: String,
    pub firewall_name: String,
    /// Ordered by node index
    pub vms: Vec<VmInfo>,
}

impl RoleInfra {
    /// Returns the slot for `index`, growing the list as needed.
    pub fn vm_mut(&mut self, index: usize) -> &mut VmInfo {
        if self.vms.len() <= index {
            self.vms.resize_with(index + 1, VmInfo::default);
        }
        &mut self.vms[index]
    }

    pub fn vm(&self, index: usize) -> Option<&VmInfo> {
        self.vms.get(index)
    }

    pub fn has_vms(&self) -> bool {
        self.vms.iter().any(|vm| !vm.is_empty())
    }

    pub fn public_ips(&self) -> Vec<String> {
        self.vms.iter().map(|vm| vm.public_ip.clone()).collect()
    }

    pub fn private_ips(&self) -> Vec<String> {
        self.vms.iter().map(|vm| vm.private_ip.clone()).collect()
    }

    /// Drops empty trailing slots left behind by deletions.
    pub fn compact(&mut self) {
        while matches!(self.vms.last(), Some(vm) if vm.is_empty()) {
            self.vms.pop();
        }
    }
}

/// Network level resources shared by all roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfra {
    /// Azure resource group
    pub resource_group: String,
    /// Civo network, Azure virtual network or AWS VPC
    pub network_id: String,
    pub network_name: String,
    pub subnet_id: String,
    pub subnet_name: String,
    /// AWS internet gateway
    pub gateway_id: String,
    /// AWS route table
    pub route_table_id: String,
    pub cidr: String,
}

impl NetworkInfra {
    pub fn is_empty(&self) -> bool {
        self.resource_group.is_empty()
            && self.network_id.is_empty()
            && self.subnet_id.is_empty()
            && self.gateway_id.is_empty()
            && self.route_table_id.is_empty()
    }
}

/// A vendor hosted control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedInfra {
    pub cluster_id: String,
    pub cluster_name: String,
    pub node_size: String,
    pub node_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInfra {
    pub network: NetworkInfra,
    pub control_plane: RoleInfra,
    pub worker_plane: RoleInfra,
    pub load_balancer: RoleInfra,
    pub datastore: RoleInfra,
    pub managed: ManagedInfra,
}

impl CloudInfra {
    pub fn role(&self, role: Role) -> &RoleInfra {
        match role {
            Role::ControlPlane => &self.control_plane,
            Role::WorkerPlane => &self.worker_plane,
            Role::LoadBalancer => &self.load_balancer,
            Role::Datastore => &self.datastore,
        }
    }

    pub fn role_mut(&mut self, role: Role) -> &mut RoleInfra {
        match role {
            Role::ControlPlane => &mut self.control_plane,
            Role::WorkerPlane => &mut self.worker_plane,
            Role::LoadBalancer => &mut self.load_balancer,
            Role::Datastore => &mut self.datastore,
        }
    }

    /// True while any VM or firewall is still recorded. The network must not be
    /// deleted in that case.
    pub fn has_network_dependents(&self) -> bool {
        Role::ALL.iter().any(|role| {
            let infra = self.role(*role);
            infra.has_vms() || !infra.firewall_id.is_empty()
        })
    }
}

/// The identity used to reach every VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshKeyInfo {
    pub name: String,
    /// Backend identifier of the uploaded public key
    pub id: String,
    pub user: String,
    pub private_key: String,
    pub public_key: String,
}

/// A bootstrap step recorded once it has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "step", content = "index")]
pub enum BootstrapStep {
    Datastore(usize),
    LoadBalancer,
    ControlPlane(usize),
    Kubeconfig,
    WorkerPlane(usize),
}

/// Kubernetes bootstrap data for the self-managed topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapState {
    pub k8s_version: String,
    pub etcd_version: String,
    pub cni: String,
    pub ca_cert: String,
    pub etcd_cert: String,
    pub etcd_key: String,
    pub join_token: String,
    pub completed: BTreeSet<BootstrapStep>,
}

impl BootstrapState {
    pub fn is_done(&self, step: BootstrapStep) -> bool {
        self.completed.contains(&step)
    }
}

/// The single source of truth between process invocations for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub cluster_name: String,
    pub region: String,
    pub infra_provider: CloudKind,
    pub cluster_type: ClusterType,
    #[serde(default)]
    pub cloud_infra: CloudInfra,
    #[serde(default)]
    pub ssh_key: SshKeyInfo,
    #[serde(default)]
    pub bootstrap: BootstrapState,
    #[serde(default)]
    pub cluster_kubeconfig: String,
    #[serde(default)]
    pub cluster_kubeconfig_context: String,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
}

impl StateDocument {
    /// An empty document for a cluster that is about to be created.
    pub fn new(key: &ClusterKey) -> Self {
        StateDocument {
            cluster_name: key.name.clone(),
            region: key.region.clone(),
            infra_provider: key.cloud,
            cluster_type: key.cluster_type,
            cloud_infra: CloudInfra::default(),
            ssh_key: SshKeyInfo::default(),
            bootstrap: BootstrapState::default(),
            cluster_kubeconfig: String::new(),
            cluster_kubeconfig_context: String::new(),
            is_completed: false,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(
            self.infra_provider,
            self.region.clone(),
            self.cluster_name.clone(),
            self.cluster_type,
        )
    }

    /// The kubeconfig context name given to clusters we bootstrap.
    pub fn context_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-kubeforge",
            self.cluster_name, self.region, self.cluster_type, self.infra_provider
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn document_roundtrips_through_json_with_missing_sections() {
        let raw = r#"{
            "cluster_name": "demo",
            "region": "lon1",
            "infra_provider": "civo",
            "cluster_type": "selfmanaged",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let doc: StateDocument = serde_json::from_str(raw).expect("document should parse");
        assert!(!doc.is_completed);
        assert!(doc.cloud_infra.network.network_id.is_empty());
        assert_eq!(doc.context_name(), "demo-lon1-selfmanaged-civo-kubeforge");
    }

    #[test]
    fn bootstrap_steps_survive_serialization() {
        let mut doc = StateDocument::new(&ClusterKey::new(
            CloudKind::Aws,
            "us-east-1",
            "demo",
            ClusterType::SelfManaged,
        ));
        doc.bootstrap.completed.insert(BootstrapStep::ControlPlane(0));
        doc.bootstrap.completed.insert(BootstrapStep::LoadBalancer);

        let raw = serde_json::to_string(&doc).expect("serialize");
        let back: StateDocument = serde_json::from_str(&raw).expect("deserialize");
        assert!(back.bootstrap.is_done(BootstrapStep::ControlPlane(0)));
        assert!(!back.bootstrap.is_done(BootstrapStep::ControlPlane(1)));
        assert_eq!(back, doc);
    }

    #[test]
    fn network_dependents_follow_vm_and_firewall_fields() {
        let mut infra = CloudInfra::default();
        assert!(!infra.has_network_dependents());

        infra.worker_plane.vm_mut(2).id = "vm-2".to_string();
        assert_eq!(infra.worker_plane.vms.len(), 3);
        assert!(infra.has_network_dependents());

        infra.worker_plane.vms[2].id.clear();
        infra.worker_plane.compact();
        assert!(infra.worker_plane.vms.is_empty());

        infra.datastore.firewall_id = "fw".to_string();
        assert!(infra.has_network_dependents());
    }
}

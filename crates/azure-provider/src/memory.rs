use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use forge::firewall::FirewallRule;
use forge::ledger::ResourceLedger;
use forge::orchestrator::scripts::SAMPLE_K3S_KUBECONFIG;

use crate::api::{
    AksCluster, AksRequest, AzureApi, NetworkInterface, PublicIp, VirtualMachine, VmRequest,
    PROVISIONING_SUCCEEDED,
};

const POLLS_UNTIL_READY: u32 = 2;

/// An [`AzureApi`] that keeps everything in memory. Named resources are
/// looked up by `{resource group}/{name}`.
#[derive(Default)]
pub struct InMemoryAzure {
    ledger: ResourceLedger,
    names: Mutex<HashMap<String, String>>,
}

impl InMemoryAzure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn create_named(&self, kind: &str, scope: &str, name: &str) -> anyhow::Result<String> {
        let id = self.ledger.create(kind)?;
        self.names
            .lock()
            .map_err(|_| anyhow!("name table poisoned"))?
            .insert(format!("{}/{}", scope, name), id.clone());
        Ok(id)
    }

    fn lookup(&self, scope: &str, name: &str) -> anyhow::Result<String> {
        self.names
            .lock()
            .map_err(|_| anyhow!("name table poisoned"))?
            .get(&format!("{}/{}", scope, name))
            .cloned()
            .ok_or_else(|| anyhow!("{} not found in {}", name, scope))
    }

    fn delete_named(&self, kind: &str, scope: &str, name: &str) -> anyhow::Result<()> {
        let id = self.lookup(scope, name)?;
        self.ledger.delete(kind, &id)?;
        self.names
            .lock()
            .map_err(|_| anyhow!("name table poisoned"))?
            .remove(&format!("{}/{}", scope, name));
        Ok(())
    }

    fn require_group(&self, resource_group: &str) -> anyhow::Result<()> {
        let id = self.lookup("", resource_group)?;
        anyhow::ensure!(self.ledger.exists(&id), "resource group {} not found", resource_group);
        Ok(())
    }
}

#[async_trait]
impl AzureApi for InMemoryAzure {
    async fn create_resource_group(&self, name: &str, _location: &str) -> anyhow::Result<String> {
        self.create_named("resourcegroup", "", name)
    }

    async fn delete_resource_group(&self, name: &str) -> anyhow::Result<()> {
        self.delete_named("resourcegroup", "", name)
    }

    async fn create_virtual_network(
        &self,
        resource_group: &str,
        name: &str,
        _cidr: &str,
    ) -> anyhow::Result<String> {
        self.require_group(resource_group)?;
        self.create_named("vnet", resource_group, name)
    }

    async fn delete_virtual_network(&self, resource_group: &str, name: &str) -> anyhow::Result<()> {
        self.delete_named("vnet", resource_group, name)
    }

    async fn create_subnet(
        &self,
        resource_group: &str,
        network: &str,
        name: &str,
        _cidr: &str,
    ) -> anyhow::Result<String> {
        self.lookup(resource_group, network)?;
        self.create_named("subnet", &format!("{}/{}", resource_group, network), name)
    }

    async fn delete_subnet(
        &self,
        resource_group: &str,
        network: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        self.delete_named("subnet", &format!("{}/{}", resource_group, network), name)
    }

    async fn create_security_group(
        &self,
        resource_group: &str,
        name: &str,
        _rules: &[FirewallRule],
    ) -> anyhow::Result<String> {
        self.require_group(resource_group)?;
        self.create_named("nsg", resource_group, name)
    }

    async fn delete_security_group(&self, resource_group: &str, name: &str) -> anyhow::Result<()> {
        self.delete_named("nsg", resource_group, name)
    }

    async fn create_public_ip(&self, resource_group: &str, _name: &str) -> anyhow::Result<PublicIp> {
        self.require_group(resource_group)?;
        let id = self.ledger.create("publicip")?;
        let (address, _) = self.ledger.allocate_addresses()?;
        Ok(PublicIp { id, address })
    }

    async fn delete_public_ip(&self, _resource_group: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("publicip", id)
    }

    async fn create_network_interface(
        &self,
        resource_group: &str,
        _name: &str,
        subnet_id: &str,
        security_group_id: &str,
        public_ip_id: &str,
    ) -> anyhow::Result<NetworkInterface> {
        self.require_group(resource_group)?;
        for id in [subnet_id, security_group_id, public_ip_id] {
            anyhow::ensure!(self.ledger.exists(id), "{} not found", id);
        }
        let id = self.ledger.create("nic")?;
        let (_, private_ip) = self.ledger.allocate_addresses()?;
        Ok(NetworkInterface { id, private_ip })
    }

    async fn delete_network_interface(&self, _resource_group: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("nic", id)
    }

    async fn create_vm(&self, request: &VmRequest) -> anyhow::Result<VirtualMachine> {
        anyhow::ensure!(self.ledger.exists(&request.nic_id), "nic {} not found", request.nic_id);
        let id = self.ledger.create("vm")?;
        let os_disk_id = self.ledger.create("disk")?;
        Ok(VirtualMachine {
            id,
            os_disk_id,
            provisioning_state: PROVISIONING_SUCCEEDED.to_string(),
        })
    }

    async fn delete_vm(&self, _resource_group: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("vm", id)
    }

    async fn delete_disk(&self, _resource_group: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("disk", id)
    }

    async fn create_aks(&self, request: &AksRequest) -> anyhow::Result<String> {
        self.require_group(&request.resource_group)?;
        anyhow::ensure!(request.node_count > 0, "at least one node is required");
        self.create_named("aks", &request.resource_group, &request.name)
    }

    async fn get_aks(&self, resource_group: &str, name: &str) -> anyhow::Result<AksCluster> {
        let id = self.lookup(resource_group, name)?;
        let ready = self.ledger.poll(&id)? >= POLLS_UNTIL_READY;
        Ok(AksCluster {
            id,
            provisioning_state: if ready { PROVISIONING_SUCCEEDED } else { "Creating" }.to_string(),
            kubeconfig: ready.then(|| SAMPLE_K3S_KUBECONFIG.replace("127.0.0.1", "203.0.113.201")),
        })
    }

    async fn delete_aks(&self, resource_group: &str, name: &str) -> anyhow::Result<()> {
        self.delete_named("aks", resource_group, name)
    }
}

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use forge::firewall::FirewallRule;
use forge::ledger::ResourceLedger;
use forge::orchestrator::scripts::SAMPLE_K3S_KUBECONFIG;

use crate::api::{
    CivoApi, ClusterRequest, Instance, InstanceRequest, ManagedCluster, Network, INSTANCE_ACTIVE,
};

/// Polls an instance or cluster needs before it reports ready.
const POLLS_UNTIL_READY: u32 = 2;

/// A [`CivoApi`] that keeps everything in memory. Instances and clusters
/// become ready after a couple of polls.
#[derive(Default)]
pub struct InMemoryCivo {
    ledger: ResourceLedger,
    instances: Mutex<HashMap<String, (String, String, String)>>,
}

impl InMemoryCivo {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resources this backend holds.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }
}

#[async_trait]
impl CivoApi for InMemoryCivo {
    async fn create_network(&self, _region: &str, label: &str, cidr: &str) -> anyhow::Result<Network> {
        Ok(Network {
            id: self.ledger.create("network")?,
            label: label.to_string(),
            cidr: cidr.to_string(),
        })
    }

    async fn delete_network(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("network", id)
    }

    async fn create_firewall(
        &self,
        _region: &str,
        _name: &str,
        network_id: &str,
        _rules: &[FirewallRule],
    ) -> anyhow::Result<String> {
        anyhow::ensure!(self.ledger.exists(network_id), "network {} not found", network_id);
        self.ledger.create("firewall")
    }

    async fn delete_firewall(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("firewall", id)
    }

    async fn create_ssh_key(&self, _name: &str, _public_key: &str) -> anyhow::Result<String> {
        self.ledger.create("sshkey")
    }

    async fn delete_ssh_key(&self, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("sshkey", id)
    }

    async fn disk_image_id(&self, _region: &str, name: &str) -> anyhow::Result<String> {
        Ok(format!("image-{}", name))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.ledger.exists(&request.network_id),
            "network {} not found",
            request.network_id
        );
        let id = self.ledger.create("instance")?;
        let (public, private) = self.ledger.allocate_addresses()?;
        self.instances
            .lock()
            .map_err(|_| anyhow::anyhow!("instance table poisoned"))?
            .insert(id.clone(), (request.hostname.clone(), public, private));
        Ok(id)
    }

    async fn get_instance(&self, _region: &str, id: &str) -> anyhow::Result<Instance> {
        let polls = self.ledger.poll(id)?;
        let (hostname, public_ip, private_ip) = self
            .instances
            .lock()
            .map_err(|_| anyhow::anyhow!("instance table poisoned"))?
            .get(id)
            .cloned()
            .unwrap_or_default();
        let status = if polls >= POLLS_UNTIL_READY {
            INSTANCE_ACTIVE
        } else {
            "BUILDING"
        };
        Ok(Instance {
            id: id.to_string(),
            hostname,
            status: status.to_string(),
            public_ip,
            private_ip,
        })
    }

    async fn delete_instance(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("instance", id)
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> anyhow::Result<String> {
        anyhow::ensure!(request.num_target_nodes > 0, "at least one node is required");
        self.ledger.create("cluster")
    }

    async fn get_cluster(&self, _region: &str, id: &str) -> anyhow::Result<ManagedCluster> {
        let polls = self.ledger.poll(id)?;
        let ready = polls >= POLLS_UNTIL_READY;
        Ok(ManagedCluster {
            id: id.to_string(),
            status: if ready { "ACTIVE" } else { "BUILDING" }.to_string(),
            ready,
            kubeconfig: ready.then(|| SAMPLE_K3S_KUBECONFIG.replace("127.0.0.1", "203.0.113.200")),
        })
    }

    async fn delete_cluster(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("cluster", id)
    }
}

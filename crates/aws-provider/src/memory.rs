use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use forge::firewall::FirewallRule;
use forge::ledger::ResourceLedger;
use forge::orchestrator::scripts::SAMPLE_K3S_KUBECONFIG;

use crate::api::{
    AwsApi, EksCluster, EksRequest, Instance, RunInstanceRequest, CLUSTER_ACTIVE, INSTANCE_RUNNING,
};

const POLLS_UNTIL_READY: u32 = 2;

/// An [`AwsApi`] that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryAws {
    ledger: ResourceLedger,
    instances: Mutex<HashMap<String, (String, String)>>,
    clusters: Mutex<HashMap<String, String>>,
    key_pairs: Mutex<HashMap<String, String>>,
}

impl InMemoryAws {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    fn require(&self, what: &str, id: &str) -> anyhow::Result<()> {
        anyhow::ensure!(self.ledger.exists(id), "{} {} not found", what, id);
        Ok(())
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory table poisoned")
}

#[async_trait]
impl AwsApi for InMemoryAws {
    async fn create_vpc(&self, _region: &str, _name: &str, _cidr: &str) -> anyhow::Result<String> {
        self.ledger.create("vpc")
    }

    async fn delete_vpc(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("vpc", id)
    }

    async fn create_subnet(&self, _region: &str, vpc_id: &str, _cidr: &str) -> anyhow::Result<String> {
        self.require("vpc", vpc_id)?;
        self.ledger.create("subnet")
    }

    async fn delete_subnet(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("subnet", id)
    }

    async fn create_internet_gateway(&self, _region: &str, vpc_id: &str) -> anyhow::Result<String> {
        self.require("vpc", vpc_id)?;
        self.ledger.create("igw")
    }

    async fn delete_internet_gateway(
        &self,
        _region: &str,
        _vpc_id: &str,
        id: &str,
    ) -> anyhow::Result<()> {
        self.ledger.delete("igw", id)
    }

    async fn create_route_table(
        &self,
        _region: &str,
        vpc_id: &str,
        subnet_id: &str,
        gateway_id: &str,
    ) -> anyhow::Result<String> {
        self.require("vpc", vpc_id)?;
        self.require("subnet", subnet_id)?;
        self.require("internet gateway", gateway_id)?;
        self.ledger.create("rtb")
    }

    async fn delete_route_table(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("rtb", id)
    }

    async fn create_security_group(
        &self,
        _region: &str,
        vpc_id: &str,
        _name: &str,
        _rules: &[FirewallRule],
    ) -> anyhow::Result<String> {
        self.require("vpc", vpc_id)?;
        self.ledger.create("sg")
    }

    async fn delete_security_group(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("sg", id)
    }

    async fn import_key_pair(
        &self,
        _region: &str,
        name: &str,
        _public_key: &str,
    ) -> anyhow::Result<String> {
        let id = self.ledger.create("keypair")?;
        self.key_pairs
            .lock()
            .map_err(poisoned)?
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn delete_key_pair(&self, _region: &str, name: &str) -> anyhow::Result<()> {
        let id = self
            .key_pairs
            .lock()
            .map_err(poisoned)?
            .remove(name)
            .ok_or_else(|| anyhow!("key pair {} not found", name))?;
        self.ledger.delete("keypair", &id)
    }

    async fn image_id(&self, _region: &str, _name: &str) -> anyhow::Result<String> {
        Ok("ami-0123456789abcdef0".to_string())
    }

    async fn run_instance(&self, _region: &str, request: &RunInstanceRequest) -> anyhow::Result<String> {
        self.require("subnet", &request.subnet_id)?;
        self.require("security group", &request.security_group_id)?;
        let id = self.ledger.create("instance")?;
        let addresses = self.ledger.allocate_addresses()?;
        self.instances
            .lock()
            .map_err(poisoned)?
            .insert(id.clone(), addresses);
        Ok(id)
    }

    async fn describe_instance(&self, _region: &str, id: &str) -> anyhow::Result<Instance> {
        let polls = self.ledger.poll(id)?;
        let (public_ip, private_ip) = self
            .instances
            .lock()
            .map_err(poisoned)?
            .get(id)
            .cloned()
            .unwrap_or_default();
        let running = polls >= POLLS_UNTIL_READY;
        Ok(Instance {
            id: id.to_string(),
            state: if running { INSTANCE_RUNNING } else { "pending" }.to_string(),
            public_ip: if running { public_ip } else { String::new() },
            private_dns_name: format!("ip-{}", private_ip.replace('.', "-")),
            private_ip,
        })
    }

    async fn terminate_instance(&self, _region: &str, id: &str) -> anyhow::Result<()> {
        self.ledger.delete("instance", id)
    }

    async fn create_eks_cluster(&self, _region: &str, request: &EksRequest) -> anyhow::Result<String> {
        anyhow::ensure!(request.node_count > 0, "at least one node is required");
        for subnet in &request.subnet_ids {
            self.require("subnet", subnet)?;
        }
        let id = self.ledger.create("eks")?;
        self.clusters
            .lock()
            .map_err(poisoned)?
            .insert(request.name.clone(), id.clone());
        Ok(id)
    }

    async fn describe_eks_cluster(&self, _region: &str, name: &str) -> anyhow::Result<EksCluster> {
        let id = self
            .clusters
            .lock()
            .map_err(poisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("cluster {} not found", name))?;
        let ready = self.ledger.poll(&id)? >= POLLS_UNTIL_READY;
        Ok(EksCluster {
            name: name.to_string(),
            status: if ready { CLUSTER_ACTIVE } else { "CREATING" }.to_string(),
            kubeconfig: ready.then(|| SAMPLE_K3S_KUBECONFIG.replace("127.0.0.1", "203.0.113.202")),
        })
    }

    async fn delete_eks_cluster(&self, _region: &str, name: &str) -> anyhow::Result<()> {
        let id = self
            .clusters
            .lock()
            .map_err(poisoned)?
            .remove(name)
            .ok_or_else(|| anyhow!("cluster {} not found", name))?;
        self.ledger.delete("eks", &id)
    }
}

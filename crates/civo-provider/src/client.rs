use async_trait::async_trait;
use forge::firewall::{Direction, FirewallRule, Protocol};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::api::{CivoApi, ClusterRequest, Instance, InstanceRequest, ManagedCluster, Network};

const DEFAULT_ENDPOINT: &str = "https://api.civo.com/v2";

#[derive(Deserialize)]
struct Created {
    id: String,
}

#[derive(Deserialize)]
struct DiskImage {
    id: String,
    name: String,
}

#[derive(Serialize)]
struct RuleRequest<'a> {
    region: &'a str,
    label: &'a str,
    protocol: &'a str,
    start_port: String,
    end_port: String,
    cidr: Vec<&'a str>,
    direction: &'a str,
    action: &'a str,
}

/// A [`CivoApi`] backed by the Civo REST API.
pub struct CivoClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl CivoClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_endpoint(token, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(token: impl Into<String>, endpoint: impl Into<String>) -> Self {
        CivoClient {
            http: Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.http.delete(self.url(path)).bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> anyhow::Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("civo api returned {}: {}", status, body);
        }
        Ok(response.json().await?)
    }

    async fn send_empty(&self, request: RequestBuilder) -> anyhow::Result<()> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("civo api returned {}: {}", status, body);
        }
        Ok(())
    }
}

fn protocol(rule: &FirewallRule) -> &'static str {
    match rule.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    }
}

fn direction(rule: &FirewallRule) -> &'static str {
    match rule.direction {
        Direction::Ingress => "ingress",
        Direction::Egress => "egress",
    }
}

#[async_trait]
impl CivoApi for CivoClient {
    async fn create_network(&self, region: &str, label: &str, cidr: &str) -> anyhow::Result<Network> {
        let created: Created = self
            .send(self.post("networks").json(&json!({
                "label": label,
                "region": region,
                "cidr_v4": cidr,
            })))
            .await?;
        Ok(Network {
            id: created.id,
            label: label.to_string(),
            cidr: cidr.to_string(),
        })
    }

    async fn delete_network(&self, region: &str, id: &str) -> anyhow::Result<()> {
        self.send_empty(
            self.delete(&format!("networks/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }

    async fn create_firewall(
        &self,
        region: &str,
        name: &str,
        network_id: &str,
        rules: &[FirewallRule],
    ) -> anyhow::Result<String> {
        let created: Created = self
            .send(self.post("firewalls").json(&json!({
                "name": name,
                "region": region,
                "network_id": network_id,
                "create_rules": false,
            })))
            .await?;

        for rule in rules {
            debug!(firewall = %name, rule = %rule.name, "adding firewall rule");
            let request = RuleRequest {
                region,
                label: &rule.name,
                protocol: protocol(rule),
                start_port: rule.start_port.to_string(),
                end_port: rule.end_port.to_string(),
                cidr: vec![rule.cidr.as_str()],
                direction: direction(rule),
                action: "allow",
            };
            let _: Created = self
                .send(
                    self.post(&format!("firewalls/{}/rules", created.id))
                        .json(&request),
                )
                .await?;
        }
        Ok(created.id)
    }

    async fn delete_firewall(&self, region: &str, id: &str) -> anyhow::Result<()> {
        self.send_empty(
            self.delete(&format!("firewalls/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> anyhow::Result<String> {
        let created: Created = self
            .send(self.post("sshkeys").json(&json!({
                "name": name,
                "public_key": public_key,
            })))
            .await?;
        Ok(created.id)
    }

    async fn delete_ssh_key(&self, id: &str) -> anyhow::Result<()> {
        self.send_empty(self.delete(&format!("sshkeys/{}", id))).await
    }

    async fn disk_image_id(&self, region: &str, name: &str) -> anyhow::Result<String> {
        let images: Vec<DiskImage> = self
            .send(self.get("disk_images").query(&[("region", region)]))
            .await?;
        images
            .into_iter()
            .find(|image| image.name == name)
            .map(|image| image.id)
            .ok_or_else(|| anyhow::anyhow!("disk image {} not offered in {}", name, region))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<String> {
        let created: Created = self.send(self.post("instances").json(request)).await?;
        Ok(created.id)
    }

    async fn get_instance(&self, region: &str, id: &str) -> anyhow::Result<Instance> {
        self.send(
            self.get(&format!("instances/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }

    async fn delete_instance(&self, region: &str, id: &str) -> anyhow::Result<()> {
        self.send_empty(
            self.delete(&format!("instances/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }

    async fn create_cluster(&self, request: &ClusterRequest) -> anyhow::Result<String> {
        let created: Created = self
            .send(self.post("kubernetes/clusters").json(request))
            .await?;
        Ok(created.id)
    }

    async fn get_cluster(&self, region: &str, id: &str) -> anyhow::Result<ManagedCluster> {
        self.send(
            self.get(&format!("kubernetes/clusters/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }

    async fn delete_cluster(&self, region: &str, id: &str) -> anyhow::Result<()> {
        self.send_empty(
            self.delete(&format!("kubernetes/clusters/{}", id))
                .query(&[("region", region)]),
        )
        .await
    }
}

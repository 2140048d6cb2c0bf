//! Firewall rule sets per role, shared by every backend that creates firewalls.

use serde::{Deserialize, Serialize};

use crate::state::Role;

const ANYWHERE: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub description: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub cidr: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl FirewallRule {
    fn ingress(name: &str, description: &str, cidr: &str, start_port: u16, end_port: u16) -> Self {
        FirewallRule {
            name: name.to_string(),
            description: description.to_string(),
            protocol: Protocol::Tcp,
            direction: Direction::Ingress,
            cidr: cidr.to_string(),
            start_port,
            end_port,
        }
    }

    fn egress(name: &str, protocol: Protocol) -> Self {
        FirewallRule {
            name: name.to_string(),
            description: "allow all outgoing traffic".to_string(),
            protocol,
            direction: Direction::Egress,
            cidr: ANYWHERE.to_string(),
            start_port: 1,
            end_port: 65535,
        }
    }

    /// Port range as rendered by most cloud APIs, e.g. `6443` or `30000-35000`.
    pub fn port_range(&self) -> String {
        if self.start_port == self.end_port {
            self.start_port.to_string()
        } else {
            format!("{}-{}", self.start_port, self.end_port)
        }
    }
}

fn base() -> Vec<FirewallRule> {
    vec![
        FirewallRule::ingress("ssh", "SSH access for bootstrap", ANYWHERE, 22, 22),
        FirewallRule::egress("all_tcp_outgoing", Protocol::Tcp),
        FirewallRule::egress("all_udp_outgoing", Protocol::Udp),
    ]
}

/// The rules a role's firewall is created with. `cidr` is the private network
/// range cluster-internal traffic is allowed from.
pub fn rules_for(role: Role, cidr: &str) -> Vec<FirewallRule> {
    let mut rules = match role {
        Role::ControlPlane => vec![
            FirewallRule::ingress("kubernetes_api_server", "Kubernetes API server", cidr, 6443, 6443),
            FirewallRule::ingress("kubelet_api", "Kubelet API", cidr, 10250, 10250),
            FirewallRule::ingress("kubernetes_nodeport", "NodePort services", cidr, 30000, 35000),
            FirewallRule::ingress("cni_flannel_vxlan", "Flannel VXLAN", cidr, 8472, 8472),
        ],
        Role::WorkerPlane => vec![
            FirewallRule::ingress("kubelet_api", "Kubelet API", cidr, 10250, 10250),
            FirewallRule::ingress("cni_flannel_vxlan", "Flannel VXLAN", cidr, 8472, 8472),
        ],
        Role::LoadBalancer => vec![
            FirewallRule::ingress("kubernetes_api_server", "Kubernetes API server", ANYWHERE, 6443, 6443),
            FirewallRule::ingress("kubernetes_nodeport", "NodePort services", ANYWHERE, 30000, 35000),
        ],
        Role::Datastore => vec![FirewallRule::ingress(
            "etcd",
            "etcd client and peer traffic",
            cidr,
            2379,
            2380,
        )],
    };
    rules.extend(base());
    rules
}

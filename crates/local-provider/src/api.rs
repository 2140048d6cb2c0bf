//! What the provider needs from `kind`.

use async_trait::async_trait;
use serde::Serialize;

/// The `kind` cluster configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindConfig {
    pub kind: String,
    pub api_version: String,
    pub nodes: Vec<KindNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindNode {
    pub role: String,
}

impl KindConfig {
    /// One control plane plus `node_count - 1` workers.
    pub fn with_nodes(node_count: usize) -> Self {
        let mut nodes = vec![KindNode {
            role: "control-plane".to_string(),
        }];
        nodes.extend((1..node_count).map(|_| KindNode {
            role: "worker".to_string(),
        }));
        KindConfig {
            kind: "Cluster".to_string(),
            api_version: "kind.x-k8s.io/v1alpha4".to_string(),
            nodes,
        }
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[async_trait]
pub trait KindApi: Send + Sync {
    /// Creates cluster `name` from `config` using node image `image`.
    async fn create_cluster(&self, name: &str, image: &str, config: &KindConfig) -> anyhow::Result<()>;

    /// The external kubeconfig of cluster `name`.
    async fn get_kubeconfig(&self, name: &str) -> anyhow::Result<String>;

    async fn delete_cluster(&self, name: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_has_one_control_plane_and_the_rest_workers() {
        let yaml = KindConfig::with_nodes(3).to_yaml().unwrap();
        assert!(yaml.contains("apiVersion: kind.x-k8s.io/v1alpha4"));
        assert_eq!(yaml.matches("role: control-plane").count(), 1);
        assert_eq!(yaml.matches("role: worker").count(), 2);
    }
}

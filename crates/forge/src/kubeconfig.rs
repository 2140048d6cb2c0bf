//! Handling of the admin kubeconfig retrieved from the first control plane.

use std::path::Path;

use serde_yaml::Value;

use crate::error::{Error, Result};

const LOOPBACK: &str = "127.0.0.1";
const K3S_DEFAULT_NAME: &str = "default";

/// Points every cluster server at `endpoint` instead of the loopback address,
/// and renames the `default` cluster, user and context to `context`.
///
/// Anything else in the document is kept as retrieved. The result must parse
/// as a kubeconfig.
pub fn rewrite(raw: &str, endpoint: &str, context: &str) -> Result<String> {
    let mut doc: Value =
        serde_yaml::from_str(raw).map_err(|e| Error::kubeconfig("parse", e))?;
    if doc.as_mapping().is_none() {
        return Err(Error::kubeconfig("parse", "document is not a mapping"));
    }

    for cluster in entries_mut(&mut doc, "clusters") {
        rename(cluster, "name", context);
        if let Some(server) = field_mut(cluster, "cluster").and_then(|c| field_mut(c, "server")) {
            if let Some(url) = server.as_str() {
                *server = Value::String(url.replacen(LOOPBACK, endpoint, 1));
            }
        }
    }
    for ctx in entries_mut(&mut doc, "contexts") {
        rename(ctx, "name", context);
        if let Some(inner) = field_mut(ctx, "context") {
            rename(inner, "cluster", context);
            rename(inner, "user", context);
        }
    }
    for user in entries_mut(&mut doc, "users") {
        rename(user, "name", context);
    }
    rename(&mut doc, "current-context", context);

    let out = serde_yaml::to_string(&doc).map_err(|e| Error::kubeconfig("serialize", e))?;
    validate(&out)?;
    Ok(out)
}

/// Checks that `raw` is a kubeconfig with at least one cluster.
pub fn validate(raw: &str) -> Result<kube::config::Kubeconfig> {
    let config: kube::config::Kubeconfig =
        serde_yaml::from_str(raw).map_err(|e| Error::kubeconfig("validate", e))?;
    if config.clusters.is_empty() {
        return Err(Error::kubeconfig("validate", "no clusters defined"));
    }
    Ok(config)
}

/// Writes `contents` to `path`, creating parent directories.
pub async fn save(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::kubeconfig(format!("create {}", parent.display()), e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| Error::kubeconfig(format!("write {}", path.display()), e))
}

fn field_mut<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    value
        .as_mapping_mut()?
        .get_mut(&Value::String(key.to_string()))
}

fn entries_mut<'a>(doc: &'a mut Value, key: &str) -> impl Iterator<Item = &'a mut Value> {
    field_mut(doc, key)
        .and_then(Value::as_sequence_mut)
        .into_iter()
        .flat_map(|seq| seq.iter_mut())
}

fn rename(value: &mut Value, key: &str, to: &str) {
    if let Some(field) = field_mut(value, key) {
        if field.as_str() == Some(K3S_DEFAULT_NAME) {
            *field = Value::String(to.to_string());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    const K3S_KUBECONFIG: &str = r#"apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTi==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: LS0tLS1DRVJU==
    client-key-data: LS0tLS1LRVk==
"#;

    #[test]
    fn points_server_at_load_balancer() {
        let out = rewrite(K3S_KUBECONFIG, "10.0.0.5", "demo-lon1-selfmanaged-civo-kubeforge")
            .expect("rewrite should succeed");
        assert!(out.contains("https://10.0.0.5:6443"));
        assert!(!out.contains("127.0.0.1"));

        let config = validate(&out).expect("still a kubeconfig");
        assert_eq!(config.clusters[0].name, "demo-lon1-selfmanaged-civo-kubeforge");
    }

    #[test]
    fn renames_default_entries_only() {
        let out = rewrite(K3S_KUBECONFIG, "10.0.0.5", "ctx").expect("rewrite");
        let doc: Value = serde_yaml::from_str(&out).expect("yaml");
        assert_eq!(doc["current-context"].as_str(), Some("ctx"));
        assert_eq!(doc["contexts"][0]["context"]["user"].as_str(), Some("ctx"));
        assert_eq!(doc["users"][0]["name"].as_str(), Some("ctx"));
        assert_eq!(doc["kind"].as_str(), Some("Config"));
        assert_eq!(
            doc["users"][0]["user"]["client-key-data"].as_str(),
            Some("LS0tLS1LRVk==")
        );
    }

    #[test]
    fn garbage_fails_with_kubeconfig_error() {
        let err = rewrite("just some text", "10.0.0.5", "ctx").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KubeconfigOperationFailed);

        let err = validate("apiVersion: v1\nkind: Config\nclusters: []\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KubeconfigOperationFailed);
    }

    #[tokio::test]
    async fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("kubeconfig").join("demo.yaml");
        save(&path, K3S_KUBECONFIG).await.expect("save");
        assert_eq!(
            tokio::fs::read_to_string(&path).await.expect("read back"),
            K3S_KUBECONFIG
        );
    }
}

use std::io::Write;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::api::{KindApi, KindConfig};

/// A [`KindApi`] running the `kind` binary found on `PATH`.
pub struct KindCli {
    binary: String,
}

impl KindCli {
    pub fn new() -> Self {
        Self::with_binary("kind")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        KindCli {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!(binary = %self.binary, ?args, "running kind");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "kind {} failed with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

impl Default for KindCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KindApi for KindCli {
    async fn create_cluster(&self, name: &str, image: &str, config: &KindConfig) -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(config.to_yaml()?.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.run(&[
            "create", "cluster", "--name", name, "--image", image, "--config", &path,
        ])
        .await?;
        Ok(())
    }

    async fn get_kubeconfig(&self, name: &str) -> anyhow::Result<String> {
        self.run(&["get", "kubeconfig", "--name", name]).await
    }

    async fn delete_cluster(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["delete", "cluster", "--name", name]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let cli = KindCli::with_binary("kubeforge-no-such-kind-binary");
        assert!(cli.get_kubeconfig("demo").await.is_err());
    }
}

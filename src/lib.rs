//! Wires the kubeforge engine to its cloud backends.
//!
//! [`CloudProvider`] is the closed set of backends, selected by
//! [`CloudKind`]. A [`Factory`] turns a [`Config`] into the storage backend,
//! the remote execution strategy and one [`Orchestrator`] per cluster.
//!
//! ```rust,no_run
//! use forge::config::Config;
//! use forge::{ClusterMetadata, CloudKind, ClusterType};
//! use kubeforge::Factory;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let factory = Factory::new(Config::default_config()?)?;
//! let meta = ClusterMetadata::new("demo", "local", CloudKind::Local, ClusterType::Managed);
//! let state = factory.orchestrator(meta)?.create_managed().await?;
//! println!("{}", state.cluster_kubeconfig_context);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use aws_provider::{AwsProvider, InMemoryAws};
use azure_provider::{AzureProvider, InMemoryAzure};
use civo_provider::{CivoClient, CivoProvider, InMemoryCivo};
use forge::config::{Config, ExecutionMode, StorageKind};
use forge::orchestrator::scripts::dry_run_executor;
use forge::provider::{cluster_infos, ClusterInfo, HaClusterState};
use forge::ssh::{RemoteExecutor, SshExecutor};
use forge::store::{ClusterFilter, LocalStore, MemoryStore, Storage};
use forge::{ClusterMetadata, CloudKind, Orchestrator, Provider, Result, Role, StateDocument};
use local_provider::{InMemoryKind, KindCli, LocalProvider};

/// One of the supported backends.
pub enum CloudProvider {
    Civo(CivoProvider),
    Azure(AzureProvider),
    Aws(AwsProvider),
    Local(LocalProvider),
}

macro_rules! dispatch {
    ($self:ident, $p:ident => $call:expr) => {
        match $self {
            CloudProvider::Civo($p) => $call,
            CloudProvider::Azure($p) => $call,
            CloudProvider::Aws($p) => $call,
            CloudProvider::Local($p) => $call,
        }
    };
}

#[async_trait]
impl Provider for CloudProvider {
    fn cloud(&self) -> CloudKind {
        dispatch!(self, p => p.cloud())
    }

    fn metadata(&self) -> &ClusterMetadata {
        dispatch!(self, p => p.metadata())
    }

    fn supports_self_managed(&self) -> bool {
        dispatch!(self, p => p.supports_self_managed())
    }

    fn regions(&self) -> &[&'static str] {
        dispatch!(self, p => p.regions())
    }

    async fn new_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        dispatch!(self, p => p.new_network(state, store).await)
    }

    async fn del_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        dispatch!(self, p => p.del_network(state, store).await)
    }

    async fn new_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()> {
        dispatch!(self, p => p.new_firewall(state, store, role).await)
    }

    async fn del_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()> {
        dispatch!(self, p => p.del_firewall(state, store, role).await)
    }

    async fn new_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()> {
        dispatch!(self, p => p.new_vm(state, store, role, index).await)
    }

    async fn del_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()> {
        dispatch!(self, p => p.del_vm(state, store, role, index).await)
    }

    async fn create_upload_ssh_key_pair(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        dispatch!(self, p => p.create_upload_ssh_key_pair(state, store).await)
    }

    async fn del_ssh_key_pair(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()> {
        dispatch!(self, p => p.del_ssh_key_pair(state, store).await)
    }

    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()> {
        dispatch!(self, p => p.new_managed_cluster(state, store, node_count).await)
    }

    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()> {
        dispatch!(self, p => p.del_managed_cluster(state, store).await)
    }

    fn get_state_for_ha_cluster(&self, state: &StateDocument) -> Result<HaClusterState> {
        dispatch!(self, p => p.get_state_for_ha_cluster(state))
    }
}

/// The in-memory backends used in fake execution mode. They outlive single
/// operations so a cluster created by one orchestrator can be deleted by the
/// next.
#[derive(Default)]
pub struct FakeBackends {
    pub civo: Arc<InMemoryCivo>,
    pub azure: Arc<InMemoryAzure>,
    pub aws: Arc<InMemoryAws>,
    pub kind: Arc<InMemoryKind>,
}

/// Builds providers and orchestrators from a [`Config`].
pub struct Factory {
    config: Config,
    store: Arc<dyn Storage>,
    executor: Arc<dyn RemoteExecutor>,
    fakes: FakeBackends,
}

impl Factory {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Storage> = match config.storage {
            StorageKind::Local => Arc::new(LocalStore::new(config.state_dir())),
            StorageKind::Memory => Arc::new(MemoryStore::new()),
        };
        let executor: Arc<dyn RemoteExecutor> = match config.execution {
            ExecutionMode::Real => Arc::new(SshExecutor::new(config.ssh.clone())),
            ExecutionMode::Fake => Arc::new(dry_run_executor()),
        };
        Ok(Factory {
            config,
            store,
            executor,
            fakes: FakeBackends::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn Storage> {
        self.store.clone()
    }

    /// The in-memory backends fake execution mode provisions against.
    pub fn fakes(&self) -> &FakeBackends {
        &self.fakes
    }

    /// The backend named by `meta.provider`.
    pub fn provider(&self, meta: ClusterMetadata) -> anyhow::Result<CloudProvider> {
        let fake = self.config.execution == ExecutionMode::Fake;
        let user = self.config.ssh_user.clone();
        let poll = self.config.managed_poll.clone();

        let provider = match meta.provider {
            CloudKind::Civo => {
                let api: Arc<dyn civo_provider::CivoApi> = if fake {
                    self.fakes.civo.clone()
                } else {
                    let token = self.config.civo_token.clone().ok_or_else(|| {
                        anyhow::anyhow!("a Civo API token is required; set CIVO_TOKEN")
                    })?;
                    Arc::new(CivoClient::new(token))
                };
                CloudProvider::Civo(CivoProvider::new(meta, api, user, poll))
            }
            CloudKind::Azure => {
                anyhow::ensure!(
                    fake,
                    "no Azure API client is available; run with --execution fake"
                );
                CloudProvider::Azure(AzureProvider::new(
                    meta,
                    self.fakes.azure.clone(),
                    user,
                    poll,
                ))
            }
            CloudKind::Aws => {
                anyhow::ensure!(
                    fake,
                    "no AWS API client is available; run with --execution fake"
                );
                CloudProvider::Aws(AwsProvider::new(meta, self.fakes.aws.clone(), user, poll))
            }
            CloudKind::Local => {
                let api: Arc<dyn local_provider::KindApi> = if fake {
                    self.fakes.kind.clone()
                } else {
                    Arc::new(KindCli::new())
                };
                CloudProvider::Local(LocalProvider::new(meta, api))
            }
        };
        Ok(provider)
    }

    /// An orchestrator for the cluster described by `meta`.
    pub fn orchestrator(&self, meta: ClusterMetadata) -> anyhow::Result<Orchestrator<CloudProvider>> {
        Ok(Orchestrator::new(
            self.provider(meta)?,
            self.store.clone(),
            self.executor.clone(),
            self.config.teardown.clone(),
        ))
    }

    /// Summaries of every stored cluster matching `filter`, on any backend.
    pub async fn list(&self, filter: &ClusterFilter) -> Result<Vec<ClusterInfo>> {
        cluster_infos(self.store.as_ref(), filter).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use forge::ClusterType;

    fn factory() -> Factory {
        Factory::new(Config::fake(std::env::temp_dir())).unwrap()
    }

    #[test]
    fn providers_match_the_requested_cloud() {
        let factory = factory();
        for cloud in CloudKind::ALL {
            let meta = ClusterMetadata::new("demo", "x", cloud, ClusterType::Managed);
            let provider = factory.provider(meta).unwrap();
            assert_eq!(provider.cloud(), cloud);
        }
    }

    #[test]
    fn real_civo_needs_a_token() {
        let mut config = Config::fake(std::env::temp_dir());
        config.execution = ExecutionMode::Real;
        let factory = Factory::new(config).unwrap();
        let meta = ClusterMetadata::new("demo", "lon1", CloudKind::Civo, ClusterType::Managed);
        assert!(factory.provider(meta).is_err());
    }

    #[test]
    fn only_local_rejects_self_managed() {
        let factory = factory();
        for cloud in CloudKind::ALL {
            let meta = ClusterMetadata::new("demo", "x", cloud, ClusterType::SelfManaged);
            let provider = factory.provider(meta).unwrap();
            assert_eq!(provider.supports_self_managed(), cloud != CloudKind::Local);
        }
    }
}

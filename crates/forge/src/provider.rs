//! The capabilities a cloud backend offers the orchestrator.
//!
//! Every provisioning operation follows the same shape: skip when the state
//! document already records the resource, otherwise call the backend, record
//! the new identifier and checkpoint the document. Deletions clear the field
//! and checkpoint. That shape is what lets a failed run be resumed or torn down
//! from whatever was persisted.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::backoff::{retry_with_backoff, FixedBackoffStrategy};
use crate::config::ManagedPollSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::keys::generate_ssh_key_pair;
use crate::metadata::ClusterMetadata;
use crate::state::{CloudKind, ClusterType, Role, StateDocument};
use crate::store::{ClusterFilter, Storage};

const NOT_READY_STEP: &str = "await readiness";

/// Why a state document is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Creating or resuming a create; a missing document is started fresh
    Create,
    /// Reading or scaling an existing cluster
    Get,
    /// Tearing down an existing cluster
    Delete,
}

/// Addresses of one role's machines, ordered by node index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleAddresses {
    pub control_planes: Vec<String>,
    pub worker_planes: Vec<String>,
    pub datastores: Vec<String>,
    pub load_balancer: String,
}

/// What the bootstrap phase needs to reach the machines of an HA cluster.
#[derive(Clone)]
pub struct HaClusterState {
    pub ssh_user: String,
    pub ssh_private_key: String,
    pub public: RoleAddresses,
    pub private: RoleAddresses,
}

impl std::fmt::Debug for HaClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaClusterState")
            .field("ssh_user", &self.ssh_user)
            .field("public", &self.public)
            .field("private", &self.private)
            .finish_non_exhaustive()
    }
}

/// A summary of one stored cluster, as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub name: String,
    pub region: String,
    pub cloud: CloudKind,
    pub cluster_type: ClusterType,
    pub no_cp: usize,
    pub no_wp: usize,
    pub no_ds: usize,
    pub cp_size: String,
    pub wp_size: String,
    pub ds_size: String,
    pub lb_size: String,
    pub managed_node_size: String,
    pub managed_node_count: usize,
    pub public_ips: RoleAddresses,
    pub k8s_version: String,
    pub is_completed: bool,
}

impl From<&StateDocument> for ClusterInfo {
    fn from(doc: &StateDocument) -> Self {
        let infra = &doc.cloud_infra;
        let size = |role: Role| {
            infra
                .role(role)
                .vms
                .iter()
                .map(|vm| vm.size.as_str())
                .find(|size| !size.is_empty())
                .unwrap_or_default()
                .to_string()
        };
        let count = |role: Role| infra.role(role).vms.iter().filter(|vm| !vm.is_empty()).count();
        ClusterInfo {
            name: doc.cluster_name.clone(),
            region: doc.region.clone(),
            cloud: doc.infra_provider,
            cluster_type: doc.cluster_type,
            no_cp: count(Role::ControlPlane),
            no_wp: count(Role::WorkerPlane),
            no_ds: count(Role::Datastore),
            cp_size: size(Role::ControlPlane),
            wp_size: size(Role::WorkerPlane),
            ds_size: size(Role::Datastore),
            lb_size: size(Role::LoadBalancer),
            managed_node_size: infra.managed.node_size.clone(),
            managed_node_count: infra.managed.node_count,
            public_ips: addresses(doc, |vm| vm.public_ip.clone()),
            k8s_version: doc.bootstrap.k8s_version.clone(),
            is_completed: doc.is_completed,
        }
    }
}

fn addresses(doc: &StateDocument, pick: impl Fn(&crate::state::VmInfo) -> String) -> RoleAddresses {
    let infra = &doc.cloud_infra;
    let all = |role: Role| infra.role(role).vms.iter().map(&pick).collect::<Vec<_>>();
    RoleAddresses {
        control_planes: all(Role::ControlPlane),
        worker_planes: all(Role::WorkerPlane),
        datastores: all(Role::Datastore),
        load_balancer: infra
            .load_balancer
            .vm(0)
            .map(&pick)
            .unwrap_or_default(),
    }
}

/// A cloud backend able to provision the resources of a cluster.
///
/// Operations receive the state document they act on and the store they must
/// checkpoint it to. Every operation is idempotent with respect to the
/// document.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend this is.
    fn cloud(&self) -> CloudKind;

    /// The cluster this provider was constructed for.
    fn metadata(&self) -> &ClusterMetadata;

    /// Whether the self-managed topology can be built on this backend.
    fn supports_self_managed(&self) -> bool {
        true
    }

    /// Regions this backend accepts.
    fn regions(&self) -> &[&'static str];

    /// Validates the metadata against this backend.
    fn validate(&self) -> Result<()> {
        let meta = self.metadata();
        meta.validate()?;
        meta.require_region(self.regions())?;
        if meta.cluster_type == ClusterType::SelfManaged && !self.supports_self_managed() {
            return Err(Error::invalid_input(
                "cluster type",
                format!("{} only supports managed clusters", self.cloud()),
            ));
        }
        Ok(())
    }

    /// Binds `store` to this cluster and loads its document.
    ///
    /// For [`Operation::Create`] a completed document is a `DuplicateRecord`,
    /// an incomplete one is returned for resumption and a missing one is
    /// started fresh and persisted. The other operations fail with `NotFound`
    /// when no document exists.
    async fn init_state(&self, store: &dyn Storage, operation: Operation) -> Result<StateDocument> {
        let meta = self.metadata();
        if operation == Operation::Create {
            self.validate()?;
        }
        store
            .setup(self.cloud(), &meta.region, &meta.name, meta.cluster_type)
            .await?;

        match operation {
            Operation::Create => match store.read().await {
                Ok(doc) if doc.is_completed => Err(Error::DuplicateRecord {
                    cluster: meta.key().to_string(),
                }),
                Ok(doc) => {
                    info!(cluster = %meta.key(), "resuming from stored state");
                    Ok(doc)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let doc = StateDocument::new(&meta.key());
                    store.write(&doc).await?;
                    Ok(doc)
                }
                Err(e) => Err(e),
            },
            Operation::Get | Operation::Delete => store.read().await,
        }
    }

    async fn new_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()>;

    async fn del_network(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()>;

    async fn new_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()>;

    async fn del_firewall(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
    ) -> Result<()>;

    /// Creates the VM for `role` at `index`, including any per-VM public
    /// address, interface or disk the backend needs.
    async fn new_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()>;

    async fn del_vm(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        role: Role,
        index: usize,
    ) -> Result<()>;

    /// Generates the SSH identity if the document has none and uploads its
    /// public half to the backend.
    async fn create_upload_ssh_key_pair(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()>;

    async fn del_ssh_key_pair(&self, state: &mut StateDocument, store: &dyn Storage) -> Result<()>;

    /// Creates the vendor hosted cluster, waits for it to become ready and
    /// stores its kubeconfig.
    async fn new_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
        node_count: usize,
    ) -> Result<()>;

    async fn del_managed_cluster(
        &self,
        state: &mut StateDocument,
        store: &dyn Storage,
    ) -> Result<()>;

    /// Addresses and credentials the bootstrap phase needs.
    fn get_state_for_ha_cluster(&self, state: &StateDocument) -> Result<HaClusterState> {
        ha_cluster_state(state)
    }

    /// Summaries of every stored cluster on this backend.
    async fn get_raw_cluster_infos(&self, store: &dyn Storage) -> Result<Vec<ClusterInfo>> {
        cluster_infos(
            store,
            &ClusterFilter {
                cloud: Some(self.cloud()),
                ..ClusterFilter::default()
            },
        )
        .await
    }
}

/// Reads the bootstrap view out of a document whose VMs exist.
pub fn ha_cluster_state(state: &StateDocument) -> Result<HaClusterState> {
    if state.ssh_key.private_key.is_empty() {
        return Err(Error::invalid_input("ssh key", "no identity has been generated yet"));
    }
    let infra = &state.cloud_infra;
    if !infra.load_balancer.has_vms() || !infra.control_plane.has_vms() {
        return Err(Error::invalid_input(
            "cluster state",
            "load balancer and control plane machines must exist before bootstrap",
        ));
    }
    Ok(HaClusterState {
        ssh_user: state.ssh_key.user.clone(),
        ssh_private_key: state.ssh_key.private_key.clone(),
        public: addresses(state, |vm| vm.public_ip.clone()),
        private: addresses(state, |vm| vm.private_ip.clone()),
    })
}

/// Summaries of the stored clusters matching `filter`, without modifying
/// anything.
pub async fn cluster_infos(store: &dyn Storage, filter: &ClusterFilter) -> Result<Vec<ClusterInfo>> {
    let grouped = store.get_one_or_more_clusters(filter).await?;
    let mut infos: Vec<ClusterInfo> = grouped
        .values()
        .flat_map(|docs| docs.iter().map(ClusterInfo::from))
        .collect();
    infos.sort_by(|a, b| {
        (a.cloud, a.cluster_type, &a.region, &a.name).cmp(&(b.cloud, b.cluster_type, &b.region, &b.name))
    });
    Ok(infos)
}

/// Name given to the VM of `role` at `index`, e.g. `demo-vm-cp-0`.
pub fn vm_name(cluster: &str, role: Role, index: usize) -> String {
    format!("{}-vm-{}-{}", cluster, role.short(), index)
}

/// Name given to the firewall of `role`, e.g. `demo-fw-cp`.
pub fn firewall_name(cluster: &str, role: Role) -> String {
    format!("{}-fw-{}", cluster, role.short())
}

pub fn network_name(cluster: &str) -> String {
    format!("{}-net", cluster)
}

/// The size to give a new VM of `role`: the requested one, or when the
/// request names none (scaling an existing cluster), the size already in use.
pub fn vm_size(meta: &ClusterMetadata, state: &StateDocument, role: Role) -> String {
    let requested = meta.size_for(role);
    if !requested.is_empty() {
        return requested.to_string();
    }
    state
        .cloud_infra
        .role(role)
        .vms
        .iter()
        .map(|vm| vm.size.as_str())
        .find(|size| !size.is_empty())
        .unwrap_or_default()
        .to_string()
}

pub fn ssh_key_name(cluster: &str) -> String {
    format!("{}-ssh", cluster)
}

/// Makes sure the document carries an SSH identity, generating and
/// checkpointing one when it does not. Returns the public key line.
pub async fn ensure_ssh_identity(
    state: &mut StateDocument,
    store: &dyn Storage,
    user: &str,
) -> Result<String> {
    if !state.ssh_key.private_key.is_empty() {
        debug!(cluster = %state.cluster_name, "ssh identity already generated");
        return Ok(state.ssh_key.public_key.clone());
    }

    let comment = format!("{}@kubeforge", user);
    let pair = tokio::task::spawn_blocking(move || generate_ssh_key_pair(&comment))
        .await
        .map_err(|e| Error::backend("generate ssh key", "ssh identity", e))??;

    state.ssh_key.name = ssh_key_name(&state.cluster_name);
    state.ssh_key.user = user.to_string();
    state.ssh_key.private_key = pair.private_key_pem;
    state.ssh_key.public_key = pair.public_key;
    store.write(state).await?;
    info!(cluster = %state.cluster_name, "generated ssh identity");
    Ok(state.ssh_key.public_key.clone())
}

/// Polls `check` until it reports ready, failing once `settings.attempts`
/// polls have come back not ready. Errors from the check itself end the wait
/// immediately.
pub async fn poll_until_ready<F, Fut>(
    settings: &ManagedPollSettings,
    resource: &str,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<bool>> + Send,
{
    retry_with_backoff(
        settings.attempts,
        FixedBackoffStrategy(settings.interval),
        |e: &Error| matches!(e, Error::BackendOperationFailed { step, .. } if step == NOT_READY_STEP),
        "managed cluster readiness",
        |_| {
            let ready = check();
            async move {
                if ready.await? {
                    Ok(())
                } else {
                    Err(Error::backend(NOT_READY_STEP, resource, "not ready yet"))
                }
            }
        },
    )
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::ClusterKey;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn doc() -> StateDocument {
        StateDocument::new(&ClusterKey::new(
            CloudKind::Civo,
            "lon1",
            "demo",
            ClusterType::SelfManaged,
        ))
    }

    #[test]
    fn vm_size_falls_back_to_the_recorded_size() {
        let mut state = doc();
        let mut meta = ClusterMetadata::new("demo", "lon1", CloudKind::Civo, ClusterType::SelfManaged);
        assert_eq!(vm_size(&meta, &state, Role::WorkerPlane), "");

        state.cloud_infra.worker_plane.vm_mut(0).size = "g3.large".to_string();
        assert_eq!(vm_size(&meta, &state, Role::WorkerPlane), "g3.large");

        meta.wp_size = "g3.xlarge".to_string();
        assert_eq!(vm_size(&meta, &state, Role::WorkerPlane), "g3.xlarge");
    }

    #[test]
    fn resource_names_follow_role_short_forms() {
        assert_eq!(vm_name("demo", Role::Datastore, 2), "demo-vm-db-2");
        assert_eq!(firewall_name("demo", Role::LoadBalancer), "demo-fw-lb");
    }

    #[test]
    fn ha_state_requires_machines_and_identity() {
        let mut state = doc();
        assert!(ha_cluster_state(&state).is_err());

        state.ssh_key.private_key = "key".to_string();
        state.ssh_key.user = "kubeforge".to_string();
        state.cloud_infra.load_balancer.vm_mut(0).id = "lb".to_string();
        state.cloud_infra.load_balancer.vm_mut(0).public_ip = "1.2.3.4".to_string();
        state.cloud_infra.control_plane.vm_mut(0).id = "cp".to_string();
        state.cloud_infra.control_plane.vm_mut(0).private_ip = "10.0.0.2".to_string();

        let ha = ha_cluster_state(&state).expect("ha state");
        assert_eq!(ha.public.load_balancer, "1.2.3.4");
        assert_eq!(ha.private.control_planes, vec!["10.0.0.2".to_string()]);
    }

    #[tokio::test]
    async fn identity_is_generated_once() {
        let store = MemoryStore::new();
        let mut state = doc();
        store
            .setup(CloudKind::Civo, "lon1", "demo", ClusterType::SelfManaged)
            .await
            .unwrap();

        let first = ensure_ssh_identity(&mut state, &store, "kubeforge").await.unwrap();
        assert!(first.starts_with("ssh-rsa "));
        let second = ensure_ssh_identity(&mut state, &store, "kubeforge").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.read().await.unwrap().ssh_key.public_key, first);
    }

    #[tokio::test]
    async fn polling_gives_up_after_configured_attempts() {
        let settings = ManagedPollSettings {
            attempts: 3,
            interval: Duration::ZERO,
        };
        let polls = AtomicU32::new(0);
        let err = poll_until_ready(&settings, "demo", || {
            polls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailed);
        assert_eq!(polls.load(Ordering::SeqCst), 3);

        let polls = AtomicU32::new(0);
        poll_until_ready(&settings, "demo", || {
            let n = polls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 1) }
        })
        .await
        .expect("ready on second poll");
    }

    #[tokio::test]
    async fn listing_summarizes_documents() {
        let store = MemoryStore::new();
        store
            .setup(CloudKind::Civo, "lon1", "demo", ClusterType::SelfManaged)
            .await
            .unwrap();
        let mut state = doc();
        state.cloud_infra.worker_plane.vm_mut(0).id = "w0".to_string();
        state.cloud_infra.worker_plane.vm_mut(0).size = "g3.large".to_string();
        state.is_completed = true;
        store.write(&state).await.unwrap();

        let infos = cluster_infos(&store, &ClusterFilter::default()).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].no_wp, 1);
        assert_eq!(infos[0].wp_size, "g3.large");
        assert!(infos[0].is_completed);
    }
}

//! Drives a [`Provider`] through cluster creation, bootstrap, scaling and
//! teardown.
//!
//! Every step consults the state document first and checkpoints it after, so
//! a create that was interrupted resumes where it stopped. A create that
//! starts from nothing and fails tears down whatever it managed to build.

pub mod scripts;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry_with_backoff, ExponentialBackoffStrategy};
use crate::certs::generate_certs;
use crate::config::TeardownSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::kubeconfig;
use crate::provider::{ClusterInfo, HaClusterState, Operation, Provider};
use crate::ssh::{RemoteExecutor, ScriptCollection, SshTarget};
use crate::state::{BootstrapStep, ClusterType, Role, StateDocument};
use crate::store::Storage;

use scripts::K3sServer;

/// Creation order of firewalls and machines.
const CREATE_ORDER: [Role; 4] = [
    Role::LoadBalancer,
    Role::Datastore,
    Role::ControlPlane,
    Role::WorkerPlane,
];
const VM_DELETE_ORDER: [Role; 4] = [
    Role::WorkerPlane,
    Role::ControlPlane,
    Role::LoadBalancer,
    Role::Datastore,
];
const FIREWALL_DELETE_ORDER: [Role; 4] = [
    Role::Datastore,
    Role::ControlPlane,
    Role::WorkerPlane,
    Role::LoadBalancer,
];

/// Runs cluster lifecycle operations for one cluster identity.
pub struct Orchestrator<P> {
    provider: P,
    store: Arc<dyn Storage>,
    executor: Arc<dyn RemoteExecutor>,
    teardown: TeardownSettings,
}

impl<P: Provider> Orchestrator<P> {
    pub fn new(
        provider: P,
        store: Arc<dyn Storage>,
        executor: Arc<dyn RemoteExecutor>,
        teardown: TeardownSettings,
    ) -> Self {
        Orchestrator {
            provider,
            store,
            executor,
            teardown,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Creates, or resumes creating, a vendor hosted cluster.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn create_managed(&self) -> Result<StateDocument> {
        self.require_type(ClusterType::Managed)?;
        self.provider.validate()?;
        let resuming = self.already_stored().await?;
        let mut state = self
            .provider
            .init_state(self.store.as_ref(), Operation::Create)
            .await?;

        match self.build_managed(&mut state).await {
            Ok(()) => {
                info!("managed cluster ready");
                Ok(state)
            }
            Err(e) if resuming => Err(e),
            Err(e) => {
                warn!(error = %e, "create failed, removing what was created");
                match self.teardown_managed(&mut state).await {
                    Ok(()) => Err(e),
                    Err(cleanup) => Err(e.with_cleanup_failure(cleanup)),
                }
            }
        }
    }

    /// Deletes a vendor hosted cluster, its network and its document.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn delete_managed(&self) -> Result<()> {
        self.require_type(ClusterType::Managed)?;
        let mut state = self
            .provider
            .init_state(self.store.as_ref(), Operation::Delete)
            .await?;
        self.teardown_managed(&mut state).await?;
        info!("managed cluster deleted");
        Ok(())
    }

    /// Creates, or resumes creating, a self-managed HA cluster.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn create_ha(&self) -> Result<StateDocument> {
        self.require_type(ClusterType::SelfManaged)?;
        self.provider.validate()?;
        let resuming = self.already_stored().await?;
        let mut state = self
            .provider
            .init_state(self.store.as_ref(), Operation::Create)
            .await?;

        match self.build_ha(&mut state).await {
            Ok(()) => {
                info!("ha cluster ready");
                Ok(state)
            }
            Err(e) if resuming => Err(e),
            Err(e) => {
                warn!(error = %e, "create failed, removing what was created");
                match self.teardown_ha(&mut state).await {
                    Ok(()) => Err(e),
                    Err(cleanup) => Err(e.with_cleanup_failure(cleanup)),
                }
            }
        }
    }

    /// Deletes every machine, firewall, key and network of an HA cluster, then
    /// its document.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn delete_ha(&self) -> Result<()> {
        self.require_type(ClusterType::SelfManaged)?;
        let mut state = self
            .provider
            .init_state(self.store.as_ref(), Operation::Delete)
            .await?;
        self.teardown_ha(&mut state).await?;
        info!("ha cluster deleted");
        Ok(())
    }

    /// Grows the worker plane of a completed HA cluster to `desired` nodes.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn add_worker_node(&self, desired: usize) -> Result<StateDocument> {
        self.require_type(ClusterType::SelfManaged)?;
        let store = self.store.as_ref();
        let mut state = self.provider.init_state(store, Operation::Get).await?;
        require_completed(&state)?;

        let joined = (0..)
            .take_while(|i| state.bootstrap.is_done(BootstrapStep::WorkerPlane(*i)))
            .count();
        if desired <= joined {
            return Err(Error::invalid_input(
                "worker count",
                format!("cluster already has {} workers, asked for {}", joined, desired),
            ));
        }

        for index in 0..desired {
            self.provider
                .new_vm(&mut state, store, Role::WorkerPlane, index)
                .await?;
        }

        let ha = self.provider.get_state_for_ha_cluster(&state)?;
        for index in 0..desired {
            self.join_worker(&mut state, &ha, index).await?;
        }
        info!(workers = desired, "worker plane scaled up");
        Ok(state)
    }

    /// Shrinks the worker plane of a completed HA cluster to `desired` nodes,
    /// removing the highest indices first.
    #[instrument(level = "info", skip(self), fields(cluster = %self.provider.metadata().key()))]
    pub async fn del_worker_node(&self, desired: usize) -> Result<StateDocument> {
        self.require_type(ClusterType::SelfManaged)?;
        let store = self.store.as_ref();
        let mut state = self.provider.init_state(store, Operation::Get).await?;
        require_completed(&state)?;

        state.cloud_infra.worker_plane.compact();
        let current = state.cloud_infra.worker_plane.vms.len();
        if desired >= current {
            return Err(Error::invalid_input(
                "worker count",
                format!("cluster has {} workers, asked for {}", current, desired),
            ));
        }

        let ha = self.provider.get_state_for_ha_cluster(&state)?;
        let first_cp = ha.public.control_planes.first().cloned().unwrap_or_default();
        for index in (desired..current).rev() {
            let step = BootstrapStep::WorkerPlane(index);
            if let Some(vm) = state.cloud_infra.worker_plane.vm(index) {
                let hostname = if vm.hostname.is_empty() {
                    vm.name.clone()
                } else {
                    vm.hostname.clone()
                };
                if state.bootstrap.is_done(step) && !hostname.is_empty() {
                    self.executor
                        .execute(
                            &target(&ha, &first_cp),
                            &scripts::delete_node(&hostname),
                            false,
                            true,
                        )
                        .await?;
                    info!(node = %hostname, "removed node from kubernetes");
                }
            }
            self.provider
                .del_vm(&mut state, store, Role::WorkerPlane, index)
                .await?;
            state.bootstrap.completed.remove(&step);
            state.cloud_infra.worker_plane.compact();
            store.write(&state).await?;
        }
        info!(workers = desired, "worker plane scaled down");
        Ok(state)
    }

    /// Summaries of every stored cluster on this provider's backend.
    pub async fn get_clusters(&self) -> Result<Vec<ClusterInfo>> {
        self.provider.get_raw_cluster_infos(self.store.as_ref()).await
    }

    fn require_type(&self, expected: ClusterType) -> Result<()> {
        let actual = self.provider.metadata().cluster_type;
        if actual == expected {
            Ok(())
        } else {
            Err(Error::invalid_input(
                "cluster type",
                format!("operation needs a {} cluster, got {}", expected, actual),
            ))
        }
    }

    async fn already_stored(&self) -> Result<bool> {
        let meta = self.provider.metadata();
        match self
            .store
            .already_created(self.provider.cloud(), &meta.region, &meta.name, meta.cluster_type)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn build_managed(&self, state: &mut StateDocument) -> Result<()> {
        let store = self.store.as_ref();
        let meta = self.provider.metadata();
        if state.bootstrap.k8s_version.is_empty() {
            state.bootstrap.k8s_version = meta.k8s_version.clone();
            store.write(state).await?;
        }

        self.provider.new_network(state, store).await?;
        self.provider
            .new_managed_cluster(state, store, meta.managed_node_count)
            .await?;

        state.is_completed = true;
        store.write(state).await
    }

    async fn teardown_managed(&self, state: &mut StateDocument) -> Result<()> {
        let store = self.store.as_ref();
        self.provider.del_managed_cluster(state, store).await?;
        self.delete_network(state).await?;
        store.delete_cluster().await
    }

    async fn build_ha(&self, state: &mut StateDocument) -> Result<()> {
        let store = self.store.as_ref();
        let meta = self.provider.metadata();
        if state.bootstrap.k8s_version.is_empty() {
            state.bootstrap.k8s_version = meta.k8s_version.clone();
            state.bootstrap.etcd_version = meta.etcd_version.clone();
            state.bootstrap.cni = meta.cni.to_string();
            store.write(state).await?;
        }

        self.provider.new_network(state, store).await?;
        self.provider.create_upload_ssh_key_pair(state, store).await?;
        for role in CREATE_ORDER {
            self.provider.new_firewall(state, store, role).await?;
        }
        for role in CREATE_ORDER {
            for index in 0..meta.count_for(role) {
                self.provider.new_vm(state, store, role, index).await?;
            }
        }

        self.bootstrap_ha(state).await?;

        state.is_completed = true;
        store.write(state).await
    }

    async fn bootstrap_ha(&self, state: &mut StateDocument) -> Result<()> {
        let store = self.store.as_ref();
        let ha = self.provider.get_state_for_ha_cluster(state)?;
        self.ensure_etcd_certs(state, &ha).await?;

        for (index, host) in ha.public.datastores.iter().enumerate() {
            let pipeline = scripts::datastore(
                &state.bootstrap.etcd_version,
                &state.bootstrap.ca_cert,
                &state.bootstrap.etcd_cert,
                &state.bootstrap.etcd_key,
                &ha.private.datastores,
                index,
            );
            self.run_step(state, BootstrapStep::Datastore(index), &ha, host, pipeline)
                .await?;
        }

        let pipeline = scripts::load_balancer(&ha.private.control_planes);
        self.run_step(
            state,
            BootstrapStep::LoadBalancer,
            &ha,
            &ha.public.load_balancer,
            pipeline,
        )
        .await?;

        let first_cp = ha.public.control_planes.first().cloned().unwrap_or_default();
        let pipeline = scripts::first_control_plane(&server(state, &ha));
        self.run_step(state, BootstrapStep::ControlPlane(0), &ha, &first_cp, pipeline)
            .await?;

        if state.bootstrap.join_token.is_empty() {
            let output = self
                .executor
                .execute(&target(&ha, &first_cp), &scripts::join_token(), true, true)
                .await?;
            let token = output.trim();
            if token.is_empty() {
                return Err(Error::RemoteScriptFailed {
                    host: first_cp,
                    script: scripts::JOIN_TOKEN.to_string(),
                    stderr: "empty join token".to_string(),
                });
            }
            state.bootstrap.join_token = token.to_string();
            store.write(state).await?;
            info!("join token stored");
        }

        for (index, host) in ha.public.control_planes.iter().enumerate().skip(1) {
            let pipeline =
                scripts::joining_control_plane(&server(state, &ha), &state.bootstrap.join_token);
            self.run_step(state, BootstrapStep::ControlPlane(index), &ha, host, pipeline)
                .await?;
        }

        if !state.bootstrap.is_done(BootstrapStep::Kubeconfig) {
            let raw = self
                .executor
                .execute(&target(&ha, &first_cp), &scripts::kubeconfig(), true, true)
                .await?;
            let context = state.context_name();
            let rewritten = kubeconfig::rewrite(&raw, &ha.public.load_balancer, &context)?;
            state.cluster_kubeconfig = rewritten;
            state.cluster_kubeconfig_context = context;
            state.bootstrap.completed.insert(BootstrapStep::Kubeconfig);
            store.write(state).await?;
            info!("kubeconfig stored");
        }

        for index in 0..ha.public.worker_planes.len() {
            self.join_worker(state, &ha, index).await?;
        }
        Ok(())
    }

    async fn ensure_etcd_certs(&self, state: &mut StateDocument, ha: &HaClusterState) -> Result<()> {
        let bootstrap = &state.bootstrap;
        if !bootstrap.ca_cert.is_empty()
            && !bootstrap.etcd_cert.is_empty()
            && !bootstrap.etcd_key.is_empty()
        {
            debug!("etcd certificates already issued");
            return Ok(());
        }

        let peers = ha.private.datastores.clone();
        let certs = tokio::task::spawn_blocking(move || generate_certs(peers.as_slice()))
            .await
            .map_err(|e| Error::backend("generate etcd certificates", "datastore", e))??;

        state.bootstrap.ca_cert = certs.ca_cert;
        state.bootstrap.etcd_cert = certs.leaf_cert;
        state.bootstrap.etcd_key = certs.leaf_key;
        self.store.write(state).await?;
        info!("etcd certificates issued");
        Ok(())
    }

    async fn join_worker(
        &self,
        state: &mut StateDocument,
        ha: &HaClusterState,
        index: usize,
    ) -> Result<()> {
        let host = state
            .cloud_infra
            .worker_plane
            .vm(index)
            .map(|vm| vm.public_ip.clone())
            .unwrap_or_default();
        let pipeline = scripts::worker(
            &state.bootstrap.k8s_version,
            &ha.private.load_balancer,
            &state.bootstrap.join_token,
        );
        self.run_step(state, BootstrapStep::WorkerPlane(index), ha, &host, pipeline)
            .await
    }

    async fn run_step(
        &self,
        state: &mut StateDocument,
        step: BootstrapStep,
        ha: &HaClusterState,
        host: &str,
        pipeline: ScriptCollection,
    ) -> Result<()> {
        if state.bootstrap.is_done(step) {
            debug!(?step, "bootstrap step already done");
            return Ok(());
        }
        self.executor
            .execute(&target(ha, host), &pipeline, false, false)
            .await?;
        state.bootstrap.completed.insert(step);
        self.store.write(state).await?;
        info!(?step, host, "bootstrap step done");
        Ok(())
    }

    async fn teardown_ha(&self, state: &mut StateDocument) -> Result<()> {
        let store = self.store.as_ref();

        let mut deleted_vms = false;
        for role in VM_DELETE_ORDER {
            for index in (0..state.cloud_infra.role(role).vms.len()).rev() {
                deleted_vms |= state
                    .cloud_infra
                    .role(role)
                    .vm(index)
                    .map_or(false, |vm| !vm.is_empty());
                self.provider.del_vm(state, store, role, index).await?;
            }
            state.cloud_infra.role_mut(role).compact();
        }

        if deleted_vms && !self.teardown.pause_after_vms.is_zero() {
            debug!(
                pause_secs = self.teardown.pause_after_vms.as_secs(),
                "waiting for machines to release their firewalls"
            );
            tokio::time::sleep(self.teardown.pause_after_vms).await;
        }

        for role in FIREWALL_DELETE_ORDER {
            self.provider.del_firewall(state, store, role).await?;
        }
        self.provider.del_ssh_key_pair(state, store).await?;
        self.delete_network(state).await?;
        store.delete_cluster().await
    }

    async fn delete_network(&self, state: &mut StateDocument) -> Result<()> {
        if state.cloud_infra.has_network_dependents() {
            return Err(Error::backend(
                "delete network",
                state.cloud_infra.network.network_id.clone(),
                "machines or firewalls are still recorded",
            ));
        }

        let provider = &self.provider;
        let store = self.store.as_ref();
        let cell = Mutex::new(state);
        let cell = &cell;
        retry_with_backoff(
            self.teardown.network_delete_attempts,
            ExponentialBackoffStrategy::new(
                self.teardown.network_delete_backoff,
                self.teardown.network_delete_backoff_cap,
            ),
            |e: &Error| e.kind() == ErrorKind::BackendOperationFailed,
            "delete network",
            |_| async move {
                let mut state = cell.lock().await;
                provider.del_network(&mut **state, store).await
            },
        )
        .await
    }
}

fn require_completed(state: &StateDocument) -> Result<()> {
    if state.is_completed {
        Ok(())
    } else {
        Err(Error::invalid_input(
            "cluster",
            format!("{} has not finished creating", state.key()),
        ))
    }
}

fn target(ha: &HaClusterState, host: &str) -> SshTarget {
    SshTarget {
        host: host.to_string(),
        user: ha.ssh_user.clone(),
        private_key: ha.ssh_private_key.clone(),
    }
}

fn server<'a>(state: &'a StateDocument, ha: &'a HaClusterState) -> K3sServer<'a> {
    K3sServer {
        version: &state.bootstrap.k8s_version,
        cni: state.bootstrap.cni.parse().unwrap_or_default(),
        datastore_ips: &ha.private.datastores,
        lb_public_ip: &ha.public.load_balancer,
        lb_private_ip: &ha.private.load_balancer,
        ca_cert: &state.bootstrap.ca_cert,
        etcd_cert: &state.bootstrap.etcd_cert,
        etcd_key: &state.bootstrap.etcd_key,
    }
}

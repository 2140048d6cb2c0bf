//! A crate for provisioning Kubernetes clusters on cloud backends and
//! bootstrapping them with k3s over SSH.
//!
//! The crate provides the [`Provider`] trait for declaring a cloud backend and
//! the [`Orchestrator`] type which takes a [`Provider`], a [`store::Storage`]
//! and a [`ssh::RemoteExecutor`] and drives a cluster through its lifecycle.
//! Every step is checkpointed to the store, so an interrupted create resumes
//! where it stopped.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use forge::config::TeardownSettings;
//! use forge::orchestrator::scripts::dry_run_executor;
//! use forge::store::MemoryStore;
//! use forge::Orchestrator;
//!
//! # async fn run<P: forge::Provider>(provider: P) -> forge::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     provider,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(dry_run_executor()),
//!     TeardownSettings::immediate(),
//! );
//! let state = orchestrator.create_ha().await?;
//! println!("{}", state.cluster_kubeconfig);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod certs;
pub mod config;
pub mod error;
pub mod firewall;
pub mod keys;
pub mod kubeconfig;
pub mod ledger;
pub mod metadata;
pub mod orchestrator;
pub mod provider;
pub mod ssh;
pub mod state;
pub mod store;

#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(inline)]
pub use metadata::{ClusterMetadata, Cni};
#[doc(inline)]
pub use orchestrator::Orchestrator;
#[doc(inline)]
pub use provider::{ClusterInfo, HaClusterState, Operation, Provider};
#[doc(inline)]
pub use state::{CloudKind, ClusterType, Role, StateDocument};

//! `store` persists [`StateDocument`]s keyed by cluster identity.
//!
//! A backend is bound to one identity with [`Storage::setup`] and then reads and
//! writes that identity's document. Listing and existence checks take their
//! filter explicitly.

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::state::{CloudKind, ClusterKey, ClusterType, StateDocument};

/// Selects the clusters returned by [`Storage::get_one_or_more_clusters`].
/// `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct ClusterFilter {
    pub cloud: Option<CloudKind>,
    pub cluster_type: Option<ClusterType>,
    pub region: Option<String>,
    pub name: Option<String>,
}

impl ClusterFilter {
    pub fn matches(&self, key: &ClusterKey) -> bool {
        self.cloud.map_or(true, |c| c == key.cloud)
            && self.cluster_type.map_or(true, |t| t == key.cluster_type)
            && self.region.as_deref().map_or(true, |r| r == key.region)
            && self.name.as_deref().map_or(true, |n| n == key.name)
    }
}

/// Persistence for state documents.
///
/// Implementations serialize concurrent writers internally; callers are
/// expected to run at most one operation per cluster identity at a time.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Binds this backend to one cluster identity.
    async fn setup(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()>;

    /// Reads the document of the bound identity, failing with `NotFound`.
    async fn read(&self) -> Result<StateDocument>;

    /// Writes the document of the bound identity.
    async fn write(&self, state: &StateDocument) -> Result<()>;

    /// Removes the document of the bound identity.
    async fn delete_cluster(&self) -> Result<()>;

    /// Lists stored documents grouped by cluster type.
    async fn get_one_or_more_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<HashMap<ClusterType, Vec<StateDocument>>>;

    /// Succeeds when a document exists for the identity, fails with `NotFound`
    /// otherwise.
    async fn already_created(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()>;
}

fn group_by_type(
    docs: impl IntoIterator<Item = StateDocument>,
) -> HashMap<ClusterType, Vec<StateDocument>> {
    let mut grouped: HashMap<ClusterType, Vec<StateDocument>> = HashMap::new();
    for doc in docs {
        grouped.entry(doc.cluster_type).or_default().push(doc);
    }
    for docs in grouped.values_mut() {
        docs.sort_by(|a, b| a.key().cmp(&b.key()));
    }
    grouped
}

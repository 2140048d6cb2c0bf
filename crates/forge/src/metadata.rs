//! The user's description of the cluster an operation targets.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::{CloudKind, ClusterKey, ClusterType, Role};

const MAX_NAME_LEN: usize = 50;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    static ref VERSION_RE: Regex = Regex::new(r"^v?\d+(\.\d+){0,2}$").unwrap();
    // etcd publishes its releases under `v`-prefixed tags only.
    static ref ETCD_VERSION_RE: Regex = Regex::new(r"^v\d+\.\d+\.\d+$").unwrap();
}

/// The container network plugin installed with k3s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cni {
    /// k3s' bundled flannel
    Flannel,
    /// No plugin; the user installs one after bootstrap
    None,
}

impl Default for Cni {
    fn default() -> Self {
        Cni::Flannel
    }
}

impl fmt::Display for Cni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cni::Flannel => f.write_str("flannel"),
            Cni::None => f.write_str("none"),
        }
    }
}

impl FromStr for Cni {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flannel" | "" => Ok(Cni::Flannel),
            "none" => Ok(Cni::None),
            other => Err(Error::invalid_input("cni", format!("unsupported plugin {:?}", other))),
        }
    }
}

/// Everything an entry point needs to know about the requested cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub name: String,
    pub region: String,
    pub provider: CloudKind,
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
    pub k8s_version: String,
    pub etcd_version: String,
    pub cni: Cni,
}

impl ClusterMetadata {
    /// A metadata record with the defaults used by the command line.
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        provider: CloudKind,
        cluster_type: ClusterType,
    ) -> Self {
        ClusterMetadata {
            name: name.into(),
            region: region.into(),
            provider,
            cluster_type,
            no_cp: 3,
            no_wp: 1,
            no_ds: 1,
            cp_size: String::new(),
            wp_size: String::new(),
            ds_size: String::new(),
            lb_size: String::new(),
            managed_node_size: String::new(),
            managed_node_count: 1,
            k8s_version: "1.30".to_string(),
            etcd_version: "v3.5.15".to_string(),
            cni: Cni::Flannel,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(
            self.provider,
            self.region.clone(),
            self.name.clone(),
            self.cluster_type,
        )
    }

    /// The VM size requested for `role`.
    pub fn size_for(&self, role: Role) -> &str {
        match role {
            Role::ControlPlane => &self.cp_size,
            Role::WorkerPlane => &self.wp_size,
            Role::LoadBalancer => &self.lb_size,
            Role::Datastore => &self.ds_size,
        }
    }

    /// Number of nodes requested for `role`.
    pub fn count_for(&self, role: Role) -> usize {
        match role {
            Role::ControlPlane => self.no_cp,
            Role::WorkerPlane => self.no_wp,
            Role::LoadBalancer => 1,
            Role::Datastore => self.no_ds,
        }
    }

    /// Checks the fields every backend relies on. Backends check their own
    /// regions and sizes on top of this.
    pub fn validate(&self) -> Result<()> {
        if self.name.len() > MAX_NAME_LEN || !NAME_RE.is_match(&self.name) {
            return Err(Error::invalid_input(
                "name",
                format!(
                    "{:?} must be lowercase alphanumerics or '-', start and end alphanumeric and be at most {} characters",
                    self.name, MAX_NAME_LEN
                ),
            ));
        }
        if self.region.trim().is_empty() {
            return Err(Error::invalid_input("region", "must not be empty"));
        }
        if !VERSION_RE.is_match(&self.k8s_version) {
            return Err(Error::invalid_input(
                "version",
                format!("{:?} is not a kubernetes version", self.k8s_version),
            ));
        }

        match self.cluster_type {
            ClusterType::SelfManaged => {
                if self.no_cp < 1 {
                    return Err(Error::invalid_input("controlplane count", "at least 1 required"));
                }
                if self.no_ds < 1 {
                    return Err(Error::invalid_input("datastore count", "at least 1 required"));
                }
                if !ETCD_VERSION_RE.is_match(&self.etcd_version) {
                    return Err(Error::invalid_input(
                        "etcd version",
                        format!(
                            "{:?} is not an etcd release tag such as v3.5.15",
                            self.etcd_version
                        ),
                    ));
                }
                for role in Role::ALL {
                    if self.size_for(role).trim().is_empty() {
                        return Err(Error::invalid_input(
                            format!("{} size", role),
                            "must not be empty",
                        ));
                    }
                }
            }
            ClusterType::Managed => {
                if self.managed_node_count < 1 {
                    return Err(Error::invalid_input("node count", "at least 1 required"));
                }
            }
        }
        Ok(())
    }

    /// Fails unless `self.region` is one of `regions`.
    pub fn require_region(&self, regions: &[&str]) -> Result<()> {
        if regions.contains(&self.region.as_str()) {
            Ok(())
        } else {
            Err(Error::invalid_input(
                "region",
                format!(
                    "{:?} is not available on {}; choose one of {}",
                    self.region,
                    self.provider,
                    regions.join(", ")
                ),
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn ha() -> ClusterMetadata {
        let mut meta = ClusterMetadata::new("demo", "lon1", CloudKind::Civo, ClusterType::SelfManaged);
        meta.cp_size = "g3.small".to_string();
        meta.wp_size = "g3.large".to_string();
        meta.ds_size = "g3.small".to_string();
        meta.lb_size = "g3.small".to_string();
        meta
    }

    #[test]
    fn accepts_well_formed_request() {
        ha().validate().expect("valid metadata");
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["Demo", "-demo", "demo-", "de_mo", "", &"a".repeat(51)] {
            let mut meta = ha();
            meta.name = name.to_string();
            assert_eq!(
                meta.validate().unwrap_err().kind(),
                ErrorKind::InvalidUserInput,
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn rejects_missing_sizes_and_counts_for_ha() {
        let mut meta = ha();
        meta.lb_size.clear();
        assert!(meta.validate().is_err());

        let mut meta = ha();
        meta.no_ds = 0;
        assert!(meta.validate().is_err());
    }

    #[test]
    fn managed_clusters_do_not_need_vm_sizes() {
        let meta = ClusterMetadata::new("demo", "lon1", CloudKind::Civo, ClusterType::Managed);
        meta.validate().expect("managed metadata");
    }

    #[test]
    fn rejects_bad_versions() {
        let mut meta = ha();
        meta.k8s_version = "latest".to_string();
        assert!(meta.validate().is_err());
    }

    #[test]
    fn etcd_versions_must_be_release_tags() {
        let mut meta = ha();
        meta.etcd_version = "3.5.15".to_string();
        let err = meta.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUserInput);
        assert!(err.to_string().contains("etcd version"));

        meta.etcd_version = "v3.5".to_string();
        assert!(meta.validate().is_err());

        meta.etcd_version = "v3.5.15".to_string();
        meta.validate().expect("release tag accepted");
    }

    #[test]
    fn region_must_be_offered() {
        let meta = ha();
        meta.require_region(&["lon1", "fra1"]).expect("lon1 offered");
        assert!(meta.require_region(&["nyc1"]).is_err());
    }
}

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{group_by_type, ClusterFilter, Storage};
use crate::error::{Error, Result};
use crate::state::{CloudKind, ClusterKey, ClusterType, StateDocument};

const STATE_FILE_NAME: &str = "state.json";

/// A store that keeps one JSON document per cluster on the local file system.
///
/// Documents live at `<root>/<cloud>/<type>/<name> <region>/state.json`.
pub struct LocalStore {
    root_dir: PathBuf,
    bound: Mutex<Option<ClusterKey>>,
    // Serializes every file system mutation made through this store.
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Create a new `LocalStore` rooted at `root_dir`
    pub fn new<T: AsRef<Path>>(root_dir: T) -> Self {
        Self {
            root_dir: root_dir.as_ref().into(),
            bound: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    fn cluster_dir(&self, key: &ClusterKey) -> PathBuf {
        self.root_dir
            .join(key.cloud.as_str())
            .join(key.cluster_type.as_str())
            .join(format!("{} {}", key.name, key.region))
    }

    fn state_path(&self, key: &ClusterKey) -> PathBuf {
        self.cluster_dir(key).join(STATE_FILE_NAME)
    }

    async fn bound_key(&self) -> Result<ClusterKey> {
        self.bound
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::storage("lookup", "store used before setup"))
    }

    async fn read_path(path: &Path) -> Result<StateDocument> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| Error::storage(format!("read {}", path.display()), e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::storage(format!("decode {}", path.display()), e))
    }

    async fn list_dirs(path: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(Error::storage(format!("list {}", path.display()), e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage(format!("list {}", path.display()), e))?
        {
            if entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Writes `contents` to a temporary file in `dir` and renames it over `path`,
/// so a crash never leaves a torn document behind.
fn replace_file(dir: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o640))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl Storage for LocalStore {
    async fn setup(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        let key = ClusterKey::new(cloud, region, name, cluster_type);
        debug!(cluster = %key, root = %self.root_dir.display(), "binding local store");
        *self.bound.lock().await = Some(key);
        Ok(())
    }

    async fn read(&self) -> Result<StateDocument> {
        let key = self.bound_key().await?;
        let path = self.state_path(&key);
        if !path.exists() {
            return Err(Error::NotFound {
                cluster: key.to_string(),
            });
        }
        Self::read_path(&path).await
    }

    async fn write(&self, state: &StateDocument) -> Result<()> {
        let key = self.bound_key().await?;
        if state.key() != key {
            return Err(Error::storage(
                "write",
                format!("document for {} written to store bound to {}", state.key(), key),
            ));
        }
        let _guard = self.write_lock.lock().await;

        let dir = self.cluster_dir(&key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("create {}", dir.display()), e))?;
        set_mode(&dir, 0o750)
            .await
            .map_err(|e| Error::storage(format!("chmod {}", dir.display()), e))?;

        let raw = serde_json::to_vec_pretty(state).map_err(|e| Error::storage("encode", e))?;
        let path = self.state_path(&key);
        let target = path.clone();
        tokio::task::spawn_blocking(move || replace_file(&dir, &target, &raw))
            .await
            .map_err(|e| Error::storage(format!("write {}", path.display()), e))?
            .map_err(|e| Error::storage(format!("write {}", path.display()), e))?;
        debug!(cluster = %key, "checkpointed state");
        Ok(())
    }

    async fn delete_cluster(&self) -> Result<()> {
        let key = self.bound_key().await?;
        let _guard = self.write_lock.lock().await;
        let dir = self.cluster_dir(&key);
        if !dir.exists() {
            return Err(Error::NotFound {
                cluster: key.to_string(),
            });
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| Error::storage(format!("remove {}", dir.display()), e))
    }

    async fn get_one_or_more_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<HashMap<ClusterType, Vec<StateDocument>>> {
        let mut docs = Vec::new();
        for cloud_dir in Self::list_dirs(&self.root_dir).await? {
            for type_dir in Self::list_dirs(&cloud_dir).await? {
                for cluster_dir in Self::list_dirs(&type_dir).await? {
                    let path = cluster_dir.join(STATE_FILE_NAME);
                    if !path.exists() {
                        continue;
                    }
                    let doc = Self::read_path(&path).await?;
                    if filter.matches(&doc.key()) {
                        docs.push(doc);
                    }
                }
            }
        }
        Ok(group_by_type(docs))
    }

    async fn already_created(
        &self,
        cloud: CloudKind,
        region: &str,
        name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        let key = ClusterKey::new(cloud, region, name, cluster_type);
        if self.state_path(&key).exists() {
            Ok(())
        } else {
            Err(Error::NotFound {
                cluster: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn doc(cloud: CloudKind, name: &str, cluster_type: ClusterType) -> StateDocument {
        StateDocument::new(&ClusterKey::new(cloud, "lon1", name, cluster_type))
    }

    #[tokio::test]
    async fn write_then_read_returns_same_document() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        store
            .setup(CloudKind::Civo, "lon1", "demo", ClusterType::SelfManaged)
            .await
            .expect("setup");

        let mut state = doc(CloudKind::Civo, "demo", ClusterType::SelfManaged);
        state.cloud_infra.network.network_id = "net-1".to_string();
        store.write(&state).await.expect("write");

        let read = store.read().await.expect("read");
        assert_eq!(read, state);
        assert!(dir
            .path()
            .join("civo/selfmanaged/demo lon1/state.json")
            .exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_files_are_not_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        store
            .setup(CloudKind::Aws, "lon1", "demo", ClusterType::Managed)
            .await
            .expect("setup");
        store
            .write(&doc(CloudKind::Aws, "demo", ClusterType::Managed))
            .await
            .expect("write");

        let cluster_dir = dir.path().join("aws/managed/demo lon1");
        let dir_mode = std::fs::metadata(&cluster_dir).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(cluster_dir.join("state.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o750);
        assert_eq!(file_mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn rewrites_leave_only_the_state_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        store
            .setup(CloudKind::Civo, "lon1", "demo", ClusterType::SelfManaged)
            .await
            .expect("setup");
        let mut state = doc(CloudKind::Civo, "demo", ClusterType::SelfManaged);
        store.write(&state).await.expect("first write");
        state.bootstrap.join_token = "K10secret".to_string();
        store.write(&state).await.expect("second write");

        let cluster_dir = dir.path().join("civo/selfmanaged/demo lon1");
        let entries: Vec<String> = std::fs::read_dir(&cluster_dir)
            .expect("cluster dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["state.json".to_string()]);
        assert_eq!(store.read().await.expect("read"), state);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        store
            .setup(CloudKind::Civo, "lon1", "ghost", ClusterType::Managed)
            .await
            .expect("setup");

        assert_eq!(store.read().await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            store
                .already_created(CloudKind::Civo, "lon1", "ghost", ClusterType::Managed)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            store.delete_cluster().await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn lists_clusters_grouped_by_type() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        for (cloud, name, cluster_type) in [
            (CloudKind::Civo, "a", ClusterType::Managed),
            (CloudKind::Civo, "b", ClusterType::SelfManaged),
            (CloudKind::Azure, "c", ClusterType::SelfManaged),
        ] {
            store
                .setup(cloud, "lon1", name, cluster_type)
                .await
                .expect("setup");
            store
                .write(&doc(cloud, name, cluster_type))
                .await
                .expect("write");
        }

        let all = store
            .get_one_or_more_clusters(&ClusterFilter::default())
            .await
            .expect("list");
        assert_eq!(all[&ClusterType::Managed].len(), 1);
        assert_eq!(all[&ClusterType::SelfManaged].len(), 2);

        let civo = store
            .get_one_or_more_clusters(&ClusterFilter {
                cloud: Some(CloudKind::Civo),
                ..Default::default()
            })
            .await
            .expect("list");
        assert_eq!(civo.values().map(Vec::len).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_cluster_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = LocalStore::new(dir.path());
        store
            .setup(CloudKind::Local, "local", "demo", ClusterType::Managed)
            .await
            .expect("setup");
        let mut state = doc(CloudKind::Local, "demo", ClusterType::Managed);
        state.region = "local".to_string();
        store.write(&state).await.expect("write");

        store.delete_cluster().await.expect("delete");
        assert!(!dir.path().join("local/managed/demo local").exists());
    }
}

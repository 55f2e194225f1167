//! Disk-based image and container store.
//!
//! Records live in an in-memory index backed by a persistent `index.json`
//! written atomically (tmp file, then rename). Image blobs are kept under
//! `images/<id>/` and container root directories under `containers/<id>/`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::labels::init_labels;
use super::{ContainerOptions, ContainerRecord, ImageRecord, NewImage, Store};

/// Shortest ID prefix accepted for image lookups.
const MIN_ID_PREFIX: usize = 3;

/// Reject IDs and data keys that would not name a single entry inside
/// the store directory.
fn check_path_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value.contains("..")
        || value.contains(['/', '\\', '\0'])
    {
        return Err(KilnError::Other(format!(
            "invalid image {} {:?}: not usable as a file name",
            kind, value
        )));
    }
    Ok(())
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreIndex {
    #[serde(default)]
    images: Vec<ImageRecord>,
    #[serde(default)]
    containers: Vec<ContainerRecord>,
}

impl StoreIndex {
    fn find_image(&self, name_or_id: &str) -> Option<&ImageRecord> {
        if let Some(img) = self
            .images
            .iter()
            .find(|img| img.id == name_or_id || img.names.iter().any(|n| n == name_or_id))
        {
            return Some(img);
        }
        if name_or_id.len() < MIN_ID_PREFIX || !name_or_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let mut matches = self.images.iter().filter(|img| img.id.starts_with(name_or_id));
        match (matches.next(), matches.next()) {
            (Some(img), None) => Some(img),
            _ => None,
        }
    }

    /// Add `image` or merge it into the record with the same ID. Names it
    /// carries are taken away from every other image.
    fn upsert_image(&mut self, image: &NewImage) -> ImageRecord {
        for other in self.images.iter_mut().filter(|img| img.id != image.id) {
            other.names.retain(|n| !image.names.contains(n));
        }

        let keys = image.big_data.iter().map(|(k, _)| k.clone());
        match self.images.iter_mut().find(|img| img.id == image.id) {
            Some(existing) => {
                for name in &image.names {
                    if !existing.names.contains(name) {
                        existing.names.push(name.clone());
                    }
                }
                for key in keys {
                    if !existing.big_data_keys.contains(&key) {
                        existing.big_data_keys.push(key);
                    }
                }
                existing.digest = image.digest.clone();
                existing.created = image.created;
                existing.top_layer = image.top_layer.clone();
                existing.clone()
            }
            None => {
                let record = ImageRecord {
                    id: image.id.clone(),
                    names: image.names.clone(),
                    digest: image.digest.clone(),
                    created: image.created,
                    top_layer: image.top_layer.clone(),
                    big_data_keys: keys.collect(),
                };
                self.images.push(record.clone());
                record
            }
        }
    }

    fn find_container(&self, name_or_id: &str) -> Option<&ContainerRecord> {
        self.containers
            .iter()
            .find(|c| c.id == name_or_id || c.has_name(name_or_id))
    }
}

/// Disk-based store with an in-memory index.
pub struct LocalStore {
    /// Root directory for all store data
    root: PathBuf,
    index: RwLock<StoreIndex>,
}

impl LocalStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Creates the directory if it doesn't exist and loads any existing
    /// index from disk.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            KilnError::Other(format!(
                "failed to create store directory {}: {}",
                root.display(),
                e
            ))
        })?;

        let index = Self::load_index(root)?;
        tracing::debug!(
            root = %root.display(),
            images = index.images.len(),
            containers = index.containers.len(),
            "Opened local store"
        );

        Ok(Self {
            root: root.to_path_buf(),
            index: RwLock::new(index),
        })
    }

    /// Get the store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join("images").join(id)
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join("containers").join(id)
    }

    fn load_index(root: &Path) -> Result<StoreIndex> {
        let index_path = root.join("index.json");
        if !index_path.exists() {
            return Ok(StoreIndex::default());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            KilnError::Other(format!(
                "failed to read store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&data)
            .map_err(|e| KilnError::SerializationError(format!("failed to parse store index: {}", e)))
    }

    /// Save index to disk (atomic write). Callers hold the write lock.
    async fn save_index(&self, index: &StoreIndex) -> Result<()> {
        let data = serde_json::to_string_pretty(index)?;
        let index_path = self.root.join("index.json");
        let tmp_path = index_path.with_extension("json.tmp");

        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            KilnError::Other(format!(
                "failed to write store index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            KilnError::Other(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Persist `updated` and only then make it the live index, so a failed
    /// write leaves the in-memory state matching what is on disk.
    async fn commit(&self, index: &mut StoreIndex, updated: StoreIndex) -> Result<()> {
        self.save_index(&updated).await?;
        *index = updated;
        Ok(())
    }

    async fn discard_dir(&self, dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to clean up directory");
        }
    }

    async fn write_image_data(&self, dir: &Path, big_data: &[(String, Vec<u8>)]) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (key, data) in big_data {
            tokio::fs::write(dir.join(key), data).await.map_err(|e| {
                KilnError::Other(format!("failed to write image data {:?}: {}", key, e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn image(&self, name_or_id: &str) -> Result<ImageRecord> {
        let index = self.index.read().await;
        index
            .find_image(name_or_id)
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound(name_or_id.to_string()))
    }

    async fn images(&self) -> Result<Vec<ImageRecord>> {
        Ok(self.index.read().await.images.clone())
    }

    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        check_path_component("data key", key)?;
        let image = self.image(id).await?;
        if !image.big_data_keys.iter().any(|k| k == key) {
            return Err(KilnError::Other(format!(
                "image {} has no data stored under key {:?}",
                image.id, key
            )));
        }
        let path = self.image_dir(&image.id).join(key);
        tokio::fs::read(&path).await.map_err(|e| {
            KilnError::Other(format!(
                "failed to read image data {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn put_image(&self, image: NewImage) -> Result<ImageRecord> {
        check_path_component("ID", &image.id)?;
        for (key, _) in &image.big_data {
            check_path_component("data key", key)?;
        }

        let mut index = self.index.write().await;
        let dir = self.image_dir(&image.id);
        let fresh = !dir.exists();

        let mut updated = index.clone();
        let record = updated.upsert_image(&image);
        let stored = match self.write_image_data(&dir, &image.big_data).await {
            Ok(()) => self.commit(&mut index, updated).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            if fresh {
                self.discard_dir(&dir).await;
            }
            return Err(e);
        }

        tracing::debug!(id = %record.id, names = ?record.names, "Stored image");
        Ok(record)
    }

    async fn container(&self, name_or_id: &str) -> Result<ContainerRecord> {
        let index = self.index.read().await;
        index
            .find_container(name_or_id)
            .cloned()
            .ok_or_else(|| KilnError::ContainerNotFound(name_or_id.to_string()))
    }

    async fn containers(&self) -> Result<Vec<ContainerRecord>> {
        Ok(self.index.read().await.containers.clone())
    }

    async fn create_container(
        &self,
        names: &[String],
        image_id: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord> {
        let labels = init_labels(&options.label_opts)?;

        let mut index = self.index.write().await;
        if let Some(taken) = names
            .iter()
            .find(|name| index.containers.iter().any(|c| c.has_name(name)))
        {
            return Err(KilnError::DuplicateName(taken.clone()));
        }

        let image_id = if image_id.is_empty() {
            String::new()
        } else {
            index
                .find_image(image_id)
                .map(|img| img.id.clone())
                .ok_or_else(|| KilnError::ImageNotFound(image_id.to_string()))?
        };

        let mapping = &options.id_mapping;
        let record = ContainerRecord {
            id: format!(
                "{}{}",
                uuid::Uuid::new_v4().simple(),
                uuid::Uuid::new_v4().simple()
            ),
            names: names.to_vec(),
            image_id,
            process_label: labels.process_label,
            mount_label: labels.mount_label,
            uid_map: if mapping.host_uid_mapping {
                Vec::new()
            } else {
                mapping.uid_map.clone()
            },
            gid_map: if mapping.host_gid_mapping {
                Vec::new()
            } else {
                mapping.gid_map.clone()
            },
            created: Utc::now(),
            metadata: String::new(),
        };

        let dir = self.container_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;
        let mut updated = index.clone();
        updated.containers.push(record.clone());
        if let Err(e) = self.commit(&mut index, updated).await {
            self.discard_dir(&dir).await;
            return Err(e);
        }

        tracing::debug!(id = %record.id, names = ?record.names, "Created container");
        Ok(record)
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let pos = index
            .containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| KilnError::ContainerNotFound(id.to_string()))?;
        let mut updated = index.clone();
        let record = updated.containers.remove(pos);
        self.commit(&mut index, updated).await?;
        drop(index);

        let dir = self.container_dir(&record.id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                KilnError::Other(format!(
                    "failed to remove container directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        tracing::debug!(id = %record.id, "Deleted container");
        Ok(())
    }

    async fn mount(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
        let record = self.container(id).await?;
        let mount_point = self.container_dir(&record.id).join("rootfs");
        tokio::fs::create_dir_all(&mount_point).await.map_err(|e| {
            KilnError::MountError(format!(
                "failed to prepare {}: {}",
                mount_point.display(),
                e
            ))
        })?;
        tracing::debug!(
            id = %record.id,
            mount_point = %mount_point.display(),
            mount_label,
            "Mounted container"
        );
        Ok(mount_point)
    }

    async fn unmount(&self, id: &str) -> Result<()> {
        let record = self.container(id).await?;
        tracing::debug!(id = %record.id, "Unmounted container");
        Ok(())
    }

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let mut updated = index.clone();
        let record = updated
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| KilnError::ContainerNotFound(id.to_string()))?;
        record.metadata = metadata.to_string();
        self.commit(&mut index, updated).await
    }

    async fn metadata(&self, id: &str) -> Result<String> {
        Ok(self.container(id).await?.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IdMap, IdMappingOptions, MANIFEST_KEY};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn new_image(id: &str, name: &str) -> NewImage {
        NewImage {
            id: id.to_string(),
            names: vec![name.to_string()],
            digest: format!("sha256:{}", id),
            created: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            top_layer: Some("sha256:layer".to_string()),
            big_data: vec![
                (MANIFEST_KEY.to_string(), b"{}".to_vec()),
                ("sha256:cfg".to_string(), b"{\"os\":\"linux\"}".to_vec()),
            ],
        }
    }

    #[tokio::test]
    async fn test_put_and_lookup_image() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store
            .put_image(new_image("abcdef01", "docker.io/library/busybox:latest"))
            .await
            .unwrap();

        let by_name = store.image("docker.io/library/busybox:latest").await.unwrap();
        assert_eq!(by_name.id, "abcdef01");
        let by_prefix = store.image("abcd").await.unwrap();
        assert_eq!(by_prefix.id, "abcdef01");
        let config = store.image_big_data("abcdef01", "sha256:cfg").await.unwrap();
        assert_eq!(config, b"{\"os\":\"linux\"}");
    }

    #[tokio::test]
    async fn test_image_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let err = store.image("busybox").await.unwrap_err();
        assert!(err.is_image_not_found());
    }

    #[tokio::test]
    async fn test_ambiguous_prefix_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.put_image(new_image("abc111", "a:1")).await.unwrap();
        store.put_image(new_image("abc222", "b:1")).await.unwrap();
        assert!(store.image("abc").await.is_err());
        assert!(store.image("abc1").await.is_ok());
    }

    #[tokio::test]
    async fn test_put_image_moves_names() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.put_image(new_image("aaa111", "busybox:latest")).await.unwrap();
        store.put_image(new_image("bbb222", "busybox:latest")).await.unwrap();

        assert_eq!(store.image("busybox:latest").await.unwrap().id, "bbb222");
        assert!(store.image("aaa111").await.unwrap().names.is_empty());
    }

    #[tokio::test]
    async fn test_create_container_duplicate_name() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let names = vec!["working-container".to_string()];
        store
            .create_container(&names, "", &ContainerOptions::default())
            .await
            .unwrap();
        let err = store
            .create_container(&names, "", &ContainerOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_duplicate_name());
        assert_eq!(store.containers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_container_unknown_image() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let err = store
            .create_container(&["c".to_string()], "feedface", &ContainerOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_image_not_found());
    }

    #[tokio::test]
    async fn test_create_container_records_mappings() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let range = IdMap {
            container_id: 0,
            host_id: 100000,
            size: 65536,
        };
        let options = ContainerOptions {
            label_opts: vec!["level:s0:c1,c2".to_string()],
            id_mapping: IdMappingOptions {
                host_uid_mapping: false,
                host_gid_mapping: false,
                uid_map: vec![range],
                gid_map: vec![range],
            },
        };
        let record = store
            .create_container(&["c".to_string()], "", &options)
            .await
            .unwrap();
        assert_eq!(record.uid_map, vec![range]);
        assert_eq!(record.gid_map, vec![range]);
        assert_eq!(record.mount_label, "system_u:object_r:container_file_t:s0:c1,c2");
    }

    #[tokio::test]
    async fn test_delete_container() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let record = store
            .create_container(&["c".to_string()], "", &ContainerOptions::default())
            .await
            .unwrap();
        store.delete_container(&record.id).await.unwrap();
        assert!(store.containers().await.unwrap().is_empty());
        assert!(store.delete_container(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_mount_and_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let record = store
            .create_container(&["c".to_string()], "", &ContainerOptions::default())
            .await
            .unwrap();
        let mount_point = store.mount(&record.id, &record.mount_label).await.unwrap();
        assert!(mount_point.is_dir());
        store.set_metadata(&record.id, "{\"k\":1}").await.unwrap();
        assert_eq!(store.metadata("c").await.unwrap(), "{\"k\":1}");
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let tmp = TempDir::new().unwrap();
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            store.put_image(new_image("abcdef", "busybox:latest")).await.unwrap();
            store
                .create_container(&["c".to_string()], "abcdef", &ContainerOptions::default())
                .await
                .unwrap();
        }
        {
            let store = LocalStore::open(tmp.path()).unwrap();
            assert_eq!(store.image("busybox:latest").await.unwrap().id, "abcdef");
            assert_eq!(store.container("c").await.unwrap().image_id, "abcdef");
        }
    }

    #[tokio::test]
    async fn test_put_image_rejects_unsafe_paths() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("store");
        let store = LocalStore::open(&root).unwrap();

        let err = store.put_image(new_image("../x", "a:1")).await.unwrap_err();
        assert!(err.to_string().contains("not usable as a file name"), "{}", err);

        let mut nested = new_image("abc123", "b:1");
        nested.big_data.push(("a/b".to_string(), b"x".to_vec()));
        assert!(store.put_image(nested).await.is_err());

        let mut escaping = new_image("abc456", "c:1");
        escaping.big_data = vec![("../../escaped".to_string(), b"x".to_vec())];
        assert!(store.put_image(escaping).await.is_err());

        assert!(store.images().await.unwrap().is_empty());
        assert!(!tmp.path().join("x").exists());
        assert!(!tmp.path().join("escaped").exists());
        assert!(!root.join("images").exists());
    }

    #[tokio::test]
    async fn test_image_big_data_rejects_unsafe_key() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.put_image(new_image("abcdef01", "busybox:latest")).await.unwrap();
        assert!(store.image_big_data("abcdef01", "../../index.json").await.is_err());
    }

    /// Make the next index write fail: the tmp file path is taken by a directory.
    fn block_index_writes(root: &Path) -> PathBuf {
        let blocker = root.join("index.json.tmp");
        std::fs::create_dir(&blocker).unwrap();
        blocker
    }

    #[tokio::test]
    async fn test_failed_index_write_leaves_no_container() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        let names = vec!["c".to_string()];
        let blocker = block_index_writes(tmp.path());

        assert!(store
            .create_container(&names, "", &ContainerOptions::default())
            .await
            .is_err());
        assert!(store.containers().await.unwrap().is_empty());
        assert!(store.container("c").await.is_err());
        let leftover = std::fs::read_dir(tmp.path().join("containers"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);

        // the name was never taken
        std::fs::remove_dir(&blocker).unwrap();
        let record = store
            .create_container(&names, "", &ContainerOptions::default())
            .await
            .unwrap();
        assert_eq!(store.container("c").await.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn test_failed_index_write_keeps_previous_state() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).unwrap();
        store.put_image(new_image("abcdef01", "busybox:latest")).await.unwrap();
        let record = store
            .create_container(&["c".to_string()], "abcdef01", &ContainerOptions::default())
            .await
            .unwrap();
        let blocker = block_index_writes(tmp.path());

        assert!(store.delete_container(&record.id).await.is_err());
        assert_eq!(store.container("c").await.unwrap().id, record.id);
        assert!(tmp.path().join("containers").join(&record.id).is_dir());

        assert!(store.set_metadata(&record.id, "{\"k\":1}").await.is_err());
        assert_eq!(store.metadata("c").await.unwrap(), "");

        assert!(store.put_image(new_image("fedcba02", "busybox:latest")).await.is_err());
        assert!(store.image("fedcba02").await.is_err());
        assert_eq!(store.image("busybox:latest").await.unwrap().id, "abcdef01");
        assert!(!tmp.path().join("images").join("fedcba02").exists());

        // memory and disk agree once writes work again
        std::fs::remove_dir(&blocker).unwrap();
        let reopened = LocalStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.containers().await.unwrap(), store.containers().await.unwrap());
        assert_eq!(reopened.images().await.unwrap(), store.images().await.unwrap());
    }
}

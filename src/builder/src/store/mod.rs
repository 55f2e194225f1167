//! Persistent image and container store.
//!
//! The [`Store`] trait is the seam between the builder and whatever keeps
//! image and container records. [`LocalStore`] is the on-disk implementation.

mod labels;
mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::error::Result;
use serde::{Deserialize, Serialize};

pub use labels::{init_labels, SecurityLabels};
pub use local::LocalStore;

/// Big data key holding an image's top-level manifest.
pub const MANIFEST_KEY: &str = "manifest";

/// Big data key for the manifest of one instance in a manifest list.
pub fn instance_manifest_key(digest: &str) -> String {
    format!("{}-{}", MANIFEST_KEY, digest)
}

/// ID range in the store's own representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// ID mapping settings applied when the store creates a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingOptions {
    pub host_uid_mapping: bool,
    pub host_gid_mapping: bool,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

/// An image known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Store-assigned ID (hex digest of the image configuration)
    pub id: String,
    /// Human-readable names, e.g. "docker.io/library/busybox:latest"
    pub names: Vec<String>,
    /// Digest of the top-level manifest
    pub digest: String,
    /// Creation time recorded in the image configuration
    pub created: DateTime<Utc>,
    /// Topmost filesystem layer
    pub top_layer: Option<String>,
    /// Keys of the blobs stored alongside the record
    pub big_data_keys: Vec<String>,
}

/// A new image to record in the store.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub id: String,
    pub names: Vec<String>,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub top_layer: Option<String>,
    /// (key, bytes) pairs: [`MANIFEST_KEY`], [`instance_manifest_key`] entries,
    /// and the configuration blob keyed by its digest
    pub big_data: Vec<(String, Vec<u8>)>,
}

/// A container known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub names: Vec<String>,
    /// Image the container was created from; empty for scratch containers
    pub image_id: String,
    pub process_label: String,
    pub mount_label: String,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
    pub created: DateTime<Utc>,
    /// Opaque metadata owned by the builder
    #[serde(default)]
    pub metadata: String,
}

impl ContainerRecord {
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Options for [`Store::create_container`].
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// SELinux label options (e.g., "type:spc_t", "disable")
    pub label_opts: Vec<String>,
    pub id_mapping: IdMappingOptions,
}

/// Image and container records shared by every build on the host.
///
/// Implementations must register container names atomically: creating a
/// container whose name is already taken fails with
/// [`KilnError::DuplicateName`](kiln_core::KilnError::DuplicateName).
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up an image by ID, unique ID prefix, or name.
    async fn image(&self, name_or_id: &str) -> Result<ImageRecord>;

    async fn images(&self) -> Result<Vec<ImageRecord>>;

    /// Read one blob stored with an image.
    async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>>;

    /// Record an image. Names already held by other images move to this one.
    async fn put_image(&self, image: NewImage) -> Result<ImageRecord>;

    /// Look up a container by ID or name.
    async fn container(&self, name_or_id: &str) -> Result<ContainerRecord>;

    async fn containers(&self) -> Result<Vec<ContainerRecord>>;

    async fn create_container(
        &self,
        names: &[String],
        image_id: &str,
        options: &ContainerOptions,
    ) -> Result<ContainerRecord>;

    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Mount a container's root filesystem, returning the mount point.
    async fn mount(&self, id: &str, mount_label: &str) -> Result<PathBuf>;

    async fn unmount(&self, id: &str) -> Result<()>;

    async fn set_metadata(&self, id: &str, metadata: &str) -> Result<()>;

    async fn metadata(&self, id: &str) -> Result<String>;
}

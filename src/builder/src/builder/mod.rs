//! Working containers.
//!
//! A [`Builder`] is the persistent state of one build: the container it works
//! in, the image it started from, and the configuration the result will
//! carry. It is stored as JSON in the container's metadata slot.

mod new;
mod options;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use kiln_core::config::Platform;
use kiln_core::error::{KilnError, Result, ResultExt};
use kiln_core::idmap::IdMappingOptions;
use kiln_core::namespace::NamespaceOptions;
use serde::{Deserialize, Serialize};

use crate::manifest::{ImageConfigBlob, ImageManifest, OCI_MANIFEST};
use crate::pull::SourcedImage;
use crate::store::Store;

pub use new::{new_builder, BASE_IMAGE_FAKE_NAME};
pub use options::{
    BuilderOptions, CommonBuildOptions, DeviceMapping, Isolation, NetworkConfigurationPolicy,
    OutputFormat,
};

/// Tag identifying metadata written by this crate.
pub const BUILDER_TYPE: &str = "kiln 0.0.1";

/// State of one working container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    #[serde(rename = "type")]
    pub kind: String,
    /// Image name recorded as the build's base; empty for scratch
    pub from_image: String,
    pub from_image_id: String,
    /// Digest of the base image's top-level manifest
    pub from_image_digest: String,
    /// Container name
    pub container: String,
    pub container_id: String,
    pub process_label: String,
    pub mount_label: String,
    /// Root filesystem location while mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
    pub namespace_options: NamespaceOptions,
    pub id_mapping_options: IdMappingOptions,
    pub capabilities: Vec<String>,
    pub common_build_opts: CommonBuildOptions,
    /// Topmost layer of the base image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_layer: Option<String>,
    pub args: BTreeMap<String, String>,
    pub format: OutputFormat,
    pub temp_volumes: BTreeMap<String, bool>,
    pub devices: Vec<DeviceMapping>,
    pub configure_network: NetworkConfigurationPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_plugin_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_config_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mounts_file_path: Option<PathBuf>,
    pub isolation: Isolation,
    pub image_annotations: BTreeMap<String, String>,
    pub image_created_by: String,
    /// Configuration the committed image will carry
    pub config: ImageConfigBlob,
}

impl Builder {
    /// Load the builder saved for a container, by container name or ID.
    pub async fn open(store: &dyn Store, container: &str) -> Result<Self> {
        let record = store.container(container).await?;
        let metadata = store.metadata(&record.id).await?;
        if metadata.is_empty() {
            return Err(KilnError::ContainerNotFound(format!(
                "{} is not a working container",
                container
            )));
        }
        let builder: Builder = serde_json::from_str(&metadata)
            .map_err(KilnError::from)
            .with_context(|| format!("error parsing builder state for container {:?}", record.id))?;
        if builder.kind != BUILDER_TYPE {
            return Err(KilnError::ContainerNotFound(format!(
                "container {:?} was not created by kiln ({:?})",
                container, builder.kind
            )));
        }
        Ok(builder)
    }

    /// Mount the container's root filesystem and record where it is.
    pub async fn mount(&mut self, store: &dyn Store, mount_label: &str) -> Result<PathBuf> {
        let mount_point = store.mount(&self.container_id, mount_label).await?;
        self.mount_point = Some(mount_point.clone());
        self.save(store).await?;
        tracing::debug!(
            container = %self.container,
            mount_point = %mount_point.display(),
            "Mounted build container"
        );
        Ok(mount_point)
    }

    pub async fn unmount(&mut self, store: &dyn Store) -> Result<()> {
        store.unmount(&self.container_id).await?;
        self.mount_point = None;
        self.save(store).await
    }

    /// Seed the image configuration from the base image, or from the target
    /// platform for scratch builds.
    pub fn init_config(&mut self, image: Option<&SourcedImage>, platform: &Platform) -> Result<()> {
        match image {
            Some(image) => {
                self.config = image.config()?;
                if image.manifest_type == OCI_MANIFEST {
                    let manifest = ImageManifest::from_blob(&image.manifest)?;
                    self.image_annotations.extend(manifest.annotations);
                }
                if self.config.os.is_empty() {
                    self.config.os = platform.os.clone();
                }
                if self.config.architecture.is_empty() {
                    self.config.architecture = platform.architecture.clone();
                    self.config.variant = platform.variant.clone();
                }
            }
            None => {
                self.config = ImageConfigBlob {
                    created: Some(Utc::now()),
                    architecture: platform.architecture.clone(),
                    os: platform.os.clone(),
                    variant: platform.variant.clone(),
                    ..Default::default()
                };
            }
        }
        Ok(())
    }

    /// Persist this builder in the container's metadata.
    pub async fn save(&self, store: &dyn Store) -> Result<()> {
        let data = serde_json::to_string(self)?;
        store.set_metadata(&self.container_id, &data).await
    }

    /// Remove the working container, unmounting it first if needed.
    pub async fn delete(self, store: &dyn Store) -> Result<()> {
        if self.mount_point.is_some() {
            store.unmount(&self.container_id).await?;
        }
        store.delete_container(&self.container_id).await?;
        tracing::info!(container = %self.container, id = %self.container_id, "Deleted build container");
        Ok(())
    }
}

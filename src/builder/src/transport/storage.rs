//! Transport for images already recorded in the local store.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::config::SystemContext;
use kiln_core::error::{KilnError, Result};
use tokio_util::sync::CancellationToken;

use super::{ImageReference, ImageSource, Transport};
use crate::manifest::guess_mime_type;
use crate::store::{instance_manifest_key, ImageRecord, Store, MANIFEST_KEY};

/// Name of the local store transport.
pub const STORAGE_TRANSPORT: &str = "containers-storage";

/// Transport resolving names and IDs against a [`Store`].
pub struct StorageTransport {
    store: Arc<dyn Store>,
}

impl StorageTransport {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

impl Transport for StorageTransport {
    fn name(&self) -> &str {
        STORAGE_TRANSPORT
    }

    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageReference>> {
        if reference.is_empty() {
            return Err(KilnError::InvalidReference {
                reference: reference.to_string(),
                message: "empty storage reference".to_string(),
            });
        }
        Ok(Box::new(StorageReference::new(
            Arc::clone(&self.store),
            reference,
        )))
    }
}

/// Reference to an image in the local store, by name or ID.
#[derive(Clone)]
pub struct StorageReference {
    store: Arc<dyn Store>,
    reference: String,
}

impl StorageReference {
    pub fn new(store: Arc<dyn Store>, reference: impl Into<String>) -> Self {
        Self {
            store,
            reference: reference.into(),
        }
    }

    /// Reference an image record by its ID.
    pub fn for_image(store: Arc<dyn Store>, image: &ImageRecord) -> Self {
        Self::new(store, image.id.clone())
    }

    /// Look up the referenced image.
    pub async fn image(&self) -> Result<ImageRecord> {
        self.store.image(&self.reference).await
    }
}

impl std::fmt::Debug for StorageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReference")
            .field("reference", &self.reference)
            .finish()
    }
}

#[async_trait]
impl ImageReference for StorageReference {
    fn transport_name(&self) -> &str {
        STORAGE_TRANSPORT
    }

    fn string_within_transport(&self) -> String {
        self.reference.clone()
    }

    fn docker_reference(&self) -> Option<String> {
        // Bare IDs carry no registry name.
        if self.reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        crate::reference::NamedReference::parse(&self.reference)
            .ok()
            .map(|r| r.full_reference())
    }

    async fn new_image_source(
        &self,
        _sys: &SystemContext,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn ImageSource>> {
        let image = self.image().await?;
        tracing::trace!(id = %image.id, "Opened storage image source");
        Ok(Box::new(StorageImageSource {
            store: Arc::clone(&self.store),
            image,
        }))
    }
}

/// Serves manifests and blobs out of an image's stored big data.
struct StorageImageSource {
    store: Arc<dyn Store>,
    image: ImageRecord,
}

#[async_trait]
impl ImageSource for StorageImageSource {
    async fn manifest(
        &mut self,
        instance: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, String)> {
        let key = match instance {
            Some(digest) => {
                let key = instance_manifest_key(digest);
                if self.image.big_data_keys.contains(&key) {
                    key
                } else if digest == self.image.digest {
                    MANIFEST_KEY.to_string()
                } else {
                    return Err(KilnError::ManifestError(format!(
                        "image {} has no manifest for instance {}",
                        self.image.id, digest
                    )));
                }
            }
            None => MANIFEST_KEY.to_string(),
        };
        let data = self.store.image_big_data(&self.image.id, &key).await?;
        let mime_type = guess_mime_type(&data);
        Ok((data, mime_type))
    }

    async fn blob(&mut self, digest: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.store.image_big_data(&self.image.id, digest).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

//! Shared fixtures: an in-memory registry transport and store wrappers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_builder::manifest::{digest, OCI_INDEX, OCI_MANIFEST};
use kiln_builder::store::{ContainerOptions, NewImage};
use kiln_builder::{
    ContainerRecord, ImageRecord, ImageReference, ImageSource, LocalStore, NamedReference,
    StorageTransport, Store, Transport, Transports,
};
use kiln_core::config::{Platform, SystemContext};
use kiln_core::error::{KilnError, Result};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// One image as served by [`FakeRegistry`].
#[derive(Debug, Clone)]
pub struct FakeImage {
    /// Top-level manifest and its MIME type
    pub manifest: (Vec<u8>, String),
    /// Instance manifests of a manifest list, by digest
    pub instances: HashMap<String, (Vec<u8>, String)>,
    pub blobs: HashMap<String, Vec<u8>>,
}

fn config_blob(created: &str, architecture: &str) -> Vec<u8> {
    format!(
        r#"{{"created": "{}", "architecture": "{}", "os": "linux", "config": {{"Env": ["PATH=/usr/bin"]}}}}"#,
        created, architecture
    )
    .into_bytes()
}

fn image_manifest(config: &[u8], layer: &str) -> Vec<u8> {
    format!(
        r#"{{
            "schemaVersion": 2,
            "mediaType": "{}",
            "config": {{"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "{}", "size": {}}},
            "layers": [{{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "{}", "size": 1}}],
            "annotations": {{"org.opencontainers.image.title": "fake"}}
        }}"#,
        OCI_MANIFEST,
        digest(config),
        config.len(),
        layer
    )
    .into_bytes()
}

impl FakeImage {
    /// Single-platform image created at `created` (RFC 3339).
    pub fn new(created: &str) -> Self {
        let config = config_blob(created, "amd64");
        let manifest = image_manifest(&config, "sha256:1a7e4");
        Self {
            manifest: (manifest, OCI_MANIFEST.to_string()),
            instances: HashMap::new(),
            blobs: HashMap::from([(digest(&config), config)]),
        }
    }

    /// Manifest list with linux/amd64 and linux/arm64 instances.
    pub fn multi_arch(created: &str) -> Self {
        let mut instances = HashMap::new();
        let mut blobs = HashMap::new();
        let mut entries = Vec::new();
        for (arch, layer) in [("amd64", "sha256:aaaa"), ("arm64", "sha256:bbbb")] {
            let config = config_blob(created, arch);
            let manifest = image_manifest(&config, layer);
            let manifest_digest = digest(&manifest);
            entries.push(format!(
                r#"{{"mediaType": "{}", "digest": "{}", "size": {}, "platform": {{"architecture": "{}", "os": "linux"}}}}"#,
                OCI_MANIFEST,
                manifest_digest,
                manifest.len(),
                arch
            ));
            blobs.insert(digest(&config), config);
            instances.insert(manifest_digest, (manifest, OCI_MANIFEST.to_string()));
        }
        let index = format!(
            r#"{{"schemaVersion": 2, "mediaType": "{}", "manifests": [{}]}}"#,
            OCI_INDEX,
            entries.join(",")
        );
        Self {
            manifest: (index.into_bytes(), OCI_INDEX.to_string()),
            instances,
            blobs,
        }
    }

    /// Same image with an undecodable configuration blob.
    pub fn with_corrupt_config(mut self) -> Self {
        for blob in self.blobs.values_mut() {
            *blob = b"{\"created\": ".to_vec();
        }
        self
    }

    /// Store ID a pulled single-platform image gets.
    pub fn image_id(&self) -> String {
        let config = self
            .blobs
            .keys()
            .next()
            .expect("fake image has a config blob");
        config.trim_start_matches("sha256:").to_string()
    }
}

#[derive(Default)]
struct RegistryState {
    images: Mutex<HashMap<String, FakeImage>>,
    sources_opened: AtomicUsize,
    blocked: AtomicBool,
}

/// In-memory `docker` transport counting every source it opens.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    state: Arc<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `image` under `reference` (normalized like a pull destination).
    pub fn push(&self, reference: &str, image: FakeImage) {
        let key = NamedReference::parse(reference)
            .expect("valid reference")
            .full_reference();
        self.state.images.lock().insert(key, image);
    }

    /// Number of image sources opened so far (one per network access).
    pub fn sources_opened(&self) -> usize {
        self.state.sources_opened.load(Ordering::SeqCst)
    }

    /// Make every source open hang until cancelled.
    pub fn block(&self) {
        self.state.blocked.store(true, Ordering::SeqCst);
    }
}

impl Transport for FakeRegistry {
    fn name(&self) -> &str {
        "docker"
    }

    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageReference>> {
        Ok(Box::new(FakeReference {
            named: NamedReference::parse(reference)?,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeReference {
    named: NamedReference,
    state: Arc<RegistryState>,
}

impl std::fmt::Debug for FakeReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FakeReference({})", self.named)
    }
}

#[async_trait]
impl ImageReference for FakeReference {
    fn transport_name(&self) -> &str {
        "docker"
    }

    fn string_within_transport(&self) -> String {
        self.named.full_reference()
    }

    fn docker_reference(&self) -> Option<String> {
        Some(self.named.full_reference())
    }

    async fn new_image_source(
        &self,
        _sys: &SystemContext,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn ImageSource>> {
        self.state.sources_opened.fetch_add(1, Ordering::SeqCst);
        if self.state.blocked.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let image = self
            .state
            .images
            .lock()
            .get(&self.named.full_reference())
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound(format!("{}: manifest unknown", self.named)))?;
        Ok(Box::new(FakeSource { image }))
    }
}

struct FakeSource {
    image: FakeImage,
}

#[async_trait]
impl ImageSource for FakeSource {
    async fn manifest(
        &mut self,
        instance: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, String)> {
        match instance {
            None => Ok(self.image.manifest.clone()),
            Some(digest) => self
                .image
                .instances
                .get(digest)
                .cloned()
                .ok_or_else(|| KilnError::ManifestError(format!("unknown instance {}", digest))),
        }
    }

    async fn blob(&mut self, digest: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.image
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| KilnError::ManifestError(format!("unknown blob {}", digest)))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Store wrapper that loses the first `collisions` name races: just before
/// each of those creations another container grabs the requested name.
pub struct RacingStore {
    inner: Arc<dyn Store>,
    collisions: AtomicUsize,
    pub attempted_names: Mutex<Vec<String>>,
}

impl RacingStore {
    pub fn new(inner: Arc<dyn Store>, collisions: usize) -> Self {
        Self {
            inner,
            collisions: AtomicUsize::new(collisions),
            attempted_names: Mutex::new(Vec::new()),
        }
    }
}

/// Store wrapper whose metadata writes fail.
pub struct FailingSaveStore {
    pub inner: Arc<dyn Store>,
}

macro_rules! delegate_store {
    ($ty:ty, { $($create:tt)* }, { $($set_metadata:tt)* }) => {
        #[async_trait]
        impl Store for $ty {
            async fn image(&self, name_or_id: &str) -> Result<ImageRecord> {
                self.inner.image(name_or_id).await
            }
            async fn images(&self) -> Result<Vec<ImageRecord>> {
                self.inner.images().await
            }
            async fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
                self.inner.image_big_data(id, key).await
            }
            async fn put_image(&self, image: NewImage) -> Result<ImageRecord> {
                self.inner.put_image(image).await
            }
            async fn container(&self, name_or_id: &str) -> Result<ContainerRecord> {
                self.inner.container(name_or_id).await
            }
            async fn containers(&self) -> Result<Vec<ContainerRecord>> {
                self.inner.containers().await
            }
            $($create)*
            async fn delete_container(&self, id: &str) -> Result<()> {
                self.inner.delete_container(id).await
            }
            async fn mount(&self, id: &str, mount_label: &str) -> Result<PathBuf> {
                self.inner.mount(id, mount_label).await
            }
            async fn unmount(&self, id: &str) -> Result<()> {
                self.inner.unmount(id).await
            }
            $($set_metadata)*
            async fn metadata(&self, id: &str) -> Result<String> {
                self.inner.metadata(id).await
            }
        }
    };
}

delegate_store!(
    RacingStore,
    {
        async fn create_container(
            &self,
            names: &[String],
            image_id: &str,
            options: &ContainerOptions,
        ) -> Result<ContainerRecord> {
            self.attempted_names.lock().extend(names.iter().cloned());
            let lose_race = self
                .collisions
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose_race {
                self.inner
                    .create_container(names, "", &ContainerOptions::default())
                    .await?;
            }
            self.inner.create_container(names, image_id, options).await
        }
    },
    {
        async fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
            self.inner.set_metadata(id, metadata).await
        }
    }
);

delegate_store!(
    FailingSaveStore,
    {
        async fn create_container(
            &self,
            names: &[String],
            image_id: &str,
            options: &ContainerOptions,
        ) -> Result<ContainerRecord> {
            self.inner.create_container(names, image_id, options).await
        }
    },
    {
        async fn set_metadata(&self, _id: &str, _metadata: &str) -> Result<()> {
            Err(KilnError::Other("metadata volume is read-only".to_string()))
        }
    }
);

/// Store wrapper where every requested container name is already in use.
pub struct AlwaysTakenStore {
    inner: Arc<dyn Store>,
    pub attempted_names: Mutex<Vec<String>>,
}

impl AlwaysTakenStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            attempted_names: Mutex::new(Vec::new()),
        }
    }
}

delegate_store!(
    AlwaysTakenStore,
    {
        async fn create_container(
            &self,
            names: &[String],
            _image_id: &str,
            _options: &ContainerOptions,
        ) -> Result<ContainerRecord> {
            self.attempted_names.lock().extend(names.iter().cloned());
            Err(KilnError::DuplicateName(names.join(", ")))
        }
    },
    {
        async fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
            self.inner.set_metadata(id, metadata).await
        }
    }
);

/// A fresh on-disk store in a temporary directory.
pub fn temp_store() -> (TempDir, Arc<dyn Store>) {
    let tmp = TempDir::new().expect("temp dir");
    let store: Arc<dyn Store> = Arc::new(LocalStore::open(tmp.path()).expect("open store"));
    (tmp, store)
}

/// Transports with `registry` as `docker` and the local store transport.
pub fn transports(registry: &FakeRegistry, store: Arc<dyn Store>) -> Transports {
    Transports::new()
        .with(Arc::new(registry.clone()))
        .with(Arc::new(StorageTransport::new(store)))
}

/// System context searching only `registries`, targeting linux/amd64.
pub fn system_context(registries: &[&str]) -> SystemContext {
    SystemContext {
        search_registries: registries.iter().map(|r| r.to_string()).collect(),
        platform: Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        },
        ..Default::default()
    }
}

/// Record `image` in `store` as if it had been pulled as `name`.
pub async fn store_image(store: &dyn Store, name: &str, image: &FakeImage) -> ImageRecord {
    let (manifest, _) = &image.manifest;
    let mut big_data = vec![("manifest".to_string(), manifest.clone())];
    big_data.extend(image.blobs.iter().map(|(k, v)| (k.clone(), v.clone())));
    let created = image
        .blobs
        .values()
        .next()
        .and_then(|blob| serde_json::from_slice::<serde_json::Value>(blob).ok())
        .and_then(|config| {
            config["created"]
                .as_str()
                .and_then(|c| chrono::DateTime::parse_from_rfc3339(c).ok())
        })
        .map(|c| c.with_timezone(&chrono::Utc))
        .unwrap_or_default();
    store
        .put_image(NewImage {
            id: image.image_id(),
            names: vec![NamedReference::parse(name)
                .expect("valid name")
                .full_reference()],
            digest: digest(manifest),
            created,
            top_layer: Some("sha256:1a7e4".to_string()),
            big_data,
        })
        .await
        .expect("put image")
}

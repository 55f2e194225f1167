//! Image pull orchestrator.
//!
//! Copies an image's manifests and configuration from any transport into the
//! local store, retrying transient registry failures. Layer blobs are not
//! downloaded; the top layer is recorded by digest.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::config::{Platform, PullConfig, SystemContext};
use kiln_core::error::{KilnError, Result, ResultExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::manifest::{self, ImageConfigBlob, ImageManifest};
use crate::store::{instance_manifest_key, NewImage, Store, MANIFEST_KEY};
use crate::transport::{cancellable, ImageReference, ImageSource, StorageReference};

/// Sink for human-readable pull progress lines.
pub type ReportWriter = Arc<Mutex<dyn Write + Send>>;

/// Retry and reporting settings for [`pull_image`].
#[derive(Clone)]
pub struct PullOptions {
    /// Additional attempts after the first one fails
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub report_writer: Option<ReportWriter>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self::from_config(&PullConfig::default())
    }
}

impl PullOptions {
    pub fn from_config(config: &PullConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            report_writer: None,
        }
    }

    fn report(&self, line: &str) {
        if let Some(writer) = &self.report_writer {
            let mut writer = writer.lock();
            if let Err(e) = writeln!(writer, "{}", line) {
                tracing::debug!(error = %e, "Failed to write pull progress");
            }
        }
    }
}

impl std::fmt::Debug for PullOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("report_writer", &self.report_writer.is_some())
            .finish()
    }
}

/// Everything read from an image source for one platform instance.
#[derive(Debug, Clone)]
pub struct SourcedImage {
    /// Top-level manifest exactly as served
    pub top_manifest: Vec<u8>,
    pub top_manifest_type: String,
    /// Digest of the top-level manifest
    pub digest: String,
    /// Manifest of the selected instance (the top manifest for single images)
    pub manifest: Vec<u8>,
    pub manifest_type: String,
    /// Instance digest chosen from a manifest list
    pub instance: Option<String>,
    pub config_digest: String,
    pub config_blob: Vec<u8>,
    pub top_layer: Option<String>,
}

impl SourcedImage {
    /// Store ID for this image: the hex part of its configuration digest.
    pub fn image_id(&self) -> String {
        self.config_digest
            .strip_prefix("sha256:")
            .unwrap_or(&self.config_digest)
            .to_string()
    }

    /// Decode the image configuration blob.
    pub fn config(&self) -> Result<ImageConfigBlob> {
        ImageConfigBlob::from_blob(&self.config_blob)
    }
}

/// Open `reference` and read its manifest and configuration for the
/// context's platform. The source is closed on every path.
pub async fn read_image(
    cancel: &CancellationToken,
    sys: &SystemContext,
    reference: &dyn ImageReference,
) -> Result<SourcedImage> {
    let mut source = cancellable(cancel, reference.new_image_source(sys, cancel))
        .await
        .with_context(|| format!("error instantiating image for {:?}", reference.image_name()))?;

    let result = read_from_source(source.as_mut(), &sys.platform, cancel).await;

    if let Err(e) = source.close().await {
        tracing::warn!(
            reference = %reference.image_name(),
            error = %e,
            "Failed to close image source"
        );
    }

    result.with_context(|| format!("error reading image {:?}", reference.image_name()))
}

async fn read_from_source(
    source: &mut dyn ImageSource,
    platform: &Platform,
    cancel: &CancellationToken,
) -> Result<SourcedImage> {
    let (top_manifest, top_manifest_type) = source.manifest(None, cancel).await?;
    let top_manifest_type = if top_manifest_type.is_empty() {
        manifest::guess_mime_type(&top_manifest)
    } else {
        top_manifest_type
    };
    let digest = manifest::digest(&top_manifest);

    let (instance_manifest, manifest_type, instance) =
        if manifest::is_multi_image(&top_manifest_type) {
            let instance = manifest::choose_instance(&top_manifest, &top_manifest_type, platform)?;
            manifest::validate_digest(&instance)?;
            tracing::debug!(instance = %instance, platform = %platform, "Selected manifest list instance");
            let (data, mime_type) = source.manifest(Some(&instance), cancel).await?;
            (data, mime_type, Some(instance))
        } else {
            (top_manifest.clone(), top_manifest_type.clone(), None)
        };

    let parsed = ImageManifest::from_blob(&instance_manifest)?;
    let config_digest = parsed.config.digest.clone();
    // The config digest becomes the image ID and a big data key.
    manifest::validate_digest(&config_digest)?;
    let config_blob = source.blob(&config_digest, cancel).await?;

    Ok(SourcedImage {
        top_manifest,
        top_manifest_type,
        digest,
        manifest: instance_manifest,
        manifest_type,
        instance,
        config_digest,
        config_blob,
        top_layer: parsed.top_layer().map(str::to_string),
    })
}

/// Creation time of the image `reference` points at.
pub async fn inspect_created(
    cancel: &CancellationToken,
    sys: &SystemContext,
    reference: &dyn ImageReference,
) -> Result<DateTime<Utc>> {
    let image = read_image(cancel, sys, reference).await?;
    image.config()?.created.ok_or_else(|| {
        KilnError::ManifestError(format!(
            "image configuration of {:?} has no creation time",
            reference.image_name()
        ))
    })
}

/// Pull `src_ref` into `store`, returning a reference to the stored image.
///
/// Registry and I/O failures are retried up to `options.max_retries` times
/// with `options.retry_delay` between attempts.
pub async fn pull_image(
    cancel: &CancellationToken,
    sys: &SystemContext,
    store: &Arc<dyn Store>,
    src_ref: &dyn ImageReference,
    options: &PullOptions,
) -> Result<StorageReference> {
    let image_name = src_ref.image_name();
    let dest = src_ref.docker_reference().ok_or_else(|| {
        KilnError::Internal(format!("error computing local image name for {:?}", image_name))
    })?;

    let mut attempt = 0;
    loop {
        match pull_once(cancel, sys, store, src_ref, &dest, options).await {
            Ok(reference) => return Ok(reference),
            Err(e) if e.is_retryable() && attempt < options.max_retries => {
                attempt += 1;
                tracing::warn!(
                    reference = %image_name,
                    attempt,
                    max_retries = options.max_retries,
                    error = %e,
                    "Pull failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(KilnError::Cancelled),
                    _ = tokio::time::sleep(options.retry_delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn pull_once(
    cancel: &CancellationToken,
    sys: &SystemContext,
    store: &Arc<dyn Store>,
    src_ref: &dyn ImageReference,
    dest: &str,
    options: &PullOptions,
) -> Result<StorageReference> {
    options.report(&format!("Trying to pull {}...", src_ref.image_name()));
    tracing::info!(reference = %src_ref.image_name(), destination = %dest, "Pulling image");

    let image = read_image(cancel, sys, src_ref).await?;
    let config = image.config()?;

    options.report("Writing manifest to image destination");
    let mut big_data = vec![(MANIFEST_KEY.to_string(), image.top_manifest.clone())];
    if let Some(instance) = &image.instance {
        big_data.push((instance_manifest_key(instance), image.manifest.clone()));
    }
    big_data.push((image.config_digest.clone(), image.config_blob.clone()));

    let record = store
        .put_image(NewImage {
            id: image.image_id(),
            names: vec![dest.to_string()],
            digest: image.digest.clone(),
            created: config.created.unwrap_or_default(),
            top_layer: image.top_layer.clone(),
            big_data,
        })
        .await?;
    options.report("Storing signatures");

    tracing::info!(
        reference = %src_ref.image_name(),
        id = %record.id,
        digest = %record.digest,
        "Image pulled successfully"
    );
    Ok(StorageReference::for_image(Arc::clone(store), &record))
}

//! Creating a builder from a base image.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_core::error::{Result, ResultExt};
use kiln_core::namespace::default_namespace_options;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::{Builder, BuilderOptions, BUILDER_TYPE};
use crate::idmap;
use crate::manifest::ImageConfigBlob;
use crate::naming::{
    display_image_name, find_unused_container, image_name_prefix, working_container_name,
};
use crate::pull::{read_image, SourcedImage};
use crate::resolve::{resolve_image, ResolvedImage};
use crate::store::{ContainerOptions, ContainerRecord, Store};
use crate::transport::{ImageReference, Transports};

/// Base image name meaning "no base image".
pub const BASE_IMAGE_FAKE_NAME: &str = "scratch";

/// Widening random suffixes tried after a name collision.
const RANDOM_SUFFIX_RETRIES: u32 = 5;

/// Upper bound on container creation attempts for one build.
const MAX_CREATE_ATTEMPTS: u32 = 16;

/// Deletes a freshly created container unless the build completes.
struct ContainerGuard {
    store: Arc<dyn Store>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(store: Arc<dyn Store>, id: String) -> Self {
        Self {
            store,
            id: Some(id),
        }
    }

    fn commit(mut self) {
        self.id = None;
    }

    async fn rollback(mut self) {
        if let Some(id) = self.id.take() {
            delete_container(self.store.as_ref(), &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    delete_container(store.as_ref(), &id).await;
                });
            }
            Err(_) => {
                tracing::error!(id = %id, "No runtime available, build container left behind");
            }
        }
    }
}

async fn delete_container(store: &dyn Store, id: &str) {
    match store.delete_container(id).await {
        Ok(()) => tracing::debug!(id, "Removed build container after failure"),
        Err(e) => tracing::error!(id, error = %e, "Error deleting container"),
    }
}

/// Resolve the base image, create a working container for it and save the
/// resulting builder.
///
/// No container is left behind when this fails.
pub async fn new_builder(
    cancel: &CancellationToken,
    store: &Arc<dyn Store>,
    transports: &Transports,
    mut options: BuilderOptions,
) -> Result<Builder> {
    if options.from_image == BASE_IMAGE_FAKE_NAME {
        options.from_image.clear();
    }
    let sys = options.effective_system_context();

    let resolved = if options.from_image.is_empty() {
        None
    } else {
        Some(resolve_image(cancel, &sys, store, transports, &options.resolve_options()).await?)
    };

    let mut image_spec = options.from_image.clone();
    let mut image_id = String::new();
    let mut top_layer = None;
    if let Some(ResolvedImage { image, .. }) = &resolved {
        image_spec = display_image_name(&image_name_prefix(&image_spec), image);
        image_id = image.id.clone();
        top_layer = image.top_layer.clone();
    }

    let sourced = match &resolved {
        Some(resolved) => Some(source_image(cancel, &sys, resolved.reference.as_ref()).await?),
        None => None,
    };

    let pinned = options.container.is_some();
    let name = match &options.container {
        Some(name) => name.clone(),
        None => working_container_name(&image_spec),
    };
    let container = create_container(store, &name, pinned, &image_id, &options).await?;

    let guard = ContainerGuard::new(Arc::clone(store), container.id.clone());
    let result = assemble(
        store.as_ref(),
        &container,
        image_spec,
        image_id,
        top_layer,
        sourced.as_ref(),
        &sys.platform,
        &options,
    )
    .await;

    match result {
        Ok(builder) => {
            guard.commit();
            tracing::info!(
                container = %builder.container,
                id = %builder.container_id,
                image = %builder.from_image,
                "Created build container"
            );
            Ok(builder)
        }
        Err(e) => {
            guard.rollback().await;
            Err(e)
        }
    }
}

/// Read the resolved image's manifest and configuration for the target platform.
async fn source_image(
    cancel: &CancellationToken,
    sys: &kiln_core::config::SystemContext,
    reference: &dyn ImageReference,
) -> Result<SourcedImage> {
    read_image(cancel, sys, reference)
        .await
        .with_context(|| format!("error loading image manifest for {:?}", reference.image_name()))
}

/// Create the working container, steering around names taken concurrently.
async fn create_container(
    store: &Arc<dyn Store>,
    name: &str,
    pinned: bool,
    image_id: &str,
    options: &BuilderOptions,
) -> Result<ContainerRecord> {
    let mut tmp_name = name.to_string();
    if !pinned {
        let containers = store
            .containers()
            .await
            .context("unable to check for container names")?;
        tmp_name = find_unused_container(&tmp_name, &containers);
    }

    let container_options = ContainerOptions {
        label_opts: options.common_build_opts.label_opts.clone(),
        id_mapping: idmap::merge(options.id_mapping_options.as_ref()),
    };

    let mut conflict: u64 = 100;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store
            .create_container(std::slice::from_ref(&tmp_name), image_id, &container_options)
            .await
        {
            Ok(container) => return Ok(container),
            Err(e) if e.is_duplicate_name() && !pinned && attempt < MAX_CREATE_ATTEMPTS => {
                let next = if attempt <= RANDOM_SUFFIX_RETRIES {
                    let suffix = rand::thread_rng().gen_range(0..conflict);
                    conflict = conflict.saturating_mul(10);
                    format!("{}-{}", name, suffix)
                } else {
                    format!("{}-{}", name, uuid::Uuid::new_v4().simple())
                };
                tracing::debug!(taken = %tmp_name, next = %next, "Container name in use, retrying");
                tmp_name = next;
            }
            Err(e) => return Err(e.context("error creating container")),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn assemble(
    store: &dyn Store,
    container: &ContainerRecord,
    from_image: String,
    from_image_id: String,
    top_layer: Option<String>,
    sourced: Option<&SourcedImage>,
    platform: &kiln_core::config::Platform,
    options: &BuilderOptions,
) -> Result<Builder> {
    let mut namespace_options = default_namespace_options(&options.default_namespaces)?;
    namespace_options.add_or_replace(options.namespace_options.clone());

    let name = container
        .names
        .first()
        .cloned()
        .unwrap_or_else(|| container.id.clone());

    let mut builder = Builder {
        kind: BUILDER_TYPE.to_string(),
        from_image,
        from_image_id,
        from_image_digest: sourced.map(|s| s.digest.clone()).unwrap_or_default(),
        container: name,
        container_id: container.id.clone(),
        process_label: container.process_label.clone(),
        mount_label: container.mount_label.clone(),
        mount_point: None,
        namespace_options,
        id_mapping_options: idmap::from_container(&container.uid_map, &container.gid_map),
        capabilities: options.capabilities.clone(),
        common_build_opts: options.common_build_opts.clone(),
        top_layer,
        args: options.args.clone(),
        format: options.format,
        temp_volumes: BTreeMap::new(),
        devices: options.devices.clone(),
        configure_network: options.configure_network,
        cni_plugin_path: options.cni_plugin_path.clone(),
        cni_config_dir: options.cni_config_dir.clone(),
        default_mounts_file_path: options.default_mounts_file_path.clone(),
        isolation: options.isolation,
        image_annotations: BTreeMap::new(),
        image_created_by: String::new(),
        config: ImageConfigBlob::default(),
    };

    if options.mount {
        builder
            .mount(store, &container.mount_label)
            .await
            .with_context(|| format!("error mounting build container {:?}", builder.container_id))?;
    }

    builder
        .init_config(sourced, platform)
        .context("error preparing image configuration")?;

    builder
        .save(store)
        .await
        .with_context(|| format!("error saving builder state for container {:?}", builder.container_id))?;

    Ok(builder)
}

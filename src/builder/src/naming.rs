//! Working container and image display names.

use crate::store::{ContainerRecord, ImageRecord};

/// Default container name when no image prefix is available.
pub const WORKING_CONTAINER: &str = "working-container";

fn name_in_use(name: &str, containers: &[ContainerRecord]) -> bool {
    containers.iter().any(|c| c.has_name(name))
}

/// First of `base`, `base-1`, `base-2`, ... not used by any container.
pub fn find_unused_container(base: &str, containers: &[ContainerRecord]) -> String {
    let mut candidate = base.to_string();
    let mut suffix = 1u64;
    while name_in_use(&candidate, containers) {
        candidate = format!("{}-{}", base, suffix);
        suffix += 1;
    }
    candidate
}

/// Short name of an image: no tag, registry path or digest.
///
/// `docker.io/library/busybox:latest` → `busybox`. Everything after the
/// first colon is dropped, so a name with a registry port yields the host.
pub fn image_name_prefix(image_name: &str) -> String {
    let prefix = image_name.split(':').next().unwrap_or(image_name);
    let prefix = prefix.rsplit('/').next().unwrap_or(prefix);
    let prefix = prefix.split('@').next().unwrap_or(prefix);
    prefix.to_string()
}

/// Name to record as a builder's source image.
///
/// Prefers the first of the image's names containing `prefix`, so a
/// container started from a tagged alias keeps that alias.
pub fn display_image_name(prefix: &str, image: &ImageRecord) -> String {
    image
        .names
        .iter()
        .find(|n| n.contains(prefix))
        .or_else(|| image.names.first())
        .cloned()
        .unwrap_or_else(|| prefix.to_string())
}

/// Default working container name for a source image name.
pub fn working_container_name(image_spec: &str) -> String {
    if image_spec.is_empty() {
        WORKING_CONTAINER.to_string()
    } else {
        format!("{}-{}", image_name_prefix(image_spec), WORKING_CONTAINER)
    }
}

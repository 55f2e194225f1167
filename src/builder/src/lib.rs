//! Kiln Builder - Base Image Resolution and Build Containers
//!
//! Turns a user-supplied image name into a local image according to a pull
//! policy, then creates the working container a build runs in.
//!
//! ```text
//! new_builder
//!   ├─ resolve_image ── resolve_name, pull_image, choose_instance
//!   ├─ find_unused_container
//!   ├─ idmap::merge
//!   └─ Store (create_container, mount, set_metadata)
//! ```

pub mod builder;
pub mod idmap;
pub mod manifest;
pub mod naming;
pub mod pull;
pub mod reference;
pub mod resolve;
pub mod shortnames;
pub mod store;
pub mod transport;

pub use builder::{
    new_builder, Builder, BuilderOptions, CommonBuildOptions, DeviceMapping, Isolation,
    NetworkConfigurationPolicy, OutputFormat, BASE_IMAGE_FAKE_NAME,
};
pub use manifest::choose_instance;
pub use naming::{display_image_name, find_unused_container, image_name_prefix};
pub use pull::{inspect_created, pull_image, PullOptions, ReportWriter, SourcedImage};
pub use reference::NamedReference;
pub use resolve::{resolve_image, ResolveOptions, ResolvedImage};
pub use shortnames::{resolve_name, NameCandidates};
pub use store::{ContainerRecord, ImageRecord, LocalStore, Store};
pub use transport::{
    DockerTransport, ImageReference, ImageSource, RegistryAuth, StorageReference,
    StorageTransport, Transport, Transports,
};

use std::sync::Arc;

/// Transports for registry images and images already in `store`.
pub fn default_transports(store: Arc<dyn Store>, auth: RegistryAuth) -> Transports {
    Transports::new()
        .with(Arc::new(DockerTransport::new(auth)))
        .with(Arc::new(StorageTransport::new(store)))
}

//! Image transports.
//!
//! A transport turns a name into an [`ImageReference`]; a reference opens an
//! [`ImageSource`] that serves manifests and blobs. Registry access lives in
//! [`docker`], access to images already in the local store in [`storage`].

pub mod docker;
pub mod storage;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::config::SystemContext;
use kiln_core::error::{KilnError, Result};
use tokio_util::sync::CancellationToken;

pub use docker::{DockerTransport, RegistryAuth, RegistryClient};
pub use storage::{StorageReference, StorageTransport};

/// Transport name used for registry candidates.
pub const DEFAULT_TRANSPORT: &str = "docker";

/// A way of locating images.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Parse `reference` (the part after `<transport>:`).
    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageReference>>;
}

/// A location of one image under some transport.
#[async_trait]
pub trait ImageReference: Send + Sync + std::fmt::Debug {
    fn transport_name(&self) -> &str;

    /// Reference text within the transport, without the transport prefix.
    fn string_within_transport(&self) -> String;

    /// Normalized registry name (e.g. "docker.io/library/busybox:latest"), if any.
    fn docker_reference(&self) -> Option<String>;

    /// Open a source serving this image's manifests and blobs.
    async fn new_image_source(
        &self,
        sys: &SystemContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ImageSource>>;

    /// `transport:reference`, the form used in messages.
    fn image_name(&self) -> String {
        if self.transport_name() == DEFAULT_TRANSPORT {
            format!("{}://{}", self.transport_name(), self.string_within_transport())
        } else {
            format!("{}:{}", self.transport_name(), self.string_within_transport())
        }
    }
}

/// An open handle serving one image's manifests and blobs.
///
/// Every opened source must be closed exactly once.
#[async_trait]
pub trait ImageSource: Send {
    /// Fetch a manifest: the top-level one, or the list instance `instance`.
    /// Returns the bytes and their MIME type.
    async fn manifest(
        &mut self,
        instance: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, String)>;

    /// Fetch a blob by digest.
    async fn blob(&mut self, digest: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KilnError::Cancelled),
        result = fut => result,
    }
}

/// The set of transports names may be parsed under.
#[derive(Clone, Default)]
pub struct Transports {
    transports: BTreeMap<String, Arc<dyn Transport>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport, replacing any previous one with the same name.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.name().to_string(), transport);
    }

    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transports.contains_key(name)
    }

    /// Parse `reference` under the named transport.
    pub fn parse(&self, transport: &str, reference: &str) -> Result<Box<dyn ImageReference>> {
        self.get(transport)
            .ok_or_else(|| KilnError::InvalidReference {
                reference: reference.to_string(),
                message: format!("unknown transport {:?}", transport),
            })?
            .parse_reference(reference)
    }

    /// Parse a full `transport:reference` name (`docker://name` also accepted).
    pub fn parse_image_name(&self, image_name: &str) -> Result<Box<dyn ImageReference>> {
        let (transport, reference) = split_transport(image_name).ok_or_else(|| {
            KilnError::InvalidReference {
                reference: image_name.to_string(),
                message: "expected transport:reference".to_string(),
            }
        })?;
        self.parse(transport, reference)
    }

    /// Split a known transport prefix off `name`, if it has one.
    pub fn strip_transport<'a>(&self, name: &'a str) -> Option<(&'a str, &'a str)> {
        split_transport(name).filter(|(transport, _)| self.contains(transport))
    }
}

fn split_transport(image_name: &str) -> Option<(&str, &str)> {
    let (transport, rest) = image_name.split_once(':')?;
    if transport.is_empty() {
        return None;
    }
    let rest = if transport == DEFAULT_TRANSPORT {
        rest.strip_prefix("//")?
    } else {
        rest
    };
    Some((transport, rest))
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.transports.keys()).finish()
    }
}

//! Registry transport.
//!
//! Uses the `oci-distribution` crate to read manifests and blobs from
//! container registries (Docker Hub, Quay, GHCR, etc.).

use async_trait::async_trait;
use kiln_core::config::SystemContext;
use kiln_core::error::{KilnError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio_util::sync::CancellationToken;

use super::{cancellable, ImageReference, ImageSource, Transport, DEFAULT_TRANSPORT};
use crate::manifest::{
    digest, guess_mime_type, validate_digest, DOCKER_V2S2_MANIFEST, DOCKER_V2_LIST, OCI_INDEX,
    OCI_MANIFEST,
};
use crate::reference::NamedReference;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Thin wrapper over an `oci-distribution` client for one registry.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
    registry: String,
}

impl RegistryClient {
    /// Create a client for `registry`, speaking plain HTTP if `insecure`.
    pub fn new(registry: impl Into<String>, auth: RegistryAuth, insecure: bool) -> Self {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            registry: registry.into(),
        }
    }

    /// Fetch a manifest exactly as served, returning its bytes, MIME type and
    /// the digest the registry reported for it.
    pub async fn pull_manifest(&self, reference: &NamedReference) -> Result<(Vec<u8>, String, String)> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        let (data, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| self.error(format!("Failed to pull manifest: {}", e)))?;
        verify_manifest_digest(&data, &digest)?;
        let mime_type = guess_mime_type(&data);

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            mime_type = %mime_type,
            "Pulled manifest"
        );
        Ok((data, mime_type, digest))
    }

    /// Fetch a blob by digest from `reference`'s repository.
    pub async fn pull_blob(&self, reference: &NamedReference, digest: &str) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            ..Default::default()
        };

        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &descriptor, &mut data)
            .await
            .map_err(|e| self.error(format!("Failed to pull blob {}: {}", digest, e)))?;

        tracing::debug!(digest = %digest, size = data.len(), "Pulled blob");
        Ok(data)
    }

    fn error(&self, message: String) -> KilnError {
        KilnError::RegistryError {
            registry: self.registry.clone(),
            message,
        }
    }
}

/// Manifest types requested from registries.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[OCI_MANIFEST, OCI_INDEX, DOCKER_V2S2_MANIFEST, DOCKER_V2_LIST];

/// Check served manifest bytes against the digest they were addressed by.
///
/// Only sha256 digests can be recomputed here; other algorithms are only
/// checked for form.
fn verify_manifest_digest(data: &[u8], expected: &str) -> Result<()> {
    validate_digest(expected)?;
    if expected.starts_with("sha256:") && digest(data) != expected {
        return Err(KilnError::ManifestError(format!(
            "manifest digest mismatch: expected {}, got {}",
            expected,
            digest(data)
        )));
    }
    Ok(())
}

/// Convert a [`NamedReference`] to an oci-distribution [`Reference`].
fn to_oci_reference(reference: &NamedReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| KilnError::InvalidReference {
        reference: ref_str.clone(),
        message: e.to_string(),
    })
}

/// The `docker` transport: images in remote registries.
#[derive(Debug, Clone, Default)]
pub struct DockerTransport {
    auth: RegistryAuth,
}

impl DockerTransport {
    pub fn new(auth: RegistryAuth) -> Self {
        Self { auth }
    }
}

impl Transport for DockerTransport {
    fn name(&self) -> &str {
        DEFAULT_TRANSPORT
    }

    fn parse_reference(&self, reference: &str) -> Result<Box<dyn ImageReference>> {
        let named = NamedReference::parse(reference)?;
        Ok(Box::new(DockerReference {
            named,
            auth: self.auth.clone(),
        }))
    }
}

/// A repository tag or digest in a remote registry.
#[derive(Debug, Clone)]
pub struct DockerReference {
    named: NamedReference,
    auth: RegistryAuth,
}

impl DockerReference {
    pub fn named(&self) -> &NamedReference {
        &self.named
    }
}

#[async_trait]
impl ImageReference for DockerReference {
    fn transport_name(&self) -> &str {
        DEFAULT_TRANSPORT
    }

    fn string_within_transport(&self) -> String {
        self.named.full_reference()
    }

    fn docker_reference(&self) -> Option<String> {
        Some(self.named.full_reference())
    }

    async fn new_image_source(
        &self,
        sys: &SystemContext,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn ImageSource>> {
        let insecure = sys.is_insecure(&self.named.registry);
        if insecure {
            tracing::warn!(registry = %self.named.registry, "Using plain HTTP for insecure registry");
        }
        let client = RegistryClient::new(self.named.registry.clone(), self.auth.clone(), insecure);
        Ok(Box::new(DockerImageSource {
            client,
            named: self.named.clone(),
        }))
    }
}

struct DockerImageSource {
    client: RegistryClient,
    named: NamedReference,
}

#[async_trait]
impl ImageSource for DockerImageSource {
    async fn manifest(
        &mut self,
        instance: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, String)> {
        let target = match instance {
            Some(digest) => self.named.with_digest(digest),
            None => self.named.clone(),
        };
        let (data, mime_type, served_digest) =
            cancellable(cancel, self.client.pull_manifest(&target)).await?;
        if let Some(wanted) = instance {
            if served_digest != wanted {
                return Err(KilnError::ManifestError(format!(
                    "registry served manifest {} for instance {}",
                    served_digest, wanted
                )));
            }
        }
        Ok((data, mime_type))
    }

    async fn blob(&mut self, digest: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        cancellable(cancel, self.client.pull_blob(&self.named, digest)).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        tracing::trace!(reference = %self.named, "Closed registry source");
        Ok(())
    }
}

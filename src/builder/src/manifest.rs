//! Manifest and image configuration parsing.
//!
//! Understands OCI image manifests and indexes as well as Docker schema 2
//! manifests and manifest lists, which share the same JSON shape for the
//! fields used here.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use kiln_core::config::Platform;
use kiln_core::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_V2S2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Whether a manifest MIME type refers to a list of per-platform manifests.
pub fn is_multi_image(mime_type: &str) -> bool {
    mime_type == OCI_INDEX || mime_type == DOCKER_V2_LIST
}

/// Content digest of a blob, `sha256:<hex>`.
pub fn digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Check that `digest` has the `<algorithm>:<encoded>` content digest form.
///
/// The algorithm is lowercase alphanumeric components joined by `+._-` and
/// the encoded part is limited to `[A-Za-z0-9=_-]`, so a valid digest never
/// contains a path separator or a `..` component.
pub fn validate_digest(digest: &str) -> Result<()> {
    let invalid = |why: &str| -> Result<()> {
        Err(KilnError::ManifestError(format!(
            "invalid digest {:?}: {}",
            digest, why
        )))
    };
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return invalid("missing algorithm");
    };
    let component_ok = |c: &str| {
        !c.is_empty()
            && c.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    if !algorithm.split(['+', '.', '_', '-']).all(component_ok) {
        return invalid("malformed algorithm");
    }
    if encoded.is_empty()
        || !encoded
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'))
    {
        return invalid("malformed encoded part");
    }
    Ok(())
}

/// Best-effort MIME type detection for manifests stored without one.
pub fn guess_mime_type(manifest: &[u8]) -> String {
    #[derive(Deserialize)]
    struct MediaFields {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
        config: Option<serde_json::Value>,
    }

    match serde_json::from_slice::<MediaFields>(manifest) {
        Ok(MediaFields {
            media_type: Some(mt),
            ..
        }) => mt,
        Ok(MediaFields {
            manifests: Some(_), ..
        }) => OCI_INDEX.to_string(),
        Ok(MediaFields { config: Some(_), .. }) => OCI_MANIFEST.to_string(),
        _ => String::new(),
    }
}

/// Platform of a manifest list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
}

/// OCI image index or Docker manifest list.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestList {
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    pub fn from_blob(data: &[u8], mime_type: &str) -> Result<Self> {
        if !is_multi_image(mime_type) {
            return Err(KilnError::ManifestError(format!(
                "unsupported manifest list type {:?}",
                mime_type
            )));
        }
        serde_json::from_slice(data)
            .map_err(|e| KilnError::ManifestError(format!("failed to parse manifest list: {}", e)))
    }

    /// Pick the instance for `platform`.
    ///
    /// OS and architecture must match. An entry with the wanted variant wins;
    /// otherwise an entry without a variant is accepted.
    pub fn choose_instance(&self, platform: &Platform) -> Result<String> {
        let candidates: Vec<&Descriptor> = self
            .manifests
            .iter()
            .filter(|m| {
                m.platform.as_ref().map_or(false, |p| {
                    p.os == platform.os && p.architecture == platform.architecture
                })
            })
            .collect();

        let exact = candidates.iter().find(|m| {
            platform.variant.is_none()
                || m.platform.as_ref().and_then(|p| p.variant.as_ref()) == platform.variant.as_ref()
        });
        let fallback = candidates
            .iter()
            .find(|m| m.platform.as_ref().map_or(true, |p| p.variant.is_none()));

        match exact.or(fallback) {
            Some(m) => Ok(m.digest.clone()),
            None => {
                let available: Vec<String> = self
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref().map(|p| p.to_string()))
                    .collect();
                Err(KilnError::ManifestError(format!(
                    "no image found in manifest list for architecture {}, variant {:?}, OS {} (available: {})",
                    platform.architecture,
                    platform.variant.as_deref().unwrap_or(""),
                    platform.os,
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                )))
            }
        }
    }
}

/// Choose the manifest list instance matching `platform`.
pub fn choose_instance(manifest: &[u8], mime_type: &str, platform: &Platform) -> Result<String> {
    ManifestList::from_blob(manifest, mime_type)?.choose_instance(platform)
}

/// Single-platform image manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| KilnError::ManifestError(format!("failed to parse image manifest: {}", e)))
    }

    /// Digest of the topmost layer.
    pub fn top_layer(&self) -> Option<&str> {
        self.layers.last().map(|l| l.digest.as_str())
    }
}

/// Runtime defaults carried in an image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

/// Image history entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// Image configuration blob (OCI and Docker share these fields).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfigBlob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub history: Vec<History>,
}

impl ImageConfigBlob {
    pub fn from_blob(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| {
            KilnError::ManifestError(format!("failed to parse image configuration: {}", e))
        })
    }
}

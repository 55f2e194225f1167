//! Options accepted by [`new_builder`](super::new_builder).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::config::{KilnConfig, PullPolicy, SystemContext};
use kiln_core::error::{KilnError, Result};
use kiln_core::idmap::IdMappingOptions;
use kiln_core::namespace::NamespaceOptions;
use serde::{Deserialize, Serialize};

use crate::manifest::{DOCKER_V2S2_MANIFEST, OCI_MANIFEST};
use crate::pull::{PullOptions, ReportWriter};
use crate::resolve::ResolveOptions;

/// Image format written when the build is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Oci,
    Docker,
}

impl OutputFormat {
    /// Manifest MIME type for this format.
    pub fn manifest_type(&self) -> &'static str {
        match self {
            Self::Oci => OCI_MANIFEST,
            Self::Docker => DOCKER_V2S2_MANIFEST,
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oci" => Ok(Self::Oci),
            "docker" => Ok(Self::Docker),
            _ => Err(KilnError::ConfigError(format!(
                "unknown format '{}' (supported: oci, docker)",
                s
            ))),
        }
    }
}

/// How build steps will be isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Default,
    Oci,
    Chroot,
    Rootless,
}

/// Whether build steps get a configured network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkConfigurationPolicy {
    #[default]
    Default,
    Disabled,
    Enabled,
}

/// A host device exposed inside the build container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// cgroup permissions, some of "rwm"
    pub permissions: String,
}

impl std::str::FromStr for DeviceMapping {
    type Err = KilnError;

    /// Parse `source[:destination][:permissions]`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| KilnError::ConfigError(format!("invalid device '{}': {}", s, reason));
        let parts: Vec<&str> = s.split(':').collect();
        let is_permissions = |p: &str| !p.is_empty() && p.chars().all(|c| "rwm".contains(c));

        let (source, destination, permissions) = match parts.as_slice() {
            [src] => (*src, *src, "rwm"),
            [src, perms] if is_permissions(*perms) => (*src, *src, *perms),
            [src, dst] => (*src, *dst, "rwm"),
            [src, dst, perms] if is_permissions(*perms) => (*src, *dst, *perms),
            [_, _, _] => return Err(invalid("invalid permissions")),
            _ => return Err(invalid("expected source[:destination][:permissions]")),
        };
        if !source.starts_with('/') || !destination.starts_with('/') {
            return Err(invalid("paths must be absolute"));
        }
        Ok(Self {
            source: PathBuf::from(source),
            destination: PathBuf::from(destination),
            permissions: permissions.to_string(),
        })
    }
}

/// Resource and security settings shared by every build step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonBuildOptions {
    /// SELinux label options (e.g., "type:spc_t", "level:s0:c1,c2", "disable")
    pub label_opts: Vec<String>,
    pub add_host: Vec<String>,
    pub cgroup_parent: Option<String>,
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    /// Memory limit in bytes
    pub memory: Option<i64>,
    pub shm_size: Option<String>,
    pub ulimit: Vec<String>,
    pub volumes: Vec<String>,
    pub dns_servers: Vec<String>,
    pub dns_search: Vec<String>,
}

/// Everything needed to create a working container.
#[derive(Clone)]
pub struct BuilderOptions {
    /// Base image; empty or "scratch" for none
    pub from_image: String,
    /// Registry tried before the search registries
    pub registry: Option<String>,
    pub pull_policy: PullPolicy,
    pub system_context: Arc<SystemContext>,
    /// Overrides the system context's signature policy
    pub signature_policy_path: Option<PathBuf>,
    /// Default host/private namespace settings, by namespace name
    pub default_namespaces: BTreeMap<String, String>,
    /// Namespace settings overlaid on the defaults; later entries win
    pub namespace_options: NamespaceOptions,
    pub id_mapping_options: Option<IdMappingOptions>,
    pub capabilities: Vec<String>,
    pub common_build_opts: CommonBuildOptions,
    /// Exact container name; no collision avoidance when set
    pub container: Option<String>,
    /// Mount the container's root filesystem after creating it
    pub mount: bool,
    pub args: BTreeMap<String, String>,
    pub format: OutputFormat,
    pub devices: Vec<DeviceMapping>,
    pub configure_network: NetworkConfigurationPolicy,
    pub cni_plugin_path: Option<PathBuf>,
    pub cni_config_dir: Option<PathBuf>,
    pub max_pull_retries: u32,
    pub pull_retry_delay: Duration,
    pub report_writer: Option<ReportWriter>,
    pub default_mounts_file_path: Option<PathBuf>,
    pub isolation: Isolation,
}

impl std::fmt::Debug for BuilderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderOptions")
            .field("from_image", &self.from_image)
            .field("registry", &self.registry)
            .field("pull_policy", &self.pull_policy)
            .field("container", &self.container)
            .field("mount", &self.mount)
            .field("format", &self.format)
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self::from_config(&KilnConfig::default())
    }
}

impl BuilderOptions {
    /// Options with defaults taken from `config`.
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            from_image: String::new(),
            registry: None,
            pull_policy: config.pull.policy,
            system_context: Arc::new(config.system.clone()),
            signature_policy_path: None,
            default_namespaces: config.namespaces.clone(),
            namespace_options: NamespaceOptions::new(),
            id_mapping_options: None,
            capabilities: Vec::new(),
            common_build_opts: CommonBuildOptions::default(),
            container: None,
            mount: false,
            args: BTreeMap::new(),
            format: OutputFormat::default(),
            devices: Vec::new(),
            configure_network: NetworkConfigurationPolicy::default(),
            cni_plugin_path: None,
            cni_config_dir: None,
            max_pull_retries: config.pull.max_retries,
            pull_retry_delay: Duration::from_secs(config.pull.retry_delay_secs),
            report_writer: None,
            default_mounts_file_path: None,
            isolation: Isolation::default(),
        }
    }

    /// The system context with this build's overrides applied.
    pub fn effective_system_context(&self) -> Arc<SystemContext> {
        match &self.signature_policy_path {
            Some(path) => {
                let mut sys = (*self.system_context).clone();
                sys.signature_policy_path = Some(path.clone());
                Arc::new(sys)
            }
            None => Arc::clone(&self.system_context),
        }
    }

    pub(crate) fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            from_image: self.from_image.clone(),
            registry: self.registry.clone(),
            pull_policy: self.pull_policy,
            pull: PullOptions {
                max_retries: self.max_pull_retries,
                retry_delay: self.pull_retry_delay,
                report_writer: self.report_writer.clone(),
            },
        }
    }
}

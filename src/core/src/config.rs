use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{KilnError, Result};

/// Default location of the registries configuration named in error messages.
pub const DEFAULT_REGISTRIES_CONF: &str = "/etc/containers/registries.conf";

/// Environment variable overriding the configured search registries.
pub const SEARCH_REGISTRIES_ENV: &str = "KILN_SEARCH_REGISTRIES";

/// When to consult a registry for a base image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Always pull, even if a local copy exists
    Always,
    /// Pull only if the registry copy has a different creation time
    #[serde(alias = "newer")]
    IfNewer,
    /// Pull only if no local copy exists
    #[default]
    #[serde(alias = "missing")]
    IfMissing,
    /// Never pull; fail if no local copy exists
    Never,
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::IfNewer => write!(f, "ifnewer"),
            Self::IfMissing => write!(f, "ifmissing"),
            Self::Never => write!(f, "never"),
        }
    }
}

impl std::str::FromStr for PullPolicy {
    type Err = KilnError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "true" => Ok(Self::Always),
            "ifnewer" | "newer" => Ok(Self::IfNewer),
            "ifmissing" | "missing" | "false" => Ok(Self::IfMissing),
            "never" => Ok(Self::Never),
            _ => Err(KilnError::ConfigError(format!(
                "unknown pull policy '{}' (supported: always, ifnewer, ifmissing, never)",
                s
            ))),
        }
    }
}

/// Target platform for manifest list instance selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Linux on the host's CPU architecture, spelled the way image indexes spell it.
    pub fn host() -> Self {
        let (architecture, variant) = match std::env::consts::ARCH {
            "x86_64" => ("amd64", None),
            "aarch64" => ("arm64", Some("v8")),
            "x86" => ("386", None),
            "powerpc64" if cfg!(target_endian = "little") => ("ppc64le", None),
            other => (other, None),
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Process-wide image settings, threaded explicitly through every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemContext {
    /// Registries configuration file these settings were taken from
    pub registries_conf_path: PathBuf,

    /// Registries tried, in order, for unqualified image names
    pub search_registries: Vec<String>,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,

    /// Platform used to pick an instance out of manifest lists
    pub platform: Platform,

    /// Signature policy file, recorded for callers that verify images
    pub signature_policy_path: Option<PathBuf>,
}

impl Default for SystemContext {
    fn default() -> Self {
        Self {
            registries_conf_path: PathBuf::from(DEFAULT_REGISTRIES_CONF),
            search_registries: vec!["docker.io".to_string(), "quay.io".to_string()],
            insecure_registries: Vec::new(),
            platform: Platform::host(),
            signature_policy_path: None,
        }
    }
}

impl SystemContext {
    /// Whether `registry` should be reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Pull retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Default pull policy
    pub policy: PullPolicy,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Delay between attempts, in seconds
    pub retry_delay_secs: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            policy: PullPolicy::IfMissing,
            max_retries: 3,
            retry_delay_secs: 2,
        }
    }
}

/// Store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = dirs::data_local_dir()
            .map(|d| d.join("kiln").join("storage"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/kiln/storage"));
        Self { root }
    }
}

/// Top-level kiln configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Registry and platform settings
    pub system: SystemContext,

    /// Pull defaults
    pub pull: PullConfig,

    /// Default namespace settings: namespace name → "host", "private" or a path
    pub namespaces: BTreeMap<String, String>,

    /// Local store settings
    pub store: StoreConfig,
}

impl KilnConfig {
    /// Default config file location (`~/.config/kiln/config.yaml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("kiln"))
            .unwrap_or_else(|| PathBuf::from(".kiln"))
            .join("config.yaml")
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let config: KilnConfig = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::ConfigError(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&data)
    }

    /// Load from the default path, falling back to defaults when absent,
    /// then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `KILN_SEARCH_REGISTRIES` (comma separated) if set.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(SEARCH_REGISTRIES_ENV) {
            self.system.search_registries = parse_registry_list(&value);
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in &self.namespaces {
            if value.is_empty() {
                return Err(KilnError::ConfigError(format!(
                    "namespace '{}' has an empty setting",
                    name
                )));
            }
        }
        if self.system.search_registries.iter().any(|r| r.contains('/')) {
            return Err(KilnError::ConfigError(
                "search registries must be bare host names".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_registry_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

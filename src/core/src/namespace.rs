//! Namespace settings for build containers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{KilnError, Result};

/// Namespaces a build container may share with the host or join by path.
pub const NAMESPACES: &[&str] = &["cgroup", "ipc", "mount", "network", "pid", "user", "uts"];

/// Setting for a single namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOption {
    /// Namespace name (e.g., "network")
    pub name: String,
    /// Share the host's namespace
    pub host: bool,
    /// Join the namespace at this path instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl NamespaceOption {
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: false,
            path: None,
        }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: true,
            path: None,
        }
    }

    /// Parse a setting value: `host`, `private`, or an absolute path.
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        if !NAMESPACES.contains(&name) {
            return Err(KilnError::ConfigError(format!(
                "unknown namespace '{}' (supported: {})",
                name,
                NAMESPACES.join(", ")
            )));
        }
        match value {
            "host" => Ok(Self::host(name)),
            "private" | "" => Ok(Self::private(name)),
            path if path.starts_with('/') => Ok(Self {
                name: name.to_string(),
                host: false,
                path: Some(path.to_string()),
            }),
            other => Err(KilnError::ConfigError(format!(
                "invalid setting '{}' for namespace '{}': expected host, private or a path",
                other, name
            ))),
        }
    }
}

/// Ordered namespace settings; at most one entry per namespace name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceOptions(Vec<NamespaceOption>);

impl NamespaceOptions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Find the setting for a namespace.
    pub fn find(&self, name: &str) -> Option<&NamespaceOption> {
        self.0.iter().find(|o| o.name == name)
    }

    /// Overlay `options`, replacing any existing entry with the same name.
    /// Later entries win.
    pub fn add_or_replace<I>(&mut self, options: I)
    where
        I: IntoIterator<Item = NamespaceOption>,
    {
        for option in options {
            match self.0.iter_mut().find(|o| o.name == option.name) {
                Some(existing) => *existing = option,
                None => self.0.push(option),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamespaceOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<NamespaceOption> for NamespaceOptions {
    fn from_iter<T: IntoIterator<Item = NamespaceOption>>(iter: T) -> Self {
        let mut options = Self::new();
        options.add_or_replace(iter);
        options
    }
}

impl IntoIterator for NamespaceOptions {
    type Item = NamespaceOption;
    type IntoIter = std::vec::IntoIter<NamespaceOption>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Default namespace settings, adjusted by configured overrides.
///
/// Without overrides the cgroup and user namespaces are shared with the host
/// and everything else is private.
pub fn default_namespace_options(
    overrides: &BTreeMap<String, String>,
) -> Result<NamespaceOptions> {
    let mut options: NamespaceOptions = NAMESPACES
        .iter()
        .map(|&name| match name {
            "cgroup" | "user" => NamespaceOption::host(name),
            _ => NamespaceOption::private(name),
        })
        .collect();

    let configured = overrides
        .iter()
        .map(|(name, value)| NamespaceOption::parse(name, value))
        .collect::<Result<Vec<_>>>()?;
    options.add_or_replace(configured);
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = default_namespace_options(&BTreeMap::new()).unwrap();
        assert_eq!(options.len(), NAMESPACES.len());
        assert!(options.find("user").unwrap().host);
        assert!(!options.find("network").unwrap().host);
    }

    #[test]
    fn test_defaults_with_override() {
        let mut overrides = BTreeMap::new();
        overrides.insert("network".to_string(), "host".to_string());
        overrides.insert("ipc".to_string(), "/proc/1/ns/ipc".to_string());
        let options = default_namespace_options(&overrides).unwrap();
        assert!(options.find("network").unwrap().host);
        assert_eq!(
            options.find("ipc").unwrap().path.as_deref(),
            Some("/proc/1/ns/ipc")
        );
        assert_eq!(options.len(), NAMESPACES.len());
    }

    #[test]
    fn test_defaults_reject_unknown_namespace() {
        let mut overrides = BTreeMap::new();
        overrides.insert("time".to_string(), "host".to_string());
        assert!(default_namespace_options(&overrides).is_err());
    }

    #[test]
    fn test_add_or_replace_later_wins() {
        let mut options = NamespaceOptions::new();
        options.add_or_replace(vec![
            NamespaceOption::private("pid"),
            NamespaceOption::host("pid"),
            NamespaceOption::host("uts"),
        ]);
        assert_eq!(options.len(), 2);
        assert!(options.find("pid").unwrap().host);
        assert_eq!(options.iter().next().unwrap().name, "pid");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(NamespaceOption::parse("network", "sometimes").is_err());
    }
}

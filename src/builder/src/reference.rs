//! Docker-style image name parsing.
//!
//! Parses names like `quay.io/org/image:v1` into registry, repository, tag
//! and digest, applying the Docker Hub defaults used for local names.

use kiln_core::error::{KilnError, Result};

/// Registry assumed when a name has no domain component.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a name has neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// Repository prefix Docker Hub requires for single-component names.
pub const DOCKER_HUB_PREFIX: &str = "library";

/// Parsed, normalized image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedReference {
    /// Registry hostname, possibly with a port (e.g., "quay.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/busybox")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl NamedReference {
    /// Parse and normalize an image name.
    ///
    /// - `busybox` → docker.io/library/busybox:latest
    /// - `user/image:1` → docker.io/user/image:1
    /// - `localhost:5000/image` → localhost:5000/image:latest
    /// - `quay.io/org/image@sha256:…` → quay.io/org/image@sha256:…
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty image name"));
        }

        let (name_tag, digest) = match reference.rfind('@') {
            Some(at) => {
                let digest = &reference[at + 1..];
                validate_digest(reference, digest)?;
                (&reference[..at], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag is a colon after the last slash; before any slash it may be a port.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash) => match name_tag[slash + 1..].rfind(':') {
                Some(colon) => {
                    let split = slash + 1 + colon;
                    (&name_tag[..split], Some(&name_tag[split + 1..]))
                }
                None => (name_tag, None),
            },
            None => match name_tag.rfind(':') {
                Some(colon) => (&name_tag[..colon], Some(&name_tag[colon + 1..])),
                None => (name_tag, None),
            },
        };

        if let Some(tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(NamedReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Name without tag or digest (e.g., "docker.io/library/busybox").
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// The same repository pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

impl std::fmt::Display for NamedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Whether the first path component of `name` names a registry.
///
/// A component is a registry if it contains a dot or a port, or is `localhost`.
pub fn has_domain(name: &str) -> bool {
    match name.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}

fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    let (registry, repository) = if has_domain(name) {
        let (registry, repo) = name.split_once('/').unwrap_or((name, ""));
        (registry.to_string(), repo.to_string())
    } else if name.contains('/') {
        (DEFAULT_REGISTRY.to_string(), name.to_string())
    } else {
        (
            DEFAULT_REGISTRY.to_string(),
            format!("{}/{}", DOCKER_HUB_PREFIX, name),
        )
    };

    if repository.is_empty() || repository.split('/').any(str::is_empty) {
        return Err(invalid(reference, "empty repository path component"));
    }
    if repository
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c)))
    {
        return Err(invalid(reference, "repository name must be lowercase"));
    }
    Ok((registry, repository))
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        && !tag.starts_with(['.', '-']);
    if valid {
        Ok(())
    } else {
        Err(invalid(reference, "invalid tag"))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex))
            if !algorithm.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(invalid(reference, "expected digest in algorithm:hex form")),
    }
}

fn invalid(reference: &str, message: &str) -> KilnError {
    KilnError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = NamedReference::parse("busybox").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = NamedReference::parse("myuser/myimage:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("v1.0".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = NamedReference::parse("localhost:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = NamedReference::parse("quay.io/org/image@sha256:abcdef0123").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "org/image");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:abcdef0123".to_string()));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = NamedReference::parse("quay.io/org/image:v1@sha256:abcdef").unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.full_reference(), "quay.io/org/image:v1@sha256:abcdef");
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = NamedReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(NamedReference::parse("").is_err());
        assert!(NamedReference::parse("busybox@nodigest").is_err());
        assert!(NamedReference::parse("BusyBox").is_err());
        assert!(NamedReference::parse("quay.io/").is_err());
        assert!(NamedReference::parse("busybox:-bad").is_err());
    }

    #[test]
    fn test_has_domain() {
        assert!(has_domain("quay.io/busybox"));
        assert!(has_domain("localhost/busybox"));
        assert!(has_domain("myhost:5000/busybox"));
        assert!(!has_domain("library/busybox"));
        assert!(!has_domain("busybox"));
    }

    #[test]
    fn test_with_digest() {
        let r = NamedReference::parse("quay.io/org/image:v1").unwrap();
        let pinned = r.with_digest("sha256:0123");
        assert_eq!(pinned.to_string(), "quay.io/org/image@sha256:0123");
    }

    #[test]
    fn test_display() {
        let r = NamedReference::parse("busybox:1.36").unwrap();
        assert_eq!(format!("{}", r), "docker.io/library/busybox:1.36");
    }
}

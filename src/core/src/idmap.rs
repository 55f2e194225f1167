//! User and group ID mapping requests.

use serde::{Deserialize, Serialize};

/// One contiguous range of IDs mapped from the container into the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First ID inside the container
    pub container_id: u32,
    /// First ID on the host
    pub host_id: u32,
    /// Number of IDs in the range
    pub size: u32,
}

impl IdMap {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

impl std::str::FromStr for IdMap {
    type Err = crate::error::KilnError;

    /// Parse the `container:host:size` form used by `--userns-uid-map`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            crate::error::KilnError::ConfigError(format!("invalid ID mapping '{}': {}", s, reason))
        };
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid("expected container:host:size"));
        }
        let field = |v: &str| v.trim().parse::<u32>().map_err(|_| invalid("not a number"));
        Ok(Self::new(field(parts[0])?, field(parts[1])?, field(parts[2])?))
    }
}

/// How a build container's IDs relate to the host's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingOptions {
    pub host_uid_mapping: bool,
    pub host_gid_mapping: bool,
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

impl IdMappingOptions {
    /// Map every ID to itself.
    pub fn host() -> Self {
        Self {
            host_uid_mapping: true,
            host_gid_mapping: true,
            uid_map: Vec::new(),
            gid_map: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_map() {
        let map: IdMap = "0:100000:65536".parse().unwrap();
        assert_eq!(map, IdMap::new(0, 100000, 65536));
    }

    #[test]
    fn test_parse_id_map_invalid() {
        assert!("0:100000".parse::<IdMap>().is_err());
        assert!("a:b:c".parse::<IdMap>().is_err());
    }

    #[test]
    fn test_host_mapping() {
        let opts = IdMappingOptions::host();
        assert!(opts.host_uid_mapping && opts.host_gid_mapping);
        assert!(opts.uid_map.is_empty() && opts.gid_map.is_empty());
    }
}

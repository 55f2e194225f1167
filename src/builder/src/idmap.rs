//! Conversion between requested ID mappings and the store's representation.

use kiln_core::idmap::{IdMap, IdMappingOptions};

use crate::store;

/// Convert a requested mapping into the options passed to the store.
///
/// Without a request the store defaults apply. With one, both explicit maps
/// are passed through only when both are non-empty after conversion;
/// otherwise the container shares the host's IDs.
pub fn merge(options: Option<&IdMappingOptions>) -> store::IdMappingOptions {
    let Some(options) = options else {
        return store::IdMappingOptions::default();
    };

    let uid_map = to_store(&options.uid_map);
    let gid_map = to_store(&options.gid_map);
    if uid_map.is_empty() || gid_map.is_empty() {
        return store::IdMappingOptions {
            host_uid_mapping: true,
            host_gid_mapping: true,
            uid_map: Vec::new(),
            gid_map: Vec::new(),
        };
    }

    store::IdMappingOptions {
        host_uid_mapping: options.host_uid_mapping,
        host_gid_mapping: options.host_gid_mapping,
        uid_map,
        gid_map,
    }
}

/// The mapping recorded on a builder for a created container.
pub fn from_container(uid_map: &[store::IdMap], gid_map: &[store::IdMap]) -> IdMappingOptions {
    let uid_map = from_store(uid_map);
    let gid_map = from_store(gid_map);
    IdMappingOptions {
        host_uid_mapping: uid_map.is_empty(),
        host_gid_mapping: gid_map.is_empty(),
        uid_map,
        gid_map,
    }
}

fn to_store(maps: &[IdMap]) -> Vec<store::IdMap> {
    maps.iter()
        .filter(|m| m.size > 0)
        .map(|m| store::IdMap {
            container_id: m.container_id,
            host_id: m.host_id,
            size: m.size,
        })
        .collect()
}

fn from_store(maps: &[store::IdMap]) -> Vec<IdMap> {
    maps.iter()
        .filter(|m| m.size > 0)
        .map(|m| IdMap::new(m.container_id, m.host_id, m.size))
        .collect()
}

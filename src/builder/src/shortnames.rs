//! Expansion of user-supplied image names into ordered candidates.

use kiln_core::config::SystemContext;
use kiln_core::error::{Result, ResultExt};

use crate::reference::{has_domain, NamedReference, DEFAULT_REGISTRY, DOCKER_HUB_PREFIX};
use crate::store::Store;
use crate::transport::{Transports, DEFAULT_TRANSPORT};

/// Registry name always tried for unqualified names.
pub const LOCALHOST: &str = "localhost";

/// Ordered names to try for one requested image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameCandidates {
    /// Candidate names, most preferred first
    pub candidates: Vec<String>,
    /// Transport to parse candidates under; `None` means local store IDs
    pub transport: Option<String>,
    /// The name was unqualified and no search registries are configured
    pub search_registries_empty: bool,
}

/// Expand `name` into the candidates [`resolve_image`](crate::resolve::resolve_image) tries.
///
/// - an ID or unique ID prefix of a stored image → that image's full ID
/// - `transport:reference` with a known transport → the reference as-is
/// - a name with a registry domain → the name as-is
/// - otherwise one candidate per registry: `registry_override` (unless it is
///   `localhost`), then `localhost`, then each search registry
pub async fn resolve_name(
    name: &str,
    registry_override: Option<&str>,
    sys: &SystemContext,
    store: &dyn Store,
    transports: &Transports,
) -> Result<NameCandidates> {
    if name.is_empty() {
        return Ok(NameCandidates::default());
    }

    if let Ok(image) = store.image(name).await {
        if image.id.starts_with(name) {
            tracing::debug!(name, id = %image.id, "Name refers to a local image ID");
            return Ok(NameCandidates {
                candidates: vec![image.id],
                transport: None,
                search_registries_empty: false,
            });
        }
    }

    if let Some((transport, reference)) = transports.strip_transport(name) {
        return Ok(NameCandidates {
            candidates: vec![reference.to_string()],
            transport: Some(transport.to_string()),
            search_registries_empty: false,
        });
    }

    NamedReference::parse(name).with_context(|| format!("error parsing image name {:?}", name))?;

    if has_domain(name) {
        return Ok(NameCandidates {
            candidates: vec![name.to_string()],
            transport: Some(DEFAULT_TRANSPORT.to_string()),
            search_registries_empty: false,
        });
    }

    let search_registries: Vec<&str> = sys
        .search_registries
        .iter()
        .map(String::as_str)
        .filter(|r| !r.is_empty())
        .collect();

    let mut registries = Vec::with_capacity(search_registries.len() + 2);
    if let Some(first) = registry_override.filter(|r| !r.is_empty() && *r != LOCALHOST) {
        registries.push(first);
    }
    registries.push(LOCALHOST);
    registries.extend(search_registries.iter().copied());

    let candidates = registries
        .into_iter()
        .map(|registry| qualify(registry, name))
        .collect();

    Ok(NameCandidates {
        candidates,
        transport: Some(DEFAULT_TRANSPORT.to_string()),
        search_registries_empty: search_registries.is_empty(),
    })
}

/// `registry/name`, adding Docker Hub's `library/` for single-component names.
fn qualify(registry: &str, name: &str) -> String {
    if registry == DEFAULT_REGISTRY && !name.contains('/') {
        format!("{}/{}/{}", registry, DOCKER_HUB_PREFIX, name)
    } else {
        format!("{}/{}", registry, name)
    }
}

//! Image reference resolution under a pull policy.
//!
//! Each name candidate is tried in order. Depending on the policy a candidate
//! is satisfied from the local store, compared against the registry, or
//! pulled. When no candidate works, the per-candidate failures are combined
//! into one error.

use std::path::Path;
use std::sync::Arc;

use kiln_core::config::{PullPolicy, SystemContext};
use kiln_core::error::{CandidateFailure, KilnError, ResolutionError, Result, ResultExt};
use tokio_util::sync::CancellationToken;

use crate::pull::{inspect_created, pull_image, PullOptions};
use crate::shortnames::resolve_name;
use crate::store::{ImageRecord, Store};
use crate::transport::{ImageReference, StorageReference, Transports, DEFAULT_TRANSPORT};

/// What to resolve and how.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Image name as given by the user
    pub from_image: String,
    /// Registry tried before the search registries
    pub registry: Option<String>,
    pub pull_policy: PullPolicy,
    pub pull: PullOptions,
}

/// A locally available image and the reference it was found through.
#[derive(Debug)]
pub struct ResolvedImage {
    pub reference: Box<dyn ImageReference>,
    /// Transport the winning candidate was parsed under; `None` for store IDs
    pub transport: Option<String>,
    pub image: ImageRecord,
}

/// Outcome of one candidate; fatal errors travel in the outer `Result`.
enum Attempt {
    Found(ResolvedImage),
    Failed(KilnError),
}

/// Resolve `options.from_image` to an image in `store`, pulling as the
/// policy allows.
pub async fn resolve_image(
    cancel: &CancellationToken,
    sys: &SystemContext,
    store: &Arc<dyn Store>,
    transports: &Transports,
    options: &ResolveOptions,
) -> Result<ResolvedImage> {
    let names = resolve_name(
        &options.from_image,
        options.registry.as_deref(),
        sys,
        store.as_ref(),
        transports,
    )
    .await
    .with_context(|| format!("error parsing reference to image {:?}", options.from_image))?;

    tracing::debug!(
        image = %options.from_image,
        candidates = ?names.candidates,
        transport = ?names.transport,
        policy = %options.pull_policy,
        "Resolving image"
    );

    let mut failures = Vec::new();
    for candidate in &names.candidates {
        if cancel.is_cancelled() {
            return Err(KilnError::Cancelled);
        }

        let attempt = match names.transport.as_deref() {
            None => local_candidate(store, candidate).await,
            Some(transport) => {
                remote_candidate(cancel, sys, store, transports, transport, candidate, options)
                    .await?
            }
        };

        match attempt {
            Attempt::Found(resolved) => {
                tracing::info!(
                    image = %options.from_image,
                    candidate = %candidate,
                    id = %resolved.image.id,
                    "Resolved image"
                );
                return Ok(resolved);
            }
            Attempt::Failed(error) if error.is_cancelled() => return Err(KilnError::Cancelled),
            Attempt::Failed(error) => {
                tracing::debug!(candidate = %candidate, error = %error, "Candidate failed");
                failures.push(CandidateFailure {
                    candidate: candidate.clone(),
                    error,
                });
            }
        }
    }

    Err(synthesize_failures(
        &options.from_image,
        &sys.registries_conf_path,
        &names.candidates,
        failures,
        names.search_registries_empty,
    ))
}

async fn local_candidate(store: &Arc<dyn Store>, candidate: &str) -> Attempt {
    match store.image(candidate).await {
        Ok(image) => Attempt::Found(ResolvedImage {
            reference: Box::new(StorageReference::for_image(Arc::clone(store), &image)),
            transport: None,
            image,
        }),
        Err(e) => {
            tracing::debug!(candidate, error = %e, "Error looking up known-local image");
            Attempt::Failed(e)
        }
    }
}

async fn remote_candidate(
    cancel: &CancellationToken,
    sys: &SystemContext,
    store: &Arc<dyn Store>,
    transports: &Transports,
    transport: &str,
    candidate: &str,
    options: &ResolveOptions,
) -> Result<Attempt> {
    let src_ref = match transports.parse(transport, candidate) {
        Ok(src_ref) => src_ref,
        Err(e) => {
            let attempted = if transport == DEFAULT_TRANSPORT {
                format!("{}://{}", transport, candidate)
            } else {
                format!("{}:{}", transport, candidate)
            };
            return Ok(Attempt::Failed(
                e.context(format!("error parsing attempted image name {:?}", attempted)),
            ));
        }
    };

    if options.pull_policy == PullPolicy::Always {
        return Ok(pull_and_find(cancel, sys, store, src_ref, transport, options).await);
    }

    let dest = src_ref.docker_reference().ok_or_else(|| {
        KilnError::Other(format!(
            "error computing local image name for {:?}",
            src_ref.image_name()
        ))
    })?;

    let local = store.image(&dest).await;
    match options.pull_policy {
        PullPolicy::IfNewer => {
            if let Ok(image) = local {
                match inspect_created(cancel, sys, src_ref.as_ref()).await {
                    Err(e) if e.is_cancelled() => return Err(KilnError::Cancelled),
                    Ok(created) if created != image.created => {
                        tracing::info!(
                            image = %dest,
                            local = %image.created,
                            remote = %created,
                            "Registry image differs from local copy"
                        );
                    }
                    Ok(_) => return Ok(found(store, &image, transport)),
                    Err(e) => {
                        tracing::debug!(image = %dest, error = %e, "Registry image unavailable, using local copy");
                        return Ok(found(store, &image, transport));
                    }
                }
            }
        }
        _ => match local {
            Ok(image) => return Ok(found(store, &image, transport)),
            Err(e) if options.pull_policy == PullPolicy::Never => {
                tracing::debug!(image = %dest, error = %e, "No such image");
                let error = if e.is_image_not_found() {
                    KilnError::NoSuchImage(dest)
                } else {
                    e
                };
                return Ok(Attempt::Failed(error));
            }
            Err(_) => {}
        },
    }

    Ok(pull_and_find(cancel, sys, store, src_ref, transport, options).await)
}

fn found(store: &Arc<dyn Store>, image: &ImageRecord, transport: &str) -> Attempt {
    Attempt::Found(ResolvedImage {
        reference: Box::new(StorageReference::for_image(Arc::clone(store), image)),
        transport: Some(transport.to_string()),
        image: image.clone(),
    })
}

async fn pull_and_find(
    cancel: &CancellationToken,
    sys: &SystemContext,
    store: &Arc<dyn Store>,
    src_ref: Box<dyn ImageReference>,
    transport: &str,
    options: &ResolveOptions,
) -> Attempt {
    let pulled = match pull_image(cancel, sys, store, src_ref.as_ref(), &options.pull).await {
        Ok(pulled) => pulled,
        Err(e) => {
            tracing::debug!(reference = %src_ref.image_name(), error = %e, "Unable to pull image");
            return Attempt::Failed(e);
        }
    };

    match pulled.image().await {
        Ok(image) => Attempt::Found(ResolvedImage {
            reference: Box::new(pulled),
            transport: Some(transport.to_string()),
            image,
        }),
        Err(e) => Attempt::Failed(e.context(format!(
            "error locating image {:?} in local storage",
            pulled.image_name()
        ))),
    }
}

/// Combine the failures of every candidate into the error returned to the caller.
pub fn synthesize_failures(
    requested: &str,
    registries_conf: &Path,
    candidates: &[String],
    mut failures: Vec<CandidateFailure>,
    search_registries_empty: bool,
) -> KilnError {
    if failures.len() != candidates.len() {
        return KilnError::Internal(format!(
            "{} candidates ({:?}) vs. {} failures ({:?})",
            candidates.len(),
            candidates,
            failures.len(),
            failures
        ));
    }

    let short_name_hint = || {
        format!(
            "image name {:?} is a short name and no search registries are defined in {}",
            requested,
            registries_conf.display()
        )
    };

    match failures.len() {
        0 if search_registries_empty => KilnError::Other(format!("{}.", short_name_hint())),
        0 => KilnError::Internal(format!(
            "no pull candidates were available for {:?} for an unknown reason",
            requested
        )),
        1 => {
            let CandidateFailure { candidate, mut error } = failures.remove(0);
            if candidate != requested {
                error = error.context(format!("while pulling {:?} as {:?}", requested, candidate));
            }
            if search_registries_empty {
                error = error.context(format!("({})", short_name_hint()));
            }
            error
        }
        _ => KilnError::Resolution(ResolutionError {
            requested: requested.to_string(),
            registries_conf: registries_conf.to_path_buf(),
            failures,
        }),
    }
}

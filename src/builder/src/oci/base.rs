//! Base-image fetch and cache.
//!
//! Resolves a platform-qualified base image reference to its manifest
//! (selecting from a multi-platform index when necessary), persists each
//! compressed layer in the user-global `blob-cache/`, and hard-links the
//! cached blobs into the build's blob directory. The base's config is
//! captured for merging into the produced image config.
//!
//! Cache arrivals go through a temporary file and an atomic rename, so a
//! path present in the cache always holds complete content. Concurrent
//! writers race benignly: names are content hashes.

use std::path::Path;

use funcforge_core::{BuildError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use super::credentials;
use super::job::BuildJob;
use super::types::{ConfigFile, Descriptor, Hash};
use crate::function::Platform;

/// A fetched base image: its ordered layer descriptors and parsed config.
#[derive(Debug, Clone)]
pub struct BaseImage {
    pub layers: Vec<Descriptor>,
    pub config: ConfigFile,
}

/// Fetch the base image for `platform`, if the language builder declares
/// one. Returns `None` when building from scratch.
pub async fn pull_base(job: &BuildJob, platform: &Platform) -> Result<Option<BaseImage>> {
    let reference = job.language_builder.base(&job.function.base_image);
    if reference.is_empty() {
        return Ok(None);
    }

    let oci_ref: Reference = reference
        .parse()
        .map_err(|e| fetch_err(&reference, &e))?;
    let auth = credentials::resolve(oci_ref.registry());
    let client = Client::new(ClientConfig {
        protocol: ClientProtocol::Https,
        ..Default::default()
    });

    tracing::info!(reference = %oci_ref, platform = %platform, "pulling base image");

    let manifest = pull_platform_manifest(job, &client, &oci_ref, &auth, platform, &reference).await?;

    // The base's config carries the env, user, history and diffIDs to be
    // merged into the produced image.
    let mut config_bytes = Vec::new();
    tokio::select! {
        _ = job.ctx.canceled() => return Err(BuildError::Canceled),
        res = client.pull_blob(&oci_ref, &manifest.config, &mut config_bytes) => {
            res.map_err(|e| fetch_err(&reference, &e))?;
        }
    }
    let config: ConfigFile = serde_json::from_slice(&config_bytes)?;

    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        job.ctx.checkpoint()?;
        let descriptor = to_descriptor(layer)?;

        ensure_cached(job, &client, &oci_ref, layer, &descriptor.digest, &reference).await?;
        link_into_build(job, &descriptor.digest.hex)?;
        layers.push(descriptor);
    }

    Ok(Some(BaseImage { layers, config }))
}

/// Resolve the reference to a single-platform image manifest, selecting
/// the matching entry when the registry serves a multi-platform index.
async fn pull_platform_manifest(
    job: &BuildJob,
    client: &Client,
    oci_ref: &Reference,
    auth: &RegistryAuth,
    platform: &Platform,
    reference: &str,
) -> Result<OciImageManifest> {
    let (manifest, _digest) = tokio::select! {
        _ = job.ctx.canceled() => return Err(BuildError::Canceled),
        res = client.pull_manifest(oci_ref, auth) => res.map_err(|e| fetch_err(reference, &e))?,
    };

    match manifest {
        OciManifest::Image(manifest) => Ok(manifest),
        OciManifest::ImageIndex(index) => {
            let entry = index
                .manifests
                .iter()
                .find(|entry| platform_matches(entry.platform.as_ref(), platform))
                .ok_or_else(|| BuildError::RegistryFetch {
                    reference: reference.to_string(),
                    message: format!("no manifest for platform {}", platform),
                })?;

            let digest_ref = Reference::with_digest(
                oci_ref.registry().to_string(),
                oci_ref.repository().to_string(),
                entry.digest.clone(),
            );
            let (manifest, _digest) = tokio::select! {
                _ = job.ctx.canceled() => return Err(BuildError::Canceled),
                res = client.pull_manifest(&digest_ref, auth) => {
                    res.map_err(|e| fetch_err(reference, &e))?
                }
            };
            match manifest {
                OciManifest::Image(manifest) => Ok(manifest),
                OciManifest::ImageIndex(_) => Err(BuildError::RegistryFetch {
                    reference: reference.to_string(),
                    message: "index entry resolved to another index".to_string(),
                }),
            }
        }
    }
}

fn platform_matches(
    entry: Option<&oci_distribution::manifest::Platform>,
    want: &Platform,
) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    if entry.os != want.os || entry.architecture != want.architecture {
        return false;
    }
    want.variant.is_empty() || entry.variant.as_deref() == Some(want.variant.as_str())
}

/// Download a base layer into the cache unless already present.
async fn ensure_cached(
    job: &BuildJob,
    client: &Client,
    oci_ref: &Reference,
    layer: &OciDescriptor,
    digest: &Hash,
    reference: &str,
) -> Result<()> {
    let cache_path = job.cache_dir().join(&digest.hex);
    if cache_path.exists() {
        tracing::debug!(digest = %digest.hex, "using cached base layer");
        return Ok(());
    }

    let mut bytes = Vec::new();
    tokio::select! {
        _ = job.ctx.canceled() => return Err(BuildError::Canceled),
        res = client.pull_blob(oci_ref, layer, &mut bytes) => {
            res.map_err(|e| fetch_err(reference, &e))?;
        }
    }

    cache_layer_bytes(&job.cache_dir(), &digest.hex, &bytes)?;
    tracing::debug!(digest = %digest.hex, size = bytes.len(), "cached base layer");
    Ok(())
}

/// Commit layer bytes to the cache via tmpfile + atomic rename.
pub(crate) fn cache_layer_bytes(cache_dir: &Path, hex: &str, bytes: &[u8]) -> Result<()> {
    let temp = cache_dir.join(format!(".{}.{}", hex, std::process::id()));
    std::fs::write(&temp, bytes)
        .map_err(|e| BuildError::BlobWrite(format!("{}: {}", temp.display(), e)))?;
    std::fs::rename(&temp, cache_dir.join(hex))
        .map_err(|e| BuildError::Rename(format!("{}: {}", temp.display(), e)))?;
    Ok(())
}

/// Hard-link a cached layer into the build's blob directory, copying when
/// the link cannot be created.
pub(crate) fn link_into_build(job: &BuildJob, hex: &str) -> Result<()> {
    let source = job.cache_dir().join(hex);
    let dest = job.blobs_dir().join(hex);
    if dest.exists() {
        return Ok(()); // layer already in blobs
    }

    if let Err(link_err) = std::fs::hard_link(&source, &dest) {
        std::fs::copy(&source, &dest).map_err(|copy_err| {
            BuildError::Link(format!(
                "layer {}: link failed ({}), copy failed ({})",
                hex, link_err, copy_err
            ))
        })?;
    }
    Ok(())
}

fn to_descriptor(layer: &OciDescriptor) -> Result<Descriptor> {
    let digest: Hash = layer.digest.parse().map_err(|e: String| {
        BuildError::RegistryFetch {
            reference: layer.digest.clone(),
            message: e,
        }
    })?;
    Ok(Descriptor {
        media_type: layer.media_type.clone(),
        size: layer.size,
        digest,
        platform: None,
    })
}

fn fetch_err(reference: &str, err: &dyn std::fmt::Display) -> BuildError {
    BuildError::RegistryFetch {
        reference: reference.to_string(),
        message: err.to_string(),
    }
}

//! Moves toolchain outputs into the staging tree.

use crossdock_core::{ArchitectureMapping, ArtifactBundle, CollectError, PlatformTag, StagingTree};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// Relocates bundles into `{staging_root}/{platform}/`.
#[derive(Debug, Clone)]
pub struct ArtifactCollector {
    mapping: ArchitectureMapping,
}

impl ArtifactCollector {
    pub fn new(mapping: ArchitectureMapping) -> Self {
        Self { mapping }
    }

    /// Move every binary of `bundle` into its platform directory.
    ///
    /// Existing files with the same name are replaced. A source that is
    /// already gone while its destination exists counts as collected, so the
    /// same bundle can be collected again after a restart.
    pub async fn collect(
        &self,
        bundle: &ArtifactBundle,
        staging: &StagingTree,
    ) -> Result<PlatformTag, CollectError> {
        let platform = self
            .mapping
            .resolve(&bundle.triple)
            .map_err(|_| CollectError::UnknownArchitecture(bundle.triple.clone()))?
            .clone();

        let dest_dir = staging.platform_dir(&platform);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|source| CollectError::Io {
                path: dest_dir.clone(),
                source,
            })?;

        for src in &bundle.binary_paths {
            let file_name = src
                .file_name()
                .ok_or_else(|| CollectError::MissingArtifact(src.clone()))?;
            let dest = dest_dir.join(file_name);

            move_file(src, &dest).await?;
            debug!(src = %src.display(), dest = %dest.display(), "Staged binary");
        }

        info!(
            triple = %bundle.triple,
            %platform,
            binaries = bundle.binary_paths.len(),
            "Collected bundle"
        );
        Ok(platform)
    }
}

async fn move_file(src: &Path, dest: &Path) -> Result<(), CollectError> {
    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            if tokio::fs::try_exists(dest).await.unwrap_or(false) {
                debug!(dest = %dest.display(), "Already collected");
                Ok(())
            } else {
                Err(CollectError::MissingArtifact(src.to_path_buf()))
            }
        }
        Err(_) => {
            // Rename cannot cross filesystems; fall back to copy and remove
            tokio::fs::copy(src, dest)
                .await
                .map_err(|source| CollectError::Io {
                    path: dest.to_path_buf(),
                    source,
                })?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|source| CollectError::Io {
                    path: src.to_path_buf(),
                    source,
                })
        }
    }
}

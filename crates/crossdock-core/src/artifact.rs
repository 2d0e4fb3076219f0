//! Artifact bundles and the staging tree.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::PlatformTag;

/// Binaries produced by one toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    /// Target triple the binaries were built for.
    pub triple: String,
    /// Produced binaries, in the order the target lists them.
    pub binary_paths: Vec<PathBuf>,
}

/// Failure while moving a bundle into the staging tree.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("failed to stage {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CollectError {
    pub fn error_class(&self) -> &'static str {
        match self {
            CollectError::UnknownArchitecture(_) => "UnknownArchitecture",
            CollectError::MissingArtifact(_) => "MissingArtifact",
            CollectError::Io { .. } => "CollectIoError",
        }
    }
}

/// Platform-keyed directory tree of collected binaries.
///
/// Layout is `{root}/{platform}/{binary}`. The orchestrator creates and resets
/// it; the collector only adds files. The disk is the only record of what
/// was staged.
#[derive(Debug, Clone)]
pub struct StagingTree {
    root: PathBuf,
}

impl StagingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn platform_dir(&self, platform: &PlatformTag) -> PathBuf {
        platform.dir_in(&self.root)
    }

    /// Remove the directories of `platforms` so a run starts from empty.
    pub fn reset(&self, platforms: &[PlatformTag]) -> std::io::Result<()> {
        for platform in platforms {
            match std::fs::remove_dir_all(self.platform_dir(platform)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Requested platforms whose directory is missing or empty on disk.
    pub fn missing_platforms(&self, requested: &[PlatformTag]) -> Vec<PlatformTag> {
        requested
            .iter()
            .filter(|p| !dir_has_files(&self.platform_dir(p)))
            .cloned()
            .collect()
    }
}

fn dir_has_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| {
            entries.any(|e| e.map(|e| e.path().is_file()).unwrap_or(false))
        })
        .unwrap_or(false)
}

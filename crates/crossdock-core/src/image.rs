//! Image engine trait and publish errors.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::PlatformTag;

/// Externally supplied registry login.
#[derive(Clone, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    /// Registry host the login is for.
    pub server: Option<String>,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &"********")
            .field("server", &self.server)
            .finish()
    }
}

/// One single-platform image to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformImage {
    pub platform: PlatformTag,
    /// Build context; the platform's staging directory.
    pub context_dir: PathBuf,
    /// Dockerfile contents.
    pub dockerfile: String,
    /// Full reference to tag and push, e.g. `repo:latest-linux-arm64`.
    pub reference: String,
}

/// Classification of an image engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum EngineErrorKind {
    Unauthorized,
    Network,
    BuildFailed,
    Other,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Trait for container image backends.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Build a single-platform image and tag it locally.
    async fn build(&self, image: &PlatformImage) -> Result<(), EngineError>;

    /// Push a previously built image. Returns the pushed digest if known.
    async fn push(&self, reference: &str) -> Result<Option<String>, EngineError>;

    /// Create and push a manifest list at `reference` over `platform_refs`.
    ///
    /// The tag at `reference` must not change unless this call succeeds.
    async fn push_manifest(
        &self,
        reference: &str,
        platform_refs: &[String],
    ) -> Result<(), EngineError>;
}

/// Fatal failure while publishing the multi-architecture image.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("missing platform artifacts for {}", join_platforms(.missing))]
    MissingPlatformArtifacts { missing: Vec<PlatformTag> },

    #[error("no platforms requested")]
    NoPlatforms,

    #[error("registry rejected credentials{}: {message}", for_platform(.platform))]
    Auth {
        platform: Option<PlatformTag>,
        message: String,
    },

    #[error("platform images failed: {}", join_failures(.failures))]
    PlatformFailed {
        failures: Vec<(PlatformTag, String)>,
    },

    #[error("manifest {reference} not published: {message}")]
    Manifest { reference: String, message: String },
}

fn join_platforms(platforms: &[PlatformTag]) -> String {
    platforms
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn for_platform(platform: &Option<PlatformTag>) -> String {
    platform
        .as_ref()
        .map(|p| format!(" while pushing {}", p))
        .unwrap_or_default()
}

fn join_failures(failures: &[(PlatformTag, String)]) -> String {
    failures
        .iter()
        .map(|(p, m)| format!("{} ({})", p, m))
        .collect::<Vec<_>>()
        .join("; ")
}

impl PublishError {
    pub fn error_class(&self) -> &'static str {
        match self {
            PublishError::MissingPlatformArtifacts { .. } => "MissingPlatformArtifacts",
            PublishError::Auth { .. } => "AuthError",
            PublishError::NoPlatforms
            | PublishError::PlatformFailed { .. }
            | PublishError::Manifest { .. } => "PublishError",
        }
    }

    /// Platforms this error names.
    pub fn platforms(&self) -> Vec<PlatformTag> {
        match self {
            PublishError::MissingPlatformArtifacts { missing } => missing.clone(),
            PublishError::Auth { platform, .. } => platform.iter().cloned().collect(),
            PublishError::PlatformFailed { failures } => {
                failures.iter().map(|(p, _)| p.clone()).collect()
            }
            PublishError::NoPlatforms | PublishError::Manifest { .. } => Vec::new(),
        }
    }
}

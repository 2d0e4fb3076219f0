//! Core domain types and traits for the crossdock release pipeline.
//!
//! This crate contains:
//! - Build targets and the architecture to platform mapping
//! - Toolchain trait and release flags
//! - Artifact bundles and the staging tree
//! - Registry and image engine traits
//! - The error taxonomy shared by every stage

pub mod artifact;
pub mod error;
pub mod id;
pub mod image;
pub mod registry;
pub mod target;
pub mod toolchain;

pub use artifact::{ArtifactBundle, CollectError, StagingTree};
pub use error::{Error, Result};
pub use id::RunId;
pub use image::{
    EngineError, EngineErrorKind, ImageEngine, PlatformImage, PublishError, RegistryCredentials,
};
pub use registry::{
    ProvisionError, RegistryApi, RegistryError, RegistryErrorKind, RepositoryHandle,
    RepositoryInfo,
};
pub use target::{ArchitectureMapping, BuildTarget, PlatformTag};
pub use toolchain::{BuildError, ReleaseFlags, Toolchain};

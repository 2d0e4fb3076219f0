//! Multi-architecture image publishing for crossdock.
//!
//! Provides:
//! - The publisher that turns a staging tree into one manifest list
//! - A Docker engine backend (daemon API for pushes, CLI for builds and manifests)

pub mod docker;
pub mod publisher;

pub use crossdock_core::image::{
    EngineError, EngineErrorKind, ImageEngine, PlatformImage, PublishError, RegistryCredentials,
};
pub use docker::DockerEngine;
pub use publisher::{ImagePublisher, ImageSettings, PublishedImage, PublishedPlatform};

//! Build backends and artifact collection for crossdock.
//!
//! Provides:
//! - A cargo-compatible toolchain runner (`cross`, `cargo`, `cargo-zigbuild`)
//! - The collector that moves built binaries into the staging tree

pub mod cargo;
pub mod collect;

pub use cargo::CargoToolchain;
pub use collect::ArtifactCollector;
pub use crossdock_core::toolchain::{BuildError, ReleaseFlags, Toolchain};

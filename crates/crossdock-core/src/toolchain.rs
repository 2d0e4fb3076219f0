//! Toolchain trait and release flags.
//!
//! A toolchain turns one [`BuildTarget`] into an [`ArtifactBundle`]. Each
//! invocation is independent; implementations must not share mutable state
//! between calls so the orchestrator can run them concurrently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArtifactBundle, BuildTarget};

/// Optimization and debug-info behavior for a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFlags {
    /// Strip debug info from produced binaries.
    pub strip_debug_info: bool,
    /// Cargo profile to build with.
    pub profile: String,
}

impl Default for ReleaseFlags {
    fn default() -> Self {
        Self {
            strip_debug_info: true,
            profile: "release".to_string(),
        }
    }
}

impl ReleaseFlags {
    /// Directory cargo writes this profile's output to.
    pub fn profile_dir(&self) -> &str {
        match self.profile.as_str() {
            "dev" | "test" => "debug",
            "bench" => "release",
            other => other,
        }
    }

    /// Per-invocation environment that applies these flags.
    pub fn cargo_env(&self) -> Vec<(String, String)> {
        let prefix = format!(
            "CARGO_PROFILE_{}",
            self.profile.to_ascii_uppercase().replace('-', "_")
        );
        if self.strip_debug_info {
            vec![
                (format!("{}_STRIP", prefix), "debuginfo".to_string()),
                (format!("{}_DEBUG", prefix), "false".to_string()),
            ]
        } else {
            vec![(format!("{}_STRIP", prefix), "none".to_string())]
        }
    }
}

/// A failed toolchain invocation for one target.
#[derive(Debug, Clone, Error)]
#[error("build of {target} failed{}: {message}", exit_suffix(.exit_code))]
pub struct BuildError {
    pub target: BuildTarget,
    /// Toolchain exit code; `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    /// Last lines of the toolchain's stderr.
    pub stderr_tail: String,
    pub message: String,
}

fn exit_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with exit code {}", c))
        .unwrap_or_default()
}

impl BuildError {
    pub fn error_class(&self) -> &'static str {
        "BuildError"
    }
}

/// Trait for cross-compilation toolchains.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Name of this toolchain.
    fn name(&self) -> &'static str;

    /// Build one target and return the produced binaries.
    async fn build(
        &self,
        target: &BuildTarget,
        flags: &ReleaseFlags,
    ) -> Result<ArtifactBundle, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_dirs() {
        let mut flags = ReleaseFlags::default();
        assert_eq!(flags.profile_dir(), "release");
        flags.profile = "dev".to_string();
        assert_eq!(flags.profile_dir(), "debug");
        flags.profile = "dist".to_string();
        assert_eq!(flags.profile_dir(), "dist");
    }

    #[test]
    fn test_cargo_env_for_strip() {
        let flags = ReleaseFlags::default();
        let env = flags.cargo_env();
        assert!(env.contains(&("CARGO_PROFILE_RELEASE_STRIP".into(), "debuginfo".into())));
        assert!(env.contains(&("CARGO_PROFILE_RELEASE_DEBUG".into(), "false".into())));

        let flags = ReleaseFlags {
            strip_debug_info: false,
            profile: "fat-release".to_string(),
        };
        assert_eq!(
            flags.cargo_env(),
            vec![("CARGO_PROFILE_FAT_RELEASE_STRIP".to_string(), "none".to_string())]
        );
    }

    #[test]
    fn test_build_error_display() {
        let err = BuildError {
            target: BuildTarget::new("pkgA", "arch32"),
            exit_code: Some(101),
            stderr_tail: "error[E0425]".to_string(),
            message: "toolchain exited unsuccessfully".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "build of pkgA@arch32 failed with exit code 101: toolchain exited unsuccessfully"
        );
    }
}

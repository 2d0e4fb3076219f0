//! Cargo-compatible toolchain runner.

use async_trait::async_trait;
use crossdock_core::{ArtifactBundle, BuildError, BuildTarget, ReleaseFlags, Toolchain};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Number of stderr lines kept on failure.
const STDERR_TAIL_LINES: usize = 20;

/// Runs `{program} build` once per target as a subprocess.
///
/// Works with any program that accepts cargo's build flags, so `cross`,
/// `cargo` and `cargo-zigbuild` are all valid.
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    program: String,
    workspace_dir: PathBuf,
    target_dir: PathBuf,
}

impl CargoToolchain {
    pub fn new(
        program: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            workspace_dir: workspace_dir.into(),
            target_dir: target_dir.into(),
        }
    }

    fn resolved_target_dir(&self) -> PathBuf {
        if self.target_dir.is_absolute() {
            self.target_dir.clone()
        } else {
            self.workspace_dir.join(&self.target_dir)
        }
    }

    fn command_args(&self, target: &BuildTarget, flags: &ReleaseFlags) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--profile".to_string(),
            flags.profile.clone(),
            "--target".to_string(),
            target.triple.clone(),
            "--package".to_string(),
            target.package.clone(),
            "--target-dir".to_string(),
            self.resolved_target_dir().to_string_lossy().to_string(),
        ];
        for bin in &target.binaries {
            args.push("--bin".to_string());
            args.push(bin.clone());
        }
        args
    }

    /// Where the toolchain writes `target`'s binaries.
    pub fn output_paths(&self, target: &BuildTarget, flags: &ReleaseFlags) -> Vec<PathBuf> {
        let dir = self
            .resolved_target_dir()
            .join(&target.triple)
            .join(flags.profile_dir());
        let exe_suffix = if target.triple.contains("windows") {
            ".exe"
        } else {
            ""
        };
        target
            .binary_names()
            .into_iter()
            .map(|name| dir.join(format!("{}{}", name, exe_suffix)))
            .collect()
    }
}

/// Keep the last `lines` lines of a process's stderr.
fn stderr_tail(stderr: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[async_trait]
impl Toolchain for CargoToolchain {
    fn name(&self) -> &'static str {
        "cargo"
    }

    async fn build(
        &self,
        target: &BuildTarget,
        flags: &ReleaseFlags,
    ) -> Result<ArtifactBundle, BuildError> {
        let args = self.command_args(target, flags);
        info!(%target, program = %self.program, "Invoking toolchain");
        debug!(?args, env = ?flags.cargo_env(), "Toolchain command");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(flags.cargo_env())
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError {
                target: target.clone(),
                exit_code: None,
                stderr_tail: String::new(),
                message: format!("failed to start '{}': {}", self.program, e),
            })?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr, STDERR_TAIL_LINES);
            warn!(%target, code = ?output.status.code(), "Toolchain failed");
            return Err(BuildError {
                target: target.clone(),
                exit_code: output.status.code(),
                stderr_tail: tail,
                message: "toolchain exited unsuccessfully".to_string(),
            });
        }

        let binary_paths = self.output_paths(target, flags);
        for path in &binary_paths {
            if !is_file(path).await {
                return Err(BuildError {
                    target: target.clone(),
                    exit_code: output.status.code(),
                    stderr_tail: stderr_tail(&output.stderr, STDERR_TAIL_LINES),
                    message: format!("expected binary {} was not produced", path.display()),
                });
            }
        }

        info!(%target, binaries = binary_paths.len(), "Toolchain finished");
        Ok(ArtifactBundle {
            triple: target.triple.clone(),
            binary_paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let toolchain = CargoToolchain::new("cross", "/src", "target");
        let target = BuildTarget::new("martin", "aarch64-unknown-linux-musl")
            .with_binaries(vec!["martin".into(), "mbtiles".into()]);

        let args = toolchain.command_args(&target, &ReleaseFlags::default());
        assert_eq!(
            args,
            vec![
                "build",
                "--profile",
                "release",
                "--target",
                "aarch64-unknown-linux-musl",
                "--package",
                "martin",
                "--target-dir",
                "/src/target",
                "--bin",
                "martin",
                "--bin",
                "mbtiles",
            ]
        );
    }

    #[test]
    fn test_output_paths_are_deterministic() {
        let toolchain = CargoToolchain::new("cargo", "/src", "/tmp/out");
        let target = BuildTarget::new("pkgA", "x86_64-unknown-linux-musl");

        let paths = toolchain.output_paths(&target, &ReleaseFlags::default());
        assert_eq!(
            paths,
            vec![PathBuf::from("/tmp/out/x86_64-unknown-linux-musl/release/pkgA")]
        );

        let dev = ReleaseFlags {
            strip_debug_info: false,
            profile: "dev".to_string(),
        };
        let target = BuildTarget::new("pkgA", "x86_64-pc-windows-gnu");
        assert_eq!(
            toolchain.output_paths(&target, &dev),
            vec![PathBuf::from("/tmp/out/x86_64-pc-windows-gnu/debug/pkgA.exe")]
        );
    }

    #[test]
    fn test_stderr_tail() {
        let stderr: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes(), 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");

        assert_eq!(stderr_tail(b"only\n", 20), "only");
        assert_eq!(stderr_tail(b"", 20), "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let toolchain = CargoToolchain::new("false", dir.path(), "target");
        let target = BuildTarget::new("pkgA", "arch32");

        let err = toolchain
            .build(&target, &ReleaseFlags::default())
            .await
            .unwrap_err();

        assert_eq!(err.target, target);
        assert_eq!(err.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let toolchain = CargoToolchain::new("crossdock-no-such-toolchain", dir.path(), "target");
        let target = BuildTarget::new("pkgA", "arch64");

        let err = toolchain
            .build(&target, &ReleaseFlags::default())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code, None);
        assert!(err.message.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_success_without_binary_is_build_error() {
        let dir = tempfile::tempdir().unwrap();
        // `true` exits 0 but produces nothing
        let toolchain = CargoToolchain::new("true", dir.path(), "target");
        let target = BuildTarget::new("pkgA", "arch64");

        let err = toolchain
            .build(&target, &ReleaseFlags::default())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code, Some(0));
        assert!(err.message.contains("was not produced"));
    }

    #[tokio::test]
    async fn test_success_with_prebuilt_binary() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("target/arch64/release");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("pkgA"), b"\x7fELF").unwrap();

        let toolchain = CargoToolchain::new("true", dir.path(), "target");
        let target = BuildTarget::new("pkgA", "arch64");

        let bundle = toolchain
            .build(&target, &ReleaseFlags::default())
            .await
            .unwrap();

        assert_eq!(bundle.triple, "arch64");
        assert_eq!(bundle.binary_paths, vec![out.join("pkgA")]);
    }
}

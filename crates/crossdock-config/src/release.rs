//! Release configuration parsing.

use crate::{ConfigError, ConfigResult};
use crossdock_core::{
    ArchitectureMapping, BuildTarget, Error as CoreError, PlatformTag, ReleaseFlags,
    RepositoryHandle,
};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What the orchestrator does after a target fails to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Keep building the remaining targets, then fail the run.
    #[default]
    Continue,
    /// Cancel in-flight builds and stop scheduling new ones.
    AbortOnFirstFailure,
}

impl std::str::FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" => Ok(FailurePolicy::AbortOnFirstFailure),
            other => Err(ConfigError::InvalidValue {
                field: "on-failure".to_string(),
                message: format!("expected 'continue' or 'abort', got '{}'", other),
            }),
        }
    }
}

/// How to invoke the cross-compilation toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Cargo-compatible program (`cross`, `cargo`, `cargo-zigbuild`).
    pub program: String,
    /// Directory the toolchain runs in.
    pub workspace_dir: PathBuf,
    /// Cargo target directory, relative to `workspace_dir` unless absolute.
    pub target_dir: PathBuf,
    pub flags: ReleaseFlags,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            program: "cross".to_string(),
            workspace_dir: PathBuf::from("."),
            target_dir: PathBuf::from("target"),
            flags: ReleaseFlags::default(),
        }
    }
}

/// The image repository to provision and push to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub handle: RepositoryHandle,
    /// `MUTABLE` or `IMMUTABLE`.
    pub tag_mutability: Option<String>,
    pub scan_on_push: bool,
    /// Named credentials profile for the registry control plane.
    pub profile: Option<String>,
}

/// How per-platform images are assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub base: String,
    pub entrypoint: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            base: "debian:bookworm-slim".to_string(),
            entrypoint: None,
        }
    }
}

/// A complete release definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub name: String,
    pub staging_root: PathBuf,
    /// Image tag before variable interpolation.
    pub image_tag: String,
    /// Maximum concurrent toolchain invocations.
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub toolchain: ToolchainConfig,
    pub mapping: ArchitectureMapping,
    /// Expanded (package, architecture) pairs in declaration order.
    pub targets: Vec<BuildTarget>,
    pub repository: Option<RepositoryConfig>,
    pub image: ImageConfig,
}

/// Read and parse a release file.
pub fn load_release(path: &Path) -> ConfigResult<ReleaseConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_release(&content)
}

/// Parse a release configuration from KDL text.
pub fn parse_release(kdl: &str) -> ConfigResult<ReleaseConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut staging_root = PathBuf::from("target/staging");
    let mut image_tag = "latest".to_string();
    let mut concurrency = default_concurrency();
    let mut failure_policy = FailurePolicy::default();
    let mut toolchain = ToolchainConfig::default();
    let mut mapping = ArchitectureMapping::new();
    let mut targets: Vec<BuildTarget> = Vec::new();
    let mut repository = None;
    let mut image = ImageConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "release" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("release name".to_string()))?;
                for child in child_nodes(node) {
                    match child.name().value() {
                        "staging-root" => {
                            staging_root = PathBuf::from(require_string(child, "staging-root")?);
                        }
                        "image-tag" => {
                            image_tag = require_string(child, "image-tag")?;
                        }
                        "concurrency" => {
                            concurrency = parse_concurrency(child)?;
                        }
                        "on-failure" => {
                            failure_policy = require_string(child, "on-failure")?.parse()?;
                        }
                        _ => {}
                    }
                }
            }
            "toolchain" => {
                toolchain = parse_toolchain(node)?;
            }
            "architecture" => {
                let triple = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("architecture triple".to_string()))?;
                let platform = get_string_prop(node, "platform").ok_or_else(|| {
                    ConfigError::MissingField(format!("platform for architecture '{}'", triple))
                })?;
                let platform =
                    PlatformTag::parse(&platform).map_err(|e| ConfigError::InvalidValue {
                        field: format!("platform for architecture '{}'", triple),
                        message: e.to_string(),
                    })?;
                mapping
                    .insert(triple.clone(), platform)
                    .map_err(|e| match e {
                        CoreError::NestedPlatform { .. } => ConfigError::InvalidValue {
                            field: format!("platform for architecture '{}'", triple),
                            message: e.to_string(),
                        },
                        _ => ConfigError::Duplicate(format!("architecture '{}'", triple)),
                    })?;
            }
            "target" => {
                for target in parse_target(node)? {
                    if targets.contains(&target) {
                        return Err(ConfigError::Duplicate(format!("target '{}'", target)));
                    }
                    targets.push(target);
                }
            }
            "repository" => {
                repository = Some(parse_repository(node)?);
            }
            "image" => {
                image = parse_image(node)?;
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("release name".to_string()));
    }

    if targets.is_empty() {
        return Err(ConfigError::MissingField("at least one target".to_string()));
    }

    if mapping.is_empty() {
        return Err(ConfigError::MissingField("at least one architecture".to_string()));
    }

    // Every target must map to a platform before anything is built
    for target in &targets {
        if mapping.resolve(&target.triple).is_err() {
            return Err(ConfigError::UnknownArchitecture {
                target: target.package.clone(),
                triple: target.triple.clone(),
            });
        }
    }

    Ok(ReleaseConfig {
        name,
        staging_root,
        image_tag,
        concurrency,
        failure_policy,
        toolchain,
        mapping,
        targets,
        repository,
        image,
    })
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_concurrency(node: &KdlNode) -> ConfigResult<usize> {
    let value = get_first_integer_arg(node)
        .ok_or_else(|| ConfigError::MissingField("concurrency value".to_string()))?;
    if value < 1 {
        return Err(ConfigError::InvalidValue {
            field: "concurrency".to_string(),
            message: format!("must be at least 1, got {}", value),
        });
    }
    usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: "concurrency".to_string(),
        message: format!("{} is out of range", value),
    })
}

fn parse_toolchain(node: &KdlNode) -> ConfigResult<ToolchainConfig> {
    let mut toolchain = ToolchainConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "program" => toolchain.program = require_string(child, "program")?,
            "workspace" => toolchain.workspace_dir = PathBuf::from(require_string(child, "workspace")?),
            "target-dir" => toolchain.target_dir = PathBuf::from(require_string(child, "target-dir")?),
            "profile" => toolchain.flags.profile = require_string(child, "profile")?,
            "strip-debug-info" => {
                toolchain.flags.strip_debug_info = require_bool(child, "strip-debug-info")?
            }
            _ => {}
        }
    }

    Ok(toolchain)
}

fn parse_target(node: &KdlNode) -> ConfigResult<Vec<BuildTarget>> {
    let package = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("target package".to_string()))?;

    let arches = get_string_list_prop(node, "arch");
    let binaries = get_string_list_prop(node, "bin");

    if arches.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "arch for target '{}'",
            package
        )));
    }

    Ok(arches
        .into_iter()
        .map(|triple| BuildTarget::new(package.clone(), triple).with_binaries(binaries.clone()))
        .collect())
}

fn parse_repository(node: &KdlNode) -> ConfigResult<RepositoryConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("repository name".to_string()))?;
    let region = get_string_prop(node, "region").ok_or_else(|| {
        ConfigError::MissingField(format!("region for repository '{}'", name))
    })?;

    let mut tag_mutability = None;
    let mut scan_on_push = false;
    let mut profile = None;

    for child in child_nodes(node) {
        match child.name().value() {
            "tag-mutability" => {
                let value = require_string(child, "tag-mutability")?.to_ascii_uppercase();
                if value != "MUTABLE" && value != "IMMUTABLE" {
                    return Err(ConfigError::InvalidValue {
                        field: "tag-mutability".to_string(),
                        message: format!("expected MUTABLE or IMMUTABLE, got '{}'", value),
                    });
                }
                tag_mutability = Some(value);
            }
            "scan-on-push" => scan_on_push = require_bool(child, "scan-on-push")?,
            "profile" => profile = Some(require_string(child, "profile")?),
            _ => {}
        }
    }

    Ok(RepositoryConfig {
        handle: RepositoryHandle::new(name, region),
        tag_mutability,
        scan_on_push,
        profile,
    })
}

fn parse_image(node: &KdlNode) -> ConfigResult<ImageConfig> {
    let mut image = ImageConfig::default();

    for child in child_nodes(node) {
        match child.name().value() {
            "base" => image.base = require_string(child, "base")?,
            "entrypoint" => image.entrypoint = Some(require_string(child, "entrypoint")?),
            _ => {}
        }
    }

    Ok(image)
}

// Helper functions for extracting values from KDL nodes

fn child_nodes(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn require_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a string".to_string(),
    })
}

fn require_bool(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    get_first_bool_arg(node).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected #true or #false".to_string(),
    })
}

fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // First, collect all entries with this name (handles repeated attributes like arch="a" arch="b")
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Check children for the property name (handles block syntax)
    for child in child_nodes(node) {
        if child.name().value() == name {
            return get_all_string_args(child);
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        release "martin" {
            staging-root "out/staging"
            image-tag "${git.short_sha}"
            concurrency 2
            on-failure "abort"
        }

        toolchain {
            program "cargo-zigbuild"
            workspace "/src/martin"
            target-dir "/tmp/target"
            profile "release"
            strip-debug-info #false
        }

        architecture "aarch64-unknown-linux-musl" platform="linux/arm64"
        architecture "x86_64-unknown-linux-musl" platform="linux/amd64"

        target "martin" {
            arch "aarch64-unknown-linux-musl" "x86_64-unknown-linux-musl"
            bin "martin" "mbtiles"
        }

        repository "martin" region="us-east-1" {
            tag-mutability "immutable"
            scan-on-push #true
        }

        image {
            base "gcr.io/distroless/static"
            entrypoint "/usr/local/bin/martin"
        }
    "#;

    #[test]
    fn test_parse_full_release() {
        let config = parse_release(FULL).unwrap();

        assert_eq!(config.name, "martin");
        assert_eq!(config.staging_root, PathBuf::from("out/staging"));
        assert_eq!(config.image_tag, "${git.short_sha}");
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.failure_policy, FailurePolicy::AbortOnFirstFailure);

        assert_eq!(config.toolchain.program, "cargo-zigbuild");
        assert_eq!(config.toolchain.workspace_dir, PathBuf::from("/src/martin"));
        assert!(!config.toolchain.flags.strip_debug_info);

        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].triple, "aarch64-unknown-linux-musl");
        assert_eq!(config.targets[1].triple, "x86_64-unknown-linux-musl");
        assert_eq!(config.targets[0].binaries, vec!["martin", "mbtiles"]);

        let repo = config.repository.unwrap();
        assert_eq!(repo.handle, RepositoryHandle::new("martin", "us-east-1"));
        assert_eq!(repo.tag_mutability.as_deref(), Some("IMMUTABLE"));
        assert!(repo.scan_on_push);

        assert_eq!(config.image.base, "gcr.io/distroless/static");
        assert_eq!(config.image.entrypoint.as_deref(), Some("/usr/local/bin/martin"));
    }

    #[test]
    fn test_parse_minimal_release_uses_defaults() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
        "#;

        let config = parse_release(kdl).unwrap();
        assert_eq!(config.image_tag, "latest");
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.toolchain.program, "cross");
        assert!(config.toolchain.flags.strip_debug_info);
        assert!(config.concurrency >= 1);
        assert!(config.repository.is_none());
        assert_eq!(config.targets, vec![BuildTarget::new("pkgA", "arch64")]);
    }

    #[test]
    fn test_repeated_arch_props() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            architecture "arch32" platform="linux/amd64"
            target "pkgA" arch="arch64" arch="arch32"
        "#;

        let config = parse_release(kdl).unwrap();
        let triples: Vec<_> = config.targets.iter().map(|t| t.triple.as_str()).collect();
        assert_eq!(triples, vec!["arch64", "arch32"]);
    }

    #[test]
    fn test_unknown_architecture_is_config_error() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64" arch="arch32"
        "#;

        let result = parse_release(kdl);
        assert!(matches!(
            result,
            Err(ConfigError::UnknownArchitecture { ref triple, .. }) if triple == "arch32"
        ));
    }

    #[test]
    fn test_duplicate_architecture() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            architecture "arch64" platform="linux/amd64"
            target "pkgA" arch="arch64"
        "#;

        assert!(matches!(parse_release(kdl), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_nested_platforms_rejected() {
        let kdl = r#"
            release "demo"
            architecture "armhf" platform="linux/arm"
            architecture "armv7" platform="linux/arm/v7"
            target "pkgA" arch="armhf"
        "#;

        match parse_release(kdl) {
            Err(ConfigError::InvalidValue { field, message }) => {
                assert!(field.contains("armv7"));
                assert!(message.contains("linux/arm/v7"));
            }
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_target() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
            target "pkgA" arch="arch64"
        "#;

        assert!(matches!(parse_release(kdl), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_invalid_platform() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="arm64"
            target "pkgA" arch="arch64"
        "#;

        assert!(matches!(
            parse_release(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let kdl = r#"
            release "demo" {
                concurrency 0
            }
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
        "#;

        assert!(matches!(
            parse_release(kdl),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "concurrency"
        ));
    }

    #[test]
    fn test_bad_failure_policy() {
        let kdl = r#"
            release "demo" {
                on-failure "retry"
            }
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
        "#;

        assert!(matches!(
            parse_release(kdl),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "on-failure"
        ));
    }

    #[test]
    fn test_missing_release_name_and_targets() {
        let kdl = r#"
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
        "#;
        assert!(matches!(parse_release(kdl), Err(ConfigError::MissingField(_))));

        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
        "#;
        assert!(matches!(parse_release(kdl), Err(ConfigError::MissingField(_))));

        let kdl = r#"
            release "demo"
            target "pkgA" arch="arch64"
        "#;
        assert!(matches!(
            parse_release(kdl),
            Err(ConfigError::MissingField(ref f)) if f == "at least one architecture"
        ));
    }

    #[test]
    fn test_repository_requires_region() {
        let kdl = r#"
            release "demo"
            architecture "arch64" platform="linux/arm64"
            target "pkgA" arch="arch64"
            repository "demo"
        "#;

        assert!(matches!(parse_release(kdl), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_load_release_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crossdock.kdl");
        std::fs::write(&path, FULL).unwrap();

        let config = load_release(&path).unwrap();
        assert_eq!(config.name, "martin");

        let missing = load_release(&dir.path().join("nope.kdl"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_sample_release_file_parses() {
        let config = parse_release(include_str!("../../../crossdock.kdl")).unwrap();
        assert_eq!(config.name, "martin");
        assert_eq!(config.image_tag, "${git.short_sha}");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.mapping.platforms_for(&config.targets).unwrap().len(), 2);
        assert!(config.repository.unwrap().scan_on_push);
    }
}

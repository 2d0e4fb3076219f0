//! Build targets and the architecture to platform mapping.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// One (package, architecture) pair to cross-compile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{package}@{triple}")]
pub struct BuildTarget {
    /// Cargo package to build.
    pub package: String,
    /// Rust target triple (e.g., "aarch64-unknown-linux-musl").
    pub triple: String,
    /// Binaries the package produces. Empty means one binary named after the package.
    #[serde(default)]
    pub binaries: Vec<String>,
}

impl BuildTarget {
    pub fn new(package: impl Into<String>, triple: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            triple: triple.into(),
            binaries: Vec::new(),
        }
    }

    pub fn with_binaries(mut self, binaries: Vec<String>) -> Self {
        self.binaries = binaries;
        self
    }

    /// Names of the binaries this target is expected to produce.
    pub fn binary_names(&self) -> Vec<String> {
        if self.binaries.is_empty() {
            vec![self.package.clone()]
        } else {
            self.binaries.clone()
        }
    }
}

/// Container platform identifier such as `linux/arm64` or `linux/arm/v7`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct PlatformTag(String);

impl PlatformTag {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let well_formed = (2..=3).contains(&parts.len())
            && parts.iter().all(|p| {
                !p.is_empty()
                    && p
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            });
        if !well_formed {
            return Err(Error::InvalidInput(format!(
                "platform '{}' must look like os/arch[/variant]",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tag-safe form used in per-platform image references (`linux-arm64`).
    pub fn suffix(&self) -> String {
        self.0.replace('/', "-")
    }

    /// Directory for this platform under `root`.
    pub fn dir_in(&self, root: &Path) -> PathBuf {
        self.0.split('/').fold(root.to_path_buf(), |dir, part| dir.join(part))
    }

    /// Whether `other`'s staging directory sits inside this one's, or the
    /// other way round (`linux/arm` and `linux/arm/v7`).
    pub fn nests_with(&self, other: &PlatformTag) -> bool {
        let inside = |child: &str, parent: &str| {
            child
                .strip_prefix(parent)
                .is_some_and(|rest| rest.starts_with('/'))
        };
        inside(&self.0, &other.0) || inside(&other.0, &self.0)
    }
}

impl TryFrom<String> for PlatformTag {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PlatformTag> for String {
    fn from(tag: PlatformTag) -> Self {
        tag.0
    }
}

impl std::str::FromStr for PlatformTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Static lookup from target triple to container platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, PlatformTag>",
    into = "BTreeMap<String, PlatformTag>"
)]
pub struct ArchitectureMapping {
    entries: BTreeMap<String, PlatformTag>,
}

impl TryFrom<BTreeMap<String, PlatformTag>> for ArchitectureMapping {
    type Error = Error;

    fn try_from(entries: BTreeMap<String, PlatformTag>) -> Result<Self> {
        let mut mapping = Self::new();
        for (triple, platform) in entries {
            mapping.insert(triple, platform)?;
        }
        Ok(mapping)
    }
}

impl From<ArchitectureMapping> for BTreeMap<String, PlatformTag> {
    fn from(mapping: ArchitectureMapping) -> Self {
        mapping.entries
    }
}

impl ArchitectureMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A triple may only be mapped once, and no platform may
    /// nest inside another, so every platform directory holds only its own
    /// binaries.
    pub fn insert(&mut self, triple: impl Into<String>, platform: PlatformTag) -> Result<()> {
        let triple = triple.into();
        if self.entries.contains_key(&triple) {
            return Err(Error::InvalidInput(format!(
                "architecture '{}' is mapped more than once",
                triple
            )));
        }
        if let Some(other) = self.entries.values().find(|p| p.nests_with(&platform)) {
            let (platform, parent) = if platform.as_str().len() > other.as_str().len() {
                (platform.to_string(), other.to_string())
            } else {
                (other.to_string(), platform.to_string())
            };
            return Err(Error::NestedPlatform { platform, parent });
        }
        self.entries.insert(triple, platform);
        Ok(())
    }

    pub fn with(mut self, triple: impl Into<String>, platform: PlatformTag) -> Result<Self> {
        self.insert(triple, platform)?;
        Ok(self)
    }

    pub fn resolve(&self, triple: &str) -> Result<&PlatformTag> {
        self.entries
            .get(triple)
            .ok_or_else(|| Error::UnknownArchitecture(triple.to_string()))
    }

    /// Distinct platforms referenced by `targets`, in sorted order.
    pub fn platforms_for(&self, targets: &[BuildTarget]) -> Result<Vec<PlatformTag>> {
        let mut platforms: Vec<PlatformTag> = Vec::new();
        for target in targets {
            let platform = self.resolve(&target.triple)?;
            if !platforms.contains(platform) {
                platforms.push(platform.clone());
            }
        }
        platforms.sort();
        Ok(platforms)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform(s: &str) -> PlatformTag {
        PlatformTag::parse(s).unwrap()
    }

    #[test]
    fn test_platform_tag_parsing() {
        assert!(PlatformTag::parse("linux/arm64").is_ok());
        assert!(PlatformTag::parse("linux/arm/v7").is_ok());
        assert!(PlatformTag::parse("linux").is_err());
        assert!(PlatformTag::parse("linux//arm64").is_err());
        assert!(PlatformTag::parse("Linux/AMD64").is_err());
        assert!(PlatformTag::parse("linux/arm/v7/extra").is_err());
    }

    #[test]
    fn test_platform_suffix_and_dir() {
        let tag = platform("linux/arm/v7");
        assert_eq!(tag.suffix(), "linux-arm-v7");
        assert_eq!(
            tag.dir_in(Path::new("/stage")),
            PathBuf::from("/stage/linux/arm/v7")
        );
    }

    #[test]
    fn test_mapping_resolves_and_rejects_unknown() {
        let mapping = ArchitectureMapping::new()
            .with("aarch64-unknown-linux-musl", platform("linux/arm64"))
            .unwrap();

        assert_eq!(
            mapping.resolve("aarch64-unknown-linux-musl").unwrap(),
            &platform("linux/arm64")
        );
        assert!(matches!(
            mapping.resolve("riscv64gc-unknown-linux-gnu"),
            Err(Error::UnknownArchitecture(t)) if t == "riscv64gc-unknown-linux-gnu"
        ));
    }

    #[test]
    fn test_mapping_rejects_duplicates() {
        let mut mapping = ArchitectureMapping::new();
        mapping.insert("x86_64-unknown-linux-musl", platform("linux/amd64")).unwrap();
        let result = mapping.insert("x86_64-unknown-linux-musl", platform("linux/arm64"));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_mapping_rejects_nested_platforms() {
        let mut mapping = ArchitectureMapping::new();
        mapping.insert("armhf", platform("linux/arm")).unwrap();

        let result = mapping.insert("armv7", platform("linux/arm/v7"));
        assert!(matches!(
            result,
            Err(Error::NestedPlatform { ref platform, ref parent })
                if platform == "linux/arm/v7" && parent == "linux/arm"
        ));

        // the other insertion order is caught too
        let mut mapping = ArchitectureMapping::new();
        mapping.insert("armv7", platform("linux/arm/v7")).unwrap();
        assert!(mapping.insert("armhf", platform("linux/arm")).is_err());

        // siblings and shared platforms are fine
        mapping.insert("armv6", platform("linux/arm/v6")).unwrap();
        mapping.insert("armv7-musl", platform("linux/arm/v7")).unwrap();
        mapping.insert("arm64", platform("linux/arm64")).unwrap();
        assert_eq!(mapping.len(), 4);

        let nested = BTreeMap::from([
            ("armhf".to_string(), platform("linux/arm")),
            ("armv7".to_string(), platform("linux/arm/v7")),
        ]);
        assert!(ArchitectureMapping::try_from(nested).is_err());
    }

    #[test]
    fn test_platforms_for_dedups_and_sorts() {
        let mapping = ArchitectureMapping::new()
            .with("arch64", platform("linux/arm64"))
            .unwrap()
            .with("arch32", platform("linux/amd64"))
            .unwrap();
        let targets = vec![
            BuildTarget::new("pkgA", "arch64"),
            BuildTarget::new("pkgA", "arch32"),
            BuildTarget::new("pkgB", "arch64"),
        ];

        let platforms = mapping.platforms_for(&targets).unwrap();
        assert_eq!(platforms, vec![platform("linux/amd64"), platform("linux/arm64")]);
    }

    #[test]
    fn test_binary_names_default_to_package() {
        let target = BuildTarget::new("martin", "arch64");
        assert_eq!(target.binary_names(), vec!["martin"]);

        let target = target.with_binaries(vec!["martin".into(), "mbtiles".into()]);
        assert_eq!(target.binary_names(), vec!["martin", "mbtiles"]);
        assert_eq!(target.to_string(), "martin@arch64");
    }
}

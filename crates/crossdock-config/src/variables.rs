//! `${...}` interpolation for image tags.
//!
//! Known variables: `git.sha`, `git.short_sha`, `git.branch`, `git.tag`,
//! `env.NAME`, `run.id`, `date` (YYYY-MM-DD) and `timestamp` (unix seconds).
//! Anything else is left as written, which then fails tag validation.

use crate::{ConfigError, ConfigResult};
use crossdock_core::PlatformTag;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap());

/// Registry limit on the length of a tag.
pub const MAX_TAG_LEN: usize = 128;

/// The commit a release is cut from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitInfo {
    pub sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
}

impl GitInfo {
    /// Read HEAD of the checkout at `dir`. Values git cannot provide (no
    /// checkout, detached HEAD) come from the CI environment instead.
    pub fn discover(dir: &Path) -> Self {
        let git = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let sha = git(&["rev-parse", "HEAD"])
            .or_else(|| first_env(&["CROSSDOCK_COMMIT_SHA", "GITHUB_SHA", "CI_COMMIT_SHA"]))
            .unwrap_or_default();
        let branch = git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .filter(|b| b != "HEAD")
            .or_else(|| first_env(&["CROSSDOCK_BRANCH", "GITHUB_HEAD_REF", "CI_COMMIT_BRANCH"]));
        let tag = git(&["describe", "--tags", "--exact-match", "HEAD"])
            .or_else(|| first_env(&["CROSSDOCK_TAG", "CI_COMMIT_TAG"]))
            .or_else(|| {
                (std::env::var("GITHUB_REF_TYPE").ok()? == "tag")
                    .then(|| std::env::var("GITHUB_REF_NAME").ok())
                    .flatten()
            });

        Self { sha, branch, tag }
    }

    pub fn short_sha(&self) -> String {
        self.sha.chars().take(7).collect()
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
}

/// Values an image tag template can refer to.
#[derive(Debug, Clone, Default)]
pub struct TagVariables {
    pub git: GitInfo,
    pub run_id: String,
    /// Takes precedence over the process environment for `${env.*}`.
    env: HashMap<String, String>,
}

impl TagVariables {
    pub fn new(git: GitInfo, run_id: impl Into<String>) -> Self {
        Self {
            git,
            run_id: run_id.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name.split_once('.') {
            Some(("git", "sha")) => Some(self.git.sha.clone()),
            Some(("git", "short_sha")) => Some(self.git.short_sha()),
            Some(("git", "branch")) => self.git.branch.clone(),
            Some(("git", "tag")) => self.git.tag.clone(),
            Some(("run", "id")) => Some(self.run_id.clone()),
            Some(("env", var)) => self
                .env
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok()),
            None if name == "date" => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            None if name == "timestamp" => Some(chrono::Utc::now().timestamp().to_string()),
            _ => None,
        }
    }

    /// Replace every known `${...}`; unknown ones stay verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                self.lookup(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string()
    }

    /// Interpolate `raw` and check the result is usable both as the manifest
    /// tag and as every `{tag}-{platform}` per-platform tag.
    pub fn resolve_image_tag(&self, raw: &str, platforms: &[PlatformTag]) -> ConfigResult<String> {
        let tag = self.interpolate(raw);
        let invalid = |message: String| ConfigError::InvalidValue {
            field: "image-tag".to_string(),
            message,
        };

        if !TAG_REGEX.is_match(&tag) {
            return Err(invalid(format!(
                "'{}' (from '{}') is not a valid image tag",
                tag, raw
            )));
        }

        let longest_suffix = platforms.iter().map(|p| p.suffix().len() + 1).max().unwrap_or(0);
        let limit = MAX_TAG_LEN.saturating_sub(longest_suffix);
        if tag.len() > limit {
            return Err(invalid(format!(
                "'{}' is {} characters; per-platform tags allow at most {}",
                tag,
                tag.len(),
                limit
            )));
        }
        Ok(tag)
    }
}

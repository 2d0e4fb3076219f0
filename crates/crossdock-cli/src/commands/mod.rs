//! CLI command implementations.

pub mod provision;
pub mod run;

use anyhow::{Context, Result, bail};
use clap::{Args, ValueEnum};
use crossdock_config::{
    FailurePolicy, GitInfo, ReleaseConfig, RepositoryConfig, TagVariables, load_release,
};
use crossdock_core::{RegistryCredentials, RepositoryHandle, RunId};
use std::path::{Path, PathBuf};

/// Command line overrides for values in the release file.
#[derive(Args, Debug, Default, Clone)]
pub struct ReleaseOverrides {
    /// Directory binaries are staged in
    #[arg(long, env = "CROSSDOCK_STAGING_ROOT")]
    pub staging_root: Option<PathBuf>,

    /// Image repository name
    #[arg(long, env = "CROSSDOCK_REPOSITORY")]
    pub repository: Option<String>,

    /// Registry region
    #[arg(long, env = "CROSSDOCK_REGION")]
    pub region: Option<String>,

    /// Image tag; may use ${git.short_sha} and friends
    #[arg(long, env = "CROSSDOCK_IMAGE_TAG")]
    pub image_tag: Option<String>,

    /// Maximum concurrent builds
    #[arg(long, env = "CROSSDOCK_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// What to do when a build fails: continue or abort
    #[arg(long)]
    pub on_failure: Option<String>,
}

impl ReleaseOverrides {
    pub fn apply(&self, release: &mut ReleaseConfig) -> Result<()> {
        if let Some(root) = &self.staging_root {
            release.staging_root = root.clone();
        }
        if let Some(tag) = &self.image_tag {
            release.image_tag = tag.clone();
        }
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                bail!("--concurrency must be at least 1");
            }
            release.concurrency = concurrency;
        }
        if let Some(policy) = &self.on_failure {
            release.failure_policy = policy
                .parse::<FailurePolicy>()
                .context("Invalid --on-failure")?;
        }

        if let Some(repo) = release.repository.as_mut() {
            if let Some(name) = &self.repository {
                repo.handle.name = name.clone();
            }
            if let Some(region) = &self.region {
                repo.handle.region = region.clone();
            }
        } else {
            match (&self.repository, &self.region) {
                (Some(name), Some(region)) => {
                    release.repository = Some(RepositoryConfig {
                        handle: RepositoryHandle::new(name.clone(), region.clone()),
                        tag_mutability: None,
                        scan_on_push: false,
                        profile: None,
                    });
                }
                (Some(_), None) => {
                    bail!("--repository needs --region when the release file has no repository")
                }
                (None, Some(_)) => {
                    bail!("--region needs --repository when the release file has no repository")
                }
                (None, None) => {}
            }
        }
        Ok(())
    }
}

/// Registry login used for image pushes.
#[derive(Args, Debug, Default, Clone)]
pub struct PublishArgs {
    #[arg(long, env = "CROSSDOCK_REGISTRY_USERNAME")]
    pub registry_username: Option<String>,

    #[arg(long, env = "CROSSDOCK_REGISTRY_PASSWORD", hide_env_values = true)]
    pub registry_password: Option<String>,

    /// Registry host the login is for
    #[arg(long, env = "CROSSDOCK_REGISTRY_SERVER")]
    pub registry_server: Option<String>,
}

impl PublishArgs {
    pub fn credentials(&self) -> Result<Option<RegistryCredentials>> {
        match (&self.registry_username, &self.registry_password) {
            (Some(username), Some(password)) => Ok(Some(RegistryCredentials {
                username: username.clone(),
                password: password.clone(),
                server: self.registry_server.clone(),
            })),
            (None, None) => Ok(None),
            _ => bail!("--registry-username and --registry-password must be given together"),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Text,
    Json,
}

/// Load the release file and apply command line overrides.
pub fn load(config_path: &str, overrides: &ReleaseOverrides) -> Result<ReleaseConfig> {
    let mut release = load_release(Path::new(config_path))
        .with_context(|| format!("Failed to load release config: {}", config_path))?;
    overrides.apply(&mut release)?;
    Ok(release)
}

/// Resolve the release's image tag for `run_id`.
pub fn image_tag(release: &ReleaseConfig, run_id: RunId) -> Result<String> {
    let platforms = release.mapping.platforms_for(&release.targets)?;
    TagVariables::new(GitInfo::discover(&release.toolchain.workspace_dir), run_id.to_string())
        .resolve_image_tag(&release.image_tag, &platforms)
        .context("Failed to resolve image tag")
}

/// A run that publishes needs somewhere to publish to.
pub fn require_repository(release: &ReleaseConfig, skip_publish: bool) -> Result<()> {
    if release.repository.is_none() && !skip_publish {
        bail!(
            "No repository configured: add a repository node, pass --repository and --region, \
             or use --skip-publish"
        );
    }
    Ok(())
}

pub fn validate(config_path: &str) -> Result<()> {
    match load_release(Path::new(config_path)) {
        Ok(release) => {
            println!(
                "Configuration is valid: release '{}', {} targets, {} architectures, {} platforms",
                release.name,
                release.targets.len(),
                release.mapping.len(),
                release
                    .mapping
                    .platforms_for(&release.targets)
                    .map(|p| p.len())
                    .unwrap_or(0)
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn plan(config_path: &str, overrides: &ReleaseOverrides, format: PlanFormat) -> Result<()> {
    let release = load(config_path, overrides)?;
    let tag = image_tag(&release, RunId::new())?;
    let platforms = release.mapping.platforms_for(&release.targets)?;
    let repository = release
        .repository
        .as_ref()
        .map(|r| r.handle.name.clone())
        .unwrap_or_else(|| "<no repository>".to_string());

    let mut targets = Vec::new();
    for target in &release.targets {
        let platform = release.mapping.resolve(&target.triple)?;
        targets.push((target, platform));
    }

    match format {
        PlanFormat::Json => {
            let target_entries: Vec<serde_json::Value> = targets
                .iter()
                .map(|(target, platform)| {
                    serde_json::json!({
                        "package": target.package,
                        "triple": target.triple,
                        "platform": platform,
                        "binaries": target.binary_names(),
                    })
                })
                .collect();
            let platform_entries: Vec<serde_json::Value> = platforms
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "platform": p,
                        "reference": format!("{}:{}-{}", repository, tag, p.suffix()),
                    })
                })
                .collect();
            let plan = serde_json::json!({
                "release": release.name,
                "image": format!("{}:{}", repository, tag),
                "staging_root": release.staging_root,
                "concurrency": release.concurrency,
                "targets": target_entries,
                "platforms": platform_entries,
            });
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        PlanFormat::Text => {
            println!("Release: {}", release.name);
            println!("Image:   {}:{}", repository, tag);
            println!("Staging: {}", release.staging_root.display());
            println!("\nTargets:");
            for (target, platform) in &targets {
                println!(
                    "  {} -> {} ({})",
                    target,
                    platform,
                    target.binary_names().join(", ")
                );
            }
            println!("\nPlatform images:");
            for platform in &platforms {
                println!("  {}:{}-{}", repository, tag, platform.suffix());
            }
        }
    }
    Ok(())
}

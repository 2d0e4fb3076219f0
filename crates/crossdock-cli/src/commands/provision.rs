//! Standalone repository provisioning command.

use anyhow::{Context, Result};
use crossdock_config::RepositoryConfig;
use crossdock_registry::{EcrRegistry, RegistryProvisioner};
use std::sync::Arc;

use super::{ReleaseOverrides, load};

/// The registry control plane for a configured repository.
pub fn registry_for(repository: &RepositoryConfig) -> EcrRegistry {
    EcrRegistry::new()
        .with_profile(repository.profile.clone())
        .with_create_settings(repository.tag_mutability.clone(), repository.scan_on_push)
}

/// Ensure the configured repository exists and print its URI.
pub async fn provision(config_path: &str, overrides: &ReleaseOverrides) -> Result<()> {
    let release = load(config_path, overrides)?;
    let repository = release
        .repository
        .context("No repository configured; add a `repository` node or pass --repository and --region")?;

    let provisioner = RegistryProvisioner::new(Arc::new(registry_for(&repository)));
    let info = provisioner
        .ensure_repository(&repository.handle)
        .await
        .with_context(|| format!("Failed to provision {}", repository.handle))?;

    println!("✓ Repository ready: {}", info.uri);
    if let Some(created_at) = info.created_at {
        println!("  created {}", created_at.to_rfc3339());
    }
    Ok(())
}

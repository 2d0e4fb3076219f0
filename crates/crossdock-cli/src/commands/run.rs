//! Release run command.

use anyhow::{Context, Result};
use crossdock_builder::CargoToolchain;
use crossdock_core::RunId;
use crossdock_publisher::{DockerEngine, ImagePublisher, ImageSettings};
use crossdock_registry::{EcrRegistry, RegistryProvisioner};
use crossdock_scheduler::{
    PipelineConfig, PipelineEvent, PipelineOrchestrator, PipelineResult, StageState, TargetState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use super::provision::registry_for;
use super::{PublishArgs, ReleaseOverrides, image_tag, load, require_repository};

/// Run the release pipeline and return the process exit code.
pub async fn run_release(
    config_path: &str,
    overrides: &ReleaseOverrides,
    publish: &PublishArgs,
    skip_publish: bool,
) -> Result<i32> {
    let release = load(config_path, overrides)?;
    require_repository(&release, skip_publish)?;
    let run_id = RunId::new();
    let tag = image_tag(&release, run_id)?;

    info!(release = %release.name, %run_id, %tag, "Loaded release");
    println!("Release: {} (run {})", release.name, run_id.short());
    println!(
        "Targets: {}  concurrency: {}  tag: {}",
        release.targets.len(),
        release.concurrency,
        tag
    );

    let toolchain = CargoToolchain::new(
        release.toolchain.program.clone(),
        release.toolchain.workspace_dir.clone(),
        release.toolchain.target_dir.clone(),
    );

    let registry = release
        .repository
        .as_ref()
        .map(registry_for)
        .unwrap_or_else(EcrRegistry::new);

    let engine = DockerEngine::new()
        .context("Failed to connect to Docker")?
        .with_credentials(publish.credentials()?);
    if !skip_publish {
        engine
            .ping()
            .await
            .context("Docker daemon is not reachable")?;
    }

    let orchestrator = PipelineOrchestrator::new(
        Arc::new(toolchain),
        Arc::new(RegistryProvisioner::new(Arc::new(registry))),
        Arc::new(ImagePublisher::new(
            Arc::new(engine),
            ImageSettings {
                base: release.image.base.clone(),
                entrypoint: release.image.entrypoint.clone(),
            },
        )),
    );

    let mut config = PipelineConfig::from_release(&release, tag).with_run_id(run_id);
    config.skip_publish = skip_publish;

    println!("\n--- Starting release run ---\n");
    let (rx, mut handle) = orchestrator.execute(config);
    let printer = tokio::spawn(print_events(rx));

    let result = tokio::select! {
        joined = &mut handle => joined.context("Release run task failed")?,
        _ = tokio::signal::ctrl_c() => {
            // Dropping the run kills in-flight toolchain processes
            handle.abort();
            let _ = printer.await;
            anyhow::bail!("Interrupted; in-flight builds were cancelled");
        }
    };
    let _ = printer.await;

    print_summary(&result);
    Ok(result.exit_code())
}

async fn print_events(mut rx: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::BuildStarted { target } => {
                println!("▶ Building {}", target);
            }
            PipelineEvent::BuildFinished { target, success } => {
                if success {
                    println!("✓ Built {}", target);
                } else {
                    println!("✗ Build of {} failed", target);
                }
            }
            PipelineEvent::Collected { target, platform } => {
                println!("  staged {} into {}", target, platform);
            }
            PipelineEvent::ProvisionFinished {
                repository,
                success,
            } => {
                if success {
                    println!("✓ Repository {} ready", repository);
                } else {
                    println!("✗ Repository {} could not be provisioned", repository);
                }
            }
            PipelineEvent::PublishFinished { reference, success } => match reference {
                Some(reference) if success => println!("✓ Published {}", reference),
                _ => println!("✗ Publish failed"),
            },
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("\n--- Release completed successfully ---");
                } else {
                    println!("\n--- Release failed ---");
                }
            }
        }
    }
}

fn stage_status(state: &StageState) -> String {
    match state {
        StageState::Succeeded => "✓ succeeded".to_string(),
        StageState::Failed {
            error_class,
            message,
            ..
        } => format!("✗ {}: {}", error_class, message),
        StageState::Skipped { reason } => format!("⊘ skipped: {}", reason),
        StageState::Pending => "○ pending".to_string(),
    }
}

fn print_summary(result: &PipelineResult) {
    println!("\n--- Summary (run {}) ---", result.run_id.short());
    for (target, state) in &result.targets {
        let status = match state {
            TargetState::Collected { platform } => format!("✓ staged for {}", platform),
            TargetState::Failed {
                error_class,
                message,
            } => format!("✗ {}: {}", error_class, message),
            TargetState::Cancelled => "⊘ cancelled".to_string(),
            TargetState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            TargetState::Pending => "○ pending".to_string(),
        };
        println!("  {} - {}", target, status);
    }
    println!("  provision - {}", stage_status(&result.provision));
    println!("  publish - {}", stage_status(&result.publish));

    if let Some(image) = &result.image {
        println!("\nImage: {}", image.reference);
        for platform in &image.platforms {
            println!(
                "  {} {}{}",
                platform.platform,
                platform.reference,
                platform
                    .digest
                    .as_ref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            );
        }
    }

    let seconds = result.duration().num_milliseconds() as f64 / 1000.0;
    if result.success {
        println!("\n✓ Release succeeded in {:.1}s", seconds);
    } else {
        println!("\n✗ Release failed after {:.1}s", seconds);
        for line in result.failure_summary() {
            println!("  {}", line);
        }
    }
}

//! Pipeline orchestrator - builds, collects, provisions and publishes in order.

use chrono::{DateTime, TimeDelta, Utc};
use crossdock_builder::ArtifactCollector;
use crossdock_config::{FailurePolicy, ReleaseConfig};
use crossdock_core::{
    ArchitectureMapping, ArtifactBundle, BuildError, BuildTarget, PlatformTag, PublishError,
    ReleaseFlags, RepositoryHandle, RepositoryInfo, RunId, StagingTree, Toolchain,
};
use crossdock_publisher::{ImagePublisher, PublishedImage};
use crossdock_registry::RegistryProvisioner;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Outcome of one build target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    Pending,
    Collected { platform: PlatformTag },
    Failed { error_class: String, message: String },
    Cancelled,
    Skipped { reason: String },
}

impl TargetState {
    pub fn is_success(&self) -> bool {
        matches!(self, TargetState::Collected { .. })
    }
}

/// State of a run-wide stage (provision or publish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Succeeded,
    Failed {
        error_class: String,
        message: String,
        platforms: Vec<PlatformTag>,
    },
    Skipped { reason: String },
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageState::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StageState::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StageState::Failed { .. })
    }

    fn skipped(reason: impl Into<String>) -> Self {
        StageState::Skipped {
            reason: reason.into(),
        }
    }

    fn from_publish_error(err: &PublishError) -> Self {
        StageState::Failed {
            error_class: err.error_class().to_string(),
            message: err.to_string(),
            platforms: err.platforms(),
        }
    }
}

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BuildStarted {
        target: BuildTarget,
    },
    BuildFinished {
        target: BuildTarget,
        success: bool,
    },
    Collected {
        target: BuildTarget,
        platform: PlatformTag,
    },
    ProvisionFinished {
        repository: RepositoryHandle,
        success: bool,
    },
    PublishFinished {
        reference: Option<String>,
        success: bool,
    },
    PipelineCompleted {
        success: bool,
    },
}

/// Everything one run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub run_id: RunId,
    pub targets: Vec<BuildTarget>,
    pub mapping: ArchitectureMapping,
    pub flags: ReleaseFlags,
    pub staging_root: PathBuf,
    /// Repository to provision and push to. Only a `skip_publish` run may
    /// leave it unset.
    pub repository: Option<RepositoryHandle>,
    /// Already interpolated image tag.
    pub image_tag: String,
    /// Maximum concurrent builds.
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    /// Build and collect only.
    pub skip_publish: bool,
}

impl PipelineConfig {
    pub fn from_release(release: &ReleaseConfig, image_tag: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            targets: release.targets.clone(),
            mapping: release.mapping.clone(),
            flags: release.toolchain.flags.clone(),
            staging_root: release.staging_root.clone(),
            repository: release.repository.as_ref().map(|r| r.handle.clone()),
            image_tag: image_tag.into(),
            concurrency: release.concurrency,
            failure_policy: release.failure_policy,
            skip_publish: false,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }
}

/// Result of a pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub success: bool,
    /// Per-target outcomes in declaration order.
    pub targets: Vec<(BuildTarget, TargetState)>,
    pub provision: StageState,
    pub publish: StageState,
    pub repository: Option<RepositoryInfo>,
    pub image: Option<PublishedImage>,
    /// Run-level error that stopped the pipeline before any build.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    fn new(run_id: RunId, targets: &[BuildTarget]) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            success: false,
            targets: targets
                .iter()
                .map(|t| (t.clone(), TargetState::Pending))
                .collect(),
            provision: StageState::Pending,
            publish: StageState::Pending,
            repository: None,
            image: None,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn target_state(&self, target: &BuildTarget) -> Option<&TargetState> {
        self.targets
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, state)| state)
    }

    pub fn duration(&self) -> TimeDelta {
        self.finished_at - self.started_at
    }

    /// One line per failed target or stage, with its error class.
    pub fn failure_summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(error) = &self.error {
            lines.push(format!("run: {}", error));
        }
        for (target, state) in &self.targets {
            match state {
                TargetState::Failed {
                    error_class,
                    message,
                } => lines.push(format!("{}: {}: {}", target, error_class, message)),
                TargetState::Cancelled => lines.push(format!("{}: cancelled", target)),
                _ => {}
            }
        }
        for (stage, state) in [("provision", &self.provision), ("publish", &self.publish)] {
            if let StageState::Failed {
                error_class,
                message,
                ..
            } = state
            {
                lines.push(format!("{}: {}: {}", stage, error_class, message));
            }
        }
        lines
    }

    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

/// Orchestrates one release run.
pub struct PipelineOrchestrator {
    toolchain: Arc<dyn Toolchain>,
    provisioner: Arc<RegistryProvisioner>,
    publisher: Arc<ImagePublisher>,
}

impl PipelineOrchestrator {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        provisioner: Arc<RegistryProvisioner>,
        publisher: Arc<ImagePublisher>,
    ) -> Self {
        Self {
            toolchain,
            provisioner,
            publisher,
        }
    }

    /// Execute a run, returning a channel of events and a handle to get the final result.
    pub fn execute(
        &self,
        config: PipelineConfig,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let toolchain = self.toolchain.clone();
        let provisioner = self.provisioner.clone();
        let publisher = self.publisher.clone();

        let handle = tokio::spawn(async move {
            Self::execute_inner(toolchain, provisioner, publisher, config, tx).await
        });

        (rx, handle)
    }

    /// Execute a run to completion without reporting progress.
    pub async fn run(&self, config: PipelineConfig) -> PipelineResult {
        let (tx, _) = mpsc::channel(1);
        Self::execute_inner(
            self.toolchain.clone(),
            self.provisioner.clone(),
            self.publisher.clone(),
            config,
            tx,
        )
        .await
    }

    async fn execute_inner(
        toolchain: Arc<dyn Toolchain>,
        provisioner: Arc<RegistryProvisioner>,
        publisher: Arc<ImagePublisher>,
        config: PipelineConfig,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let mut result = PipelineResult::new(config.run_id, &config.targets);
        info!(
            run_id = %config.run_id,
            targets = config.targets.len(),
            toolchain = toolchain.name(),
            "Starting release run"
        );

        let platforms = match config.mapping.platforms_for(&config.targets) {
            Ok(platforms) => platforms,
            Err(e) => {
                error!(error = %e, "Targets reference unmapped architectures");
                for (target, state) in result.targets.iter_mut() {
                    *state = if config.mapping.resolve(&target.triple).is_err() {
                        TargetState::Failed {
                            error_class: "UnknownArchitecture".to_string(),
                            message: format!("no platform mapped for {}", target.triple),
                        }
                    } else {
                        TargetState::Skipped {
                            reason: "configuration error".to_string(),
                        }
                    };
                }
                return Self::finish(result, Some(e.to_string()), &tx).await;
            }
        };

        let staging = StagingTree::new(config.staging_root.clone());
        if let Err(e) = staging.reset(&platforms) {
            error!(root = %config.staging_root.display(), error = %e, "Cannot prepare staging tree");
            for (_, state) in result.targets.iter_mut() {
                *state = TargetState::Skipped {
                    reason: "staging tree unavailable".to_string(),
                };
            }
            let message = format!(
                "cannot prepare staging tree {}: {}",
                config.staging_root.display(),
                e
            );
            return Self::finish(result, Some(message), &tx).await;
        }

        Self::build_and_collect(&toolchain, &config, &staging, &mut result, &tx).await;

        let failed_targets = result
            .targets
            .iter()
            .filter(|(_, state)| !state.is_success())
            .count();

        if config.skip_publish {
            info!("Dry run, skipping provision and publish");
            result.provision = StageState::skipped("dry run");
            result.publish = StageState::skipped("dry run");
            return Self::finish(result, None, &tx).await;
        }
        let Some(repository) = config.repository.clone() else {
            error!("Publishing run has no repository");
            result.provision = StageState::Failed {
                error_class: "ConfigError".to_string(),
                message: "no repository configured".to_string(),
                platforms: Vec::new(),
            };
            result.publish = StageState::skipped("repository not ready");
            return Self::finish(result, None, &tx).await;
        };

        if let Err(e) = publisher.check_preconditions(&staging, &platforms) {
            warn!(error = %e, "Publish preconditions not met");
            result.provision = StageState::skipped("platform artifacts missing");
            result.publish = StageState::from_publish_error(&e);
            let _ = tx
                .send(PipelineEvent::PublishFinished {
                    reference: None,
                    success: false,
                })
                .await;
            return Self::finish(result, None, &tx).await;
        }

        if failed_targets > 0 {
            let reason = format!("{} target(s) did not build", failed_targets);
            warn!(%reason, "Skipping provision and publish");
            result.provision = StageState::skipped(reason.clone());
            result.publish = StageState::skipped(reason);
            return Self::finish(result, None, &tx).await;
        }

        let info = match provisioner.ensure_repository(&repository).await {
            Ok(info) => {
                let _ = tx
                    .send(PipelineEvent::ProvisionFinished {
                        repository: repository.clone(),
                        success: true,
                    })
                    .await;
                result.provision = StageState::Succeeded;
                info
            }
            Err(e) => {
                error!(repository = %repository, error = %e, "Provisioning failed");
                let _ = tx
                    .send(PipelineEvent::ProvisionFinished {
                        repository: repository.clone(),
                        success: false,
                    })
                    .await;
                result.provision = StageState::Failed {
                    error_class: e.error_class().to_string(),
                    message: e.to_string(),
                    platforms: Vec::new(),
                };
                result.publish = StageState::skipped("repository not ready");
                return Self::finish(result, None, &tx).await;
            }
        };
        result.repository = Some(info.clone());

        match publisher
            .publish(&staging, &info.uri, &config.image_tag, &platforms)
            .await
        {
            Ok(image) => {
                let _ = tx
                    .send(PipelineEvent::PublishFinished {
                        reference: Some(image.reference.clone()),
                        success: true,
                    })
                    .await;
                result.publish = StageState::Succeeded;
                result.image = Some(image);
            }
            Err(e) => {
                error!(error = %e, class = e.error_class(), "Publish failed");
                let _ = tx
                    .send(PipelineEvent::PublishFinished {
                        reference: None,
                        success: false,
                    })
                    .await;
                result.publish = StageState::from_publish_error(&e);
            }
        }

        Self::finish(result, None, &tx).await
    }

    /// Run every build under the concurrency limit and collect each bundle
    /// as soon as its build completes.
    async fn build_and_collect(
        toolchain: &Arc<dyn Toolchain>,
        config: &PipelineConfig,
        staging: &StagingTree,
        result: &mut PipelineResult,
        tx: &mpsc::Sender<PipelineEvent>,
    ) {
        let collector = ArtifactCollector::new(config.mapping.clone());
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let mut builds: JoinSet<(usize, Result<ArtifactBundle, BuildError>)> = JoinSet::new();

        for (index, target) in config.targets.iter().cloned().enumerate() {
            let toolchain = toolchain.clone();
            let semaphore = semaphore.clone();
            let flags = config.flags.clone();
            let tx = tx.clone();
            builds.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let _ = tx
                    .send(PipelineEvent::BuildStarted {
                        target: target.clone(),
                    })
                    .await;
                (index, toolchain.build(&target, &flags).await)
            });
        }

        let mut aborted = false;
        while let Some(joined) = builds.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    error!(error = %e, "Build task panicked");
                    continue;
                }
            };
            let Some(target) = config.targets.get(index).cloned() else {
                continue;
            };

            let state = match outcome {
                Ok(bundle) => {
                    let _ = tx
                        .send(PipelineEvent::BuildFinished {
                            target: target.clone(),
                            success: true,
                        })
                        .await;
                    match collector.collect(&bundle, staging).await {
                        Ok(platform) => {
                            let _ = tx
                                .send(PipelineEvent::Collected {
                                    target: target.clone(),
                                    platform: platform.clone(),
                                })
                                .await;
                            TargetState::Collected { platform }
                        }
                        Err(e) => {
                            error!(%target, error = %e, "Collect failed");
                            TargetState::Failed {
                                error_class: e.error_class().to_string(),
                                message: e.to_string(),
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(%target, error = %e, stderr = %e.stderr_tail, "Build failed");
                    let _ = tx
                        .send(PipelineEvent::BuildFinished {
                            target: target.clone(),
                            success: false,
                        })
                        .await;
                    TargetState::Failed {
                        error_class: e.error_class().to_string(),
                        message: e.to_string(),
                    }
                }
            };

            let failed = !state.is_success();
            result.targets[index].1 = state;

            if failed && config.failure_policy == FailurePolicy::AbortOnFirstFailure && !aborted {
                warn!(%target, remaining = builds.len(), "Aborting remaining builds");
                builds.abort_all();
                aborted = true;
            }
        }

        for (target, state) in result.targets.iter_mut() {
            if *state == TargetState::Pending {
                *state = if aborted {
                    TargetState::Cancelled
                } else {
                    warn!(%target, "Build task ended without a result");
                    TargetState::Failed {
                        error_class: "BuildError".to_string(),
                        message: "build task ended without a result".to_string(),
                    }
                };
            }
        }
    }

    async fn finish(
        mut result: PipelineResult,
        error: Option<String>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        for stage in [&mut result.provision, &mut result.publish] {
            if !stage.is_terminal() {
                *stage = StageState::skipped("run stopped before this stage");
            }
        }
        result.error = error;
        result.finished_at = Utc::now();
        result.success = result.error.is_none()
            && result.targets.iter().all(|(_, state)| state.is_success())
            && !result.provision.is_failure()
            && !result.publish.is_failure();

        if result.success {
            info!(run_id = %result.run_id, "Release run succeeded");
        } else {
            for line in result.failure_summary() {
                error!(run_id = %result.run_id, failure = %line, "Release run failed");
            }
        }

        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                success: result.success,
            })
            .await;
        result
    }
}

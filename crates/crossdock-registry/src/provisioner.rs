//! Idempotent "create repository if missing".

use crossdock_core::{
    ProvisionError, RegistryApi, RegistryError, RegistryErrorKind, RepositoryHandle,
    RepositoryInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a single `ensure_repository` call is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    Unknown,
    Checked { exists: bool },
    Ready,
}

/// Makes sure an image repository exists.
///
/// Calls for the same repository are serialized: at most one check/create is
/// in flight per repository on a given provisioner. Share one provisioner
/// (behind an `Arc`) between overlapping runs.
pub struct RegistryProvisioner {
    api: Arc<dyn RegistryApi>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    describe_attempts: u32,
    retry_delay: Duration,
}

impl RegistryProvisioner {
    pub fn new(api: Arc<dyn RegistryApi>) -> Self {
        Self {
            api,
            locks: Mutex::new(HashMap::new()),
            describe_attempts: 5,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// How often to re-describe a repository another actor just created.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.describe_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    async fn lock_for(&self, key: String) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_default().clone()
    }

    /// Ensure `handle` exists, creating it when absent.
    ///
    /// A create that loses a race against another actor is a success.
    pub async fn ensure_repository(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<RepositoryInfo, ProvisionError> {
        let lock = self.lock_for(handle.lock_key()).await;
        let _guard = lock.lock().await;

        let mut state = ProvisionState::Unknown;
        let mut found: Option<RepositoryInfo> = None;

        loop {
            debug!(repository = %handle, ?state, "Provisioning step");
            state = match state {
                ProvisionState::Unknown => match self.api.describe_repository(handle).await {
                    Ok(info) => {
                        found = Some(info);
                        ProvisionState::Checked { exists: true }
                    }
                    Err(e) if e.kind == RegistryErrorKind::NotFound => {
                        ProvisionState::Checked { exists: false }
                    }
                    Err(e) => return Err(ProvisionError::from_registry(handle, e)),
                },
                ProvisionState::Checked { exists: true } => ProvisionState::Ready,
                ProvisionState::Checked { exists: false } => {
                    match self.api.create_repository(handle).await {
                        Ok(info) => {
                            info!(repository = %handle, uri = %info.uri, "Created repository");
                            found = Some(info);
                            ProvisionState::Ready
                        }
                        Err(e) if e.kind == RegistryErrorKind::AlreadyExists => {
                            warn!(repository = %handle, "Repository created concurrently, treating as ready");
                            found = Some(self.describe_after_conflict(handle, &e).await?);
                            ProvisionState::Ready
                        }
                        Err(e) => return Err(ProvisionError::from_registry(handle, e)),
                    }
                }
                ProvisionState::Ready => break,
            };
        }

        found.ok_or_else(|| ProvisionError::Unexpected {
            repository: handle.clone(),
            message: "registry reported no repository details".to_string(),
        })
    }

    /// Describe a repository create reported as existing. Describe may lag
    /// behind the creator, so absence and network errors are retried and
    /// never turn the conflict into a failure.
    async fn describe_after_conflict(
        &self,
        handle: &RepositoryHandle,
        conflict: &RegistryError,
    ) -> Result<RepositoryInfo, ProvisionError> {
        for attempt in 1..=self.describe_attempts {
            match self.api.describe_repository(handle).await {
                Ok(info) => return Ok(info),
                Err(e)
                    if matches!(
                        e.kind,
                        RegistryErrorKind::NotFound | RegistryErrorKind::Network
                    ) =>
                {
                    debug!(repository = %handle, attempt, error = %e, "Repository not visible yet");
                    if attempt < self.describe_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => return Err(ProvisionError::from_registry(handle, e)),
            }
        }

        let uri = self
            .api
            .uri_from_conflict(handle, conflict)
            .unwrap_or_else(|| handle.name.clone());
        warn!(repository = %handle, %uri, "Describe still lags the create conflict");
        Ok(RepositoryInfo {
            handle: handle.clone(),
            uri,
            created_at: None,
        })
    }
}

//! Remote image repository types and the registry API trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names a remote image repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{name} ({region})")]
pub struct RepositoryHandle {
    pub name: String,
    pub region: String,
}

impl RepositoryHandle {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
        }
    }

    /// Key for the provisioning critical section.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.region, self.name)
    }
}

/// A repository as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub handle: RepositoryHandle,
    /// Push location, e.g. `123456789012.dkr.ecr.us-east-1.amazonaws.com/demo`.
    pub uri: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Classification of a registry API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum RegistryErrorKind {
    NotFound,
    AlreadyExists,
    AccessDenied,
    LimitExceeded,
    Unauthenticated,
    Network,
    Other,
}

/// A failed registry API call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RegistryError {
    pub kind: RegistryErrorKind,
    /// Error code reported by the registry, when there is one.
    pub code: Option<String>,
    pub message: String,
}

impl RegistryError {
    pub fn new(kind: RegistryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Trait for registry control-plane APIs.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Name of this registry backend.
    fn name(&self) -> &'static str;

    /// Look up a repository. Absence is reported as [`RegistryErrorKind::NotFound`].
    async fn describe_repository(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<RepositoryInfo, RegistryError>;

    /// Create a repository. An existing one is reported as
    /// [`RegistryErrorKind::AlreadyExists`].
    async fn create_repository(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<RepositoryInfo, RegistryError>;

    /// Push location for a repository that create reported as existing but
    /// describe cannot see yet.
    fn uri_from_conflict(
        &self,
        _handle: &RepositoryHandle,
        _conflict: &RegistryError,
    ) -> Option<String> {
        None
    }
}

/// Fatal failure while ensuring a repository exists.
#[derive(Debug, Clone, Error)]
pub enum ProvisionError {
    #[error("permission denied for repository {repository}: {message}")]
    PermissionDenied {
        repository: RepositoryHandle,
        message: String,
    },

    #[error("quota exceeded creating repository {repository}: {message}")]
    QuotaExceeded {
        repository: RepositoryHandle,
        message: String,
    },

    #[error("registry credentials rejected for {repository}: {message}")]
    Auth {
        repository: RepositoryHandle,
        message: String,
    },

    #[error("network error provisioning {repository}: {message}")]
    Network {
        repository: RepositoryHandle,
        message: String,
    },

    #[error("unexpected registry error for {repository}: {message}")]
    Unexpected {
        repository: RepositoryHandle,
        message: String,
    },
}

impl ProvisionError {
    /// Map a registry failure that is not an idempotent success.
    pub fn from_registry(repository: &RepositoryHandle, err: RegistryError) -> Self {
        let repository = repository.clone();
        let message = err.message;
        match err.kind {
            RegistryErrorKind::AccessDenied => ProvisionError::PermissionDenied {
                repository,
                message,
            },
            RegistryErrorKind::LimitExceeded => ProvisionError::QuotaExceeded {
                repository,
                message,
            },
            RegistryErrorKind::Unauthenticated => ProvisionError::Auth {
                repository,
                message,
            },
            RegistryErrorKind::Network => ProvisionError::Network {
                repository,
                message,
            },
            RegistryErrorKind::NotFound
            | RegistryErrorKind::AlreadyExists
            | RegistryErrorKind::Other => ProvisionError::Unexpected {
                repository,
                message,
            },
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            ProvisionError::Auth { .. } => "AuthError",
            _ => "ProvisionError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_error_mapping() {
        let repo = RepositoryHandle::new("demo", "us-east-1");

        let err = ProvisionError::from_registry(
            &repo,
            RegistryError::new(RegistryErrorKind::AccessDenied, "not allowed"),
        );
        assert!(matches!(err, ProvisionError::PermissionDenied { .. }));
        assert_eq!(err.error_class(), "ProvisionError");

        let err = ProvisionError::from_registry(
            &repo,
            RegistryError::new(RegistryErrorKind::Unauthenticated, "token expired"),
        );
        assert!(matches!(err, ProvisionError::Auth { .. }));
        assert_eq!(err.error_class(), "AuthError");

        let err = ProvisionError::from_registry(
            &repo,
            RegistryError::new(RegistryErrorKind::LimitExceeded, "too many repositories"),
        );
        assert!(matches!(err, ProvisionError::QuotaExceeded { .. }));
    }

    #[test]
    fn test_handle_display_and_key() {
        let repo = RepositoryHandle::new("demo", "eu-west-1");
        assert_eq!(repo.to_string(), "demo (eu-west-1)");
        assert_eq!(repo.lock_key(), "eu-west-1/demo");
    }
}

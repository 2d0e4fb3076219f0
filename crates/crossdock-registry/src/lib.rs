//! Image repository provisioning for crossdock.
//!
//! Provides:
//! - The provisioner that makes sure a repository exists before publishing
//! - An Amazon ECR backend driven through the AWS CLI

pub mod ecr;
pub mod provisioner;

pub use crossdock_core::registry::{
    ProvisionError, RegistryApi, RegistryError, RegistryErrorKind, RepositoryHandle,
    RepositoryInfo,
};
pub use ecr::EcrRegistry;
pub use provisioner::{ProvisionState, RegistryProvisioner};

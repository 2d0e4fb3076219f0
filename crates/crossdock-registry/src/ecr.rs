//! Amazon ECR backend.
//!
//! Talks to ECR through the AWS CLI so credentials, profiles and SSO sessions
//! are resolved exactly as they are for an operator's shell. Failures are
//! classified by the AWS error code the CLI reports, not by its exit status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossdock_core::{RegistryApi, RegistryError, RegistryErrorKind, RepositoryHandle, RepositoryInfo};
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

static AWS_ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"An error occurred \(([A-Za-z0-9.]+)\)").unwrap());

static AWS_REGISTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"registry with id '([0-9]{12})'").unwrap());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EcrRepository {
    repository_name: String,
    repository_uri: String,
    #[serde(default)]
    created_at: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DescribeRepositoriesResponse {
    repositories: Vec<EcrRepository>,
}

#[derive(Debug, Deserialize)]
struct CreateRepositoryResponse {
    repository: EcrRepository,
}

/// ECR control plane via `aws ecr`.
#[derive(Debug, Clone)]
pub struct EcrRegistry {
    program: String,
    profile: Option<String>,
    tag_mutability: Option<String>,
    scan_on_push: bool,
}

impl EcrRegistry {
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
            profile: None,
            tag_mutability: None,
            scan_on_push: false,
        }
    }

    /// Use a different AWS CLI executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }

    /// Settings applied when a repository has to be created.
    pub fn with_create_settings(mut self, tag_mutability: Option<String>, scan_on_push: bool) -> Self {
        self.tag_mutability = tag_mutability;
        self.scan_on_push = scan_on_push;
        self
    }

    fn describe_args(&self, handle: &RepositoryHandle) -> Vec<String> {
        let mut args = vec![
            "ecr".to_string(),
            "describe-repositories".to_string(),
            "--repository-names".to_string(),
            handle.name.clone(),
        ];
        self.push_common_args(&mut args, handle);
        args
    }

    fn create_args(&self, handle: &RepositoryHandle) -> Vec<String> {
        let mut args = vec![
            "ecr".to_string(),
            "create-repository".to_string(),
            "--repository-name".to_string(),
            handle.name.clone(),
        ];
        if let Some(mutability) = &self.tag_mutability {
            args.push("--image-tag-mutability".to_string());
            args.push(mutability.clone());
        }
        if self.scan_on_push {
            args.push("--image-scanning-configuration".to_string());
            args.push("scanOnPush=true".to_string());
        }
        self.push_common_args(&mut args, handle);
        args
    }

    fn push_common_args(&self, args: &mut Vec<String>, handle: &RepositoryHandle) {
        args.push("--region".to_string());
        args.push(handle.region.clone());
        args.push("--output".to_string());
        args.push("json".to_string());
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>, RegistryError> {
        debug!(program = %self.program, ?args, "Calling registry");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RegistryError::new(
                    RegistryErrorKind::Other,
                    format!("failed to start '{}': {}", self.program, e),
                )
            })?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify_cli_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

impl Default for EcrRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Map an AWS error code to a registry error kind.
pub fn kind_for_code(code: &str) -> RegistryErrorKind {
    match code {
        "RepositoryNotFoundException" => RegistryErrorKind::NotFound,
        "RepositoryAlreadyExistsException" => RegistryErrorKind::AlreadyExists,
        "AccessDeniedException" | "AccessDenied" | "UnauthorizedOperation" => {
            RegistryErrorKind::AccessDenied
        }
        "LimitExceededException" | "TooManyTagsException" => RegistryErrorKind::LimitExceeded,
        "ExpiredTokenException"
        | "ExpiredToken"
        | "UnrecognizedClientException"
        | "InvalidClientTokenId"
        | "InvalidSignatureException" => RegistryErrorKind::Unauthenticated,
        "RequestTimeout" | "RequestTimeoutException" | "ServiceUnavailableException"
        | "ThrottlingException" => RegistryErrorKind::Network,
        _ => RegistryErrorKind::Other,
    }
}

fn classify_cli_error(stderr: &str) -> RegistryError {
    let message = stderr.trim().to_string();

    if let Some(caps) = AWS_ERROR_CODE.captures(stderr) {
        let code = caps[1].to_string();
        return RegistryError::new(kind_for_code(&code), message).with_code(code);
    }

    // Failures raised by the CLI before any API call carry no code
    let kind = if stderr.contains("Could not connect to the endpoint URL")
        || stderr.contains("Connect timeout")
    {
        RegistryErrorKind::Network
    } else if stderr.contains("Unable to locate credentials")
        || stderr.contains("Error when retrieving token from sso")
        || stderr.contains("The SSO session associated with this profile has expired")
    {
        RegistryErrorKind::Unauthenticated
    } else {
        RegistryErrorKind::Other
    };
    RegistryError::new(kind, message)
}

fn parse_created_at(value: Option<serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }
        _ => None,
    }
}

fn to_info(handle: &RepositoryHandle, repo: EcrRepository) -> RepositoryInfo {
    RepositoryInfo {
        handle: RepositoryHandle::new(repo.repository_name, handle.region.clone()),
        uri: repo.repository_uri,
        created_at: parse_created_at(repo.created_at),
    }
}

fn malformed(e: serde_json::Error) -> RegistryError {
    RegistryError::new(
        RegistryErrorKind::Other,
        format!("unexpected registry response: {}", e),
    )
}

#[async_trait]
impl RegistryApi for EcrRegistry {
    fn name(&self) -> &'static str {
        "ecr"
    }

    async fn describe_repository(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<RepositoryInfo, RegistryError> {
        let stdout = self.run(&self.describe_args(handle)).await?;
        let response: DescribeRepositoriesResponse =
            serde_json::from_slice(&stdout).map_err(malformed)?;

        response
            .repositories
            .into_iter()
            .find(|r| r.repository_name == handle.name)
            .map(|r| to_info(handle, r))
            .ok_or_else(|| {
                RegistryError::new(
                    RegistryErrorKind::NotFound,
                    format!("repository {} not listed", handle.name),
                )
            })
    }

    async fn create_repository(
        &self,
        handle: &RepositoryHandle,
    ) -> Result<RepositoryInfo, RegistryError> {
        let stdout = self.run(&self.create_args(handle)).await?;
        let response: CreateRepositoryResponse =
            serde_json::from_slice(&stdout).map_err(malformed)?;
        Ok(to_info(handle, response.repository))
    }

    fn uri_from_conflict(
        &self,
        handle: &RepositoryHandle,
        conflict: &RegistryError,
    ) -> Option<String> {
        let caps = AWS_REGISTRY_ID.captures(&conflict.message)?;
        Some(format!(
            "{}.dkr.ecr.{}.amazonaws.com/{}",
            &caps[1], handle.region, handle.name
        ))
    }
}

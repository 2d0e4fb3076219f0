//! Docker image engine.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::image::PushImageOptions;
use crossdock_core::image::*;
use futures::StreamExt;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Builds with the docker CLI, pushes through the daemon API, and assembles
/// manifest lists with `docker manifest`.
///
/// Pushes use the supplied credentials. The CLI steps rely on the operator's
/// existing `docker login` for the registry.
pub struct DockerEngine {
    docker: Docker,
    cli: String,
    credentials: Option<RegistryCredentials>,
}

impl DockerEngine {
    /// Create a new DockerEngine connecting to the local Docker daemon.
    pub fn new() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            cli: "docker".to_string(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::new(EngineErrorKind::Network, e.to_string()))
    }

    fn docker_credentials(&self) -> Option<DockerCredentials> {
        self.credentials.as_ref().map(|c| DockerCredentials {
            username: Some(c.username.clone()),
            password: Some(c.password.clone()),
            serveraddress: c.server.clone(),
            ..Default::default()
        })
    }

    async fn run_cli(
        &self,
        args: &[String],
        stdin: Option<&str>,
        failure_kind: EngineErrorKind,
    ) -> Result<(), EngineError> {
        debug!(cli = %self.cli, ?args, "Running docker CLI");
        let mut child = Command::new(&self.cli)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::new(
                    EngineErrorKind::Other,
                    format!("failed to start '{}': {}", self.cli, e),
                )
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))?;
            // Close stdin so the CLI sees EOF
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| EngineError::new(EngineErrorKind::Other, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let kind = match classify_message(&stderr) {
            EngineErrorKind::Other => failure_kind,
            kind => kind,
        };
        Err(EngineError::new(kind, stderr))
    }
}

/// Split `repo[:tag]` into repository and tag. A colon inside the registry
/// host (`host:5000/repo`) is not a tag separator.
pub fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (
            &reference[..name_start + i],
            &reference[name_start + i + 1..],
        ),
        None => (reference, "latest"),
    }
}

/// Classify a registry or daemon error message.
pub fn classify_message(message: &str) -> EngineErrorKind {
    let lower = message.to_ascii_lowercase();
    let auth_markers = [
        "unauthorized",
        "denied",
        "no basic auth credentials",
        "authentication required",
        "authorization token has expired",
    ];
    let network_markers = [
        "i/o timeout",
        "connection refused",
        "connection reset",
        "no such host",
        "tls handshake timeout",
        "timed out",
    ];

    if auth_markers.iter().any(|m| lower.contains(m)) {
        EngineErrorKind::Unauthorized
    } else if network_markers.iter().any(|m| lower.contains(m)) {
        EngineErrorKind::Network
    } else {
        EngineErrorKind::Other
    }
}

fn classify_bollard(err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error as BollardError;

    match err {
        BollardError::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => EngineError::new(EngineErrorKind::Unauthorized, message),
        BollardError::DockerResponseServerError { message, .. } => {
            EngineError::new(classify_message(&message), message)
        }
        BollardError::RequestTimeoutError => {
            EngineError::new(EngineErrorKind::Network, "request to docker daemon timed out")
        }
        other => {
            let message = other.to_string();
            EngineError::new(classify_message(&message), message)
        }
    }
}

fn digest_from_status(status: &str) -> Option<String> {
    let rest = &status[status.find("digest: ")? + "digest: ".len()..];
    rest.split_whitespace().next().map(|d| d.to_string())
}

#[async_trait]
impl ImageEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, image: &PlatformImage) -> Result<(), EngineError> {
        info!(platform = %image.platform, reference = %image.reference, "Building image");
        let args = vec![
            "build".to_string(),
            "--platform".to_string(),
            image.platform.to_string(),
            "--tag".to_string(),
            image.reference.clone(),
            "--file".to_string(),
            "-".to_string(),
            image.context_dir.to_string_lossy().to_string(),
        ];
        self.run_cli(&args, Some(&image.dockerfile), EngineErrorKind::BuildFailed)
            .await
    }

    async fn push(&self, reference: &str) -> Result<Option<String>, EngineError> {
        let (repository, tag) = split_reference(reference);
        info!(%repository, %tag, "Pushing image");

        let options = PushImageOptions { tag };
        let mut stream = self
            .docker
            .push_image(repository, Some(options), self.docker_credentials());

        let mut digest = None;
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        warn!(%reference, %error, "Push rejected");
                        return Err(EngineError::new(classify_message(&error), error));
                    }
                    if let Some(status) = info.status {
                        debug!(status = %status, "Push progress");
                        if let Some(d) = digest_from_status(&status) {
                            digest = Some(d);
                        }
                    }
                }
                Err(e) => return Err(classify_bollard(e)),
            }
        }

        Ok(digest)
    }

    async fn push_manifest(
        &self,
        reference: &str,
        platform_refs: &[String],
    ) -> Result<(), EngineError> {
        info!(%reference, platforms = platform_refs.len(), "Pushing manifest list");

        let mut create = vec![
            "manifest".to_string(),
            "create".to_string(),
            "--amend".to_string(),
            reference.to_string(),
        ];
        create.extend(platform_refs.iter().cloned());
        self.run_cli(&create, None, EngineErrorKind::Other).await?;

        let push = vec![
            "manifest".to_string(),
            "push".to_string(),
            "--purge".to_string(),
            reference.to_string(),
        ];
        self.run_cli(&push, None, EngineErrorKind::Other).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("demo:latest"), ("demo", "latest"));
        assert_eq!(split_reference("demo"), ("demo", "latest"));
        assert_eq!(
            split_reference("123.dkr.ecr.us-east-1.amazonaws.com/demo:v1-linux-arm64"),
            ("123.dkr.ecr.us-east-1.amazonaws.com/demo", "v1-linux-arm64")
        );
        assert_eq!(
            split_reference("localhost:5000/team/demo"),
            ("localhost:5000/team/demo", "latest")
        );
        assert_eq!(
            split_reference("localhost:5000/demo:rc"),
            ("localhost:5000/demo", "rc")
        );
    }

    #[test]
    fn test_classify_auth_messages() {
        for msg in [
            "unauthorized: authentication required",
            "denied: requested access to the resource is denied",
            "no basic auth credentials",
            "Your authorization token has expired. Reauthenticate and try again.",
        ] {
            assert_eq!(classify_message(msg), EngineErrorKind::Unauthorized, "{}", msg);
        }
    }

    #[test]
    fn test_classify_network_and_other() {
        assert_eq!(
            classify_message("dial tcp: lookup registry.example: no such host"),
            EngineErrorKind::Network
        );
        assert_eq!(
            classify_message("net/http: TLS handshake timeout"),
            EngineErrorKind::Network
        );
        assert_eq!(
            classify_message("manifest blob unknown"),
            EngineErrorKind::Other
        );
    }

    #[test]
    fn test_classify_bollard_status() {
        let err = classify_bollard(bollard::errors::Error::DockerResponseServerError {
            status_code: 401,
            message: "nope".to_string(),
        });
        assert_eq!(err.kind, EngineErrorKind::Unauthorized);

        let err = classify_bollard(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "connection reset by peer".to_string(),
        });
        assert_eq!(err.kind, EngineErrorKind::Network);
    }

    #[test]
    fn test_digest_from_status() {
        assert_eq!(
            digest_from_status("latest-linux-arm64: digest: sha256:abc123 size: 528"),
            Some("sha256:abc123".to_string())
        );
        assert_eq!(digest_from_status("Pushed"), None);
    }

    #[test]
    fn test_credentials_forwarded() {
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        let engine = DockerEngine::with_client(docker).with_credentials(Some(RegistryCredentials {
            username: "AWS".to_string(),
            password: "token".to_string(),
            server: Some("123.dkr.ecr.us-east-1.amazonaws.com".to_string()),
        }));

        let creds = engine.docker_credentials().unwrap();
        assert_eq!(creds.username.as_deref(), Some("AWS"));
        assert_eq!(creds.password.as_deref(), Some("token"));
        assert_eq!(
            creds.serveraddress.as_deref(),
            Some("123.dkr.ecr.us-east-1.amazonaws.com")
        );
    }
}

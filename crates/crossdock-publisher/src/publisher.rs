//! Multi-architecture image publisher.

use crossdock_core::{
    EngineErrorKind, ImageEngine, PlatformImage, PlatformTag, PublishError, StagingTree,
};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What goes into each per-platform image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSettings {
    /// Base image for every platform.
    pub base: String,
    /// Optional absolute entrypoint path inside the image.
    pub entrypoint: Option<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            base: "debian:bookworm-slim".to_string(),
            entrypoint: None,
        }
    }
}

/// One platform image that made it into the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPlatform {
    pub platform: PlatformTag,
    pub reference: String,
    pub digest: Option<String>,
}

/// A published manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    /// The manifest list reference, `{repo}:{tag}`.
    pub reference: String,
    pub platforms: Vec<PublishedPlatform>,
}

/// Turns a staging tree into one multi-architecture image.
pub struct ImagePublisher {
    engine: Arc<dyn ImageEngine>,
    settings: ImageSettings,
}

impl ImagePublisher {
    pub fn new(engine: Arc<dyn ImageEngine>, settings: ImageSettings) -> Self {
        Self { engine, settings }
    }

    /// Fail unless at least one platform is requested and every requested
    /// platform has a populated directory.
    pub fn check_preconditions(
        &self,
        staging: &StagingTree,
        platforms: &[PlatformTag],
    ) -> Result<(), PublishError> {
        if platforms.is_empty() {
            return Err(PublishError::NoPlatforms);
        }
        let missing = staging.missing_platforms(platforms);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PublishError::MissingPlatformArtifacts { missing })
        }
    }

    pub fn render_dockerfile(&self) -> String {
        let mut dockerfile = format!("FROM {}\nCOPY . /usr/local/bin/\n", self.settings.base);
        if let Some(entrypoint) = &self.settings.entrypoint {
            dockerfile.push_str(&format!("ENTRYPOINT [\"{}\"]\n", entrypoint));
        }
        dockerfile
    }

    /// Build and push one image per platform, then point `{repo}:{tag}` at
    /// all of them.
    ///
    /// The manifest is only written after every platform pushed; on any
    /// failure the tag is left as it was.
    pub async fn publish(
        &self,
        staging: &StagingTree,
        repository_uri: &str,
        image_tag: &str,
        platforms: &[PlatformTag],
    ) -> Result<PublishedImage, PublishError> {
        self.check_preconditions(staging, platforms)?;

        let dockerfile = self.render_dockerfile();
        let images: Vec<PlatformImage> = platforms
            .iter()
            .map(|platform| PlatformImage {
                platform: platform.clone(),
                context_dir: staging.platform_dir(platform),
                dockerfile: dockerfile.clone(),
                reference: format!("{}:{}-{}", repository_uri, image_tag, platform.suffix()),
            })
            .collect();

        info!(
            repository = %repository_uri,
            tag = %image_tag,
            platforms = images.len(),
            engine = self.engine.name(),
            "Publishing image"
        );

        let results = join_all(images.iter().map(|image| self.publish_platform(image))).await;

        let mut pushed = Vec::new();
        let mut failures = Vec::new();
        let mut auth_failure = None;
        for (image, result) in images.iter().zip(results) {
            match result {
                Ok(digest) => pushed.push(PublishedPlatform {
                    platform: image.platform.clone(),
                    reference: image.reference.clone(),
                    digest,
                }),
                Err(e) => {
                    error!(platform = %image.platform, error = %e, "Platform image failed");
                    if e.kind == EngineErrorKind::Unauthorized && auth_failure.is_none() {
                        auth_failure = Some(PublishError::Auth {
                            platform: Some(image.platform.clone()),
                            message: e.message.clone(),
                        });
                    }
                    failures.push((image.platform.clone(), e.to_string()));
                }
            }
        }

        if let Some(err) = auth_failure {
            return Err(err);
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), "Manifest not created");
            return Err(PublishError::PlatformFailed { failures });
        }

        let reference = format!("{}:{}", repository_uri, image_tag);
        let platform_refs: Vec<String> = pushed.iter().map(|p| p.reference.clone()).collect();
        self.engine
            .push_manifest(&reference, &platform_refs)
            .await
            .map_err(|e| match e.kind {
                EngineErrorKind::Unauthorized => PublishError::Auth {
                    platform: None,
                    message: e.message,
                },
                _ => PublishError::Manifest {
                    reference: reference.clone(),
                    message: e.message,
                },
            })?;

        info!(%reference, platforms = pushed.len(), "Published manifest list");
        Ok(PublishedImage {
            reference,
            platforms: pushed,
        })
    }

    async fn publish_platform(
        &self,
        image: &PlatformImage,
    ) -> Result<Option<String>, crossdock_core::EngineError> {
        self.engine.build(image).await?;
        self.engine.push(&image.reference).await
    }
}

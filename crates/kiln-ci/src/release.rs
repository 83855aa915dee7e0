//! Release bundle assembly and publishing.
//!
//! A [`ReleaseBundle`] only exists for version-tag triggers. Publishing
//! uploads every wheel as a release asset and points both the ref tag and
//! `latest` at the containerize node's image digest. Individual failures are
//! recorded and the remaining operations still run; the release succeeds
//! only if every operation did.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PublishError;
use crate::job::{ArtifactSet, ImageRef, JobName, Platform, WheelArtifact};
use crate::runner::run_captured;
use crate::trigger::TriggerEvent;

/// Floating registry tag moved on every release.
pub const LATEST_TAG: &str = "latest";

/// Platforms every release must carry wheels for.
pub const RELEASE_PLATFORMS: [Platform; 2] = [Platform::Linux, Platform::Windows];

/// Artifacts gathered for one version tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBundle {
    pub tag: String,
    pub commit_sha: String,
    pub wheels: BTreeMap<Platform, Vec<WheelArtifact>>,
    /// Image published by the containerize node, pinned to its digest.
    pub image: ImageRef,
}

impl ReleaseBundle {
    /// Gather the bundle from the outputs of the release node's dependencies.
    pub fn assemble(
        trigger: &TriggerEvent,
        upstream: &BTreeMap<JobName, Arc<ArtifactSet>>,
    ) -> Result<Self, PublishError> {
        if !trigger.is_version_tag() {
            return Err(PublishError::NotReleasable(trigger.git_ref.clone()));
        }

        let mut wheels: BTreeMap<Platform, Vec<WheelArtifact>> = BTreeMap::new();
        for artifacts in upstream.values() {
            for wheel in &artifacts.wheels {
                wheels.entry(wheel.platform).or_default().push(wheel.clone());
            }
        }
        for platform in RELEASE_PLATFORMS {
            if wheels.get(&platform).map_or(true, Vec::is_empty) {
                return Err(PublishError::MissingWheels(platform));
            }
        }

        let image = upstream
            .get(&JobName::Containerize)
            .and_then(|artifacts| artifacts.image.clone())
            .filter(|image| image.digest.is_some())
            .ok_or(PublishError::MissingImage)?;

        Ok(Self {
            tag: trigger.ref_name().to_string(),
            commit_sha: trigger.commit_sha.clone(),
            wheels,
            image,
        })
    }

    /// Every wheel, platform by platform.
    pub fn assets(&self) -> impl Iterator<Item = &WheelArtifact> {
        self.wheels.values().flatten()
    }

    /// Registry tags the image must carry.
    pub fn image_tags(&self) -> [&str; 2] {
        [self.tag.as_str(), LATEST_TAG]
    }
}

/// Downloadable-asset boundary (release pages).
#[async_trait]
pub trait AssetHost: Send + Sync {
    /// Create the release for `tag` unless it already exists.
    async fn ensure_release(&self, tag: &str, commit_sha: &str) -> Result<(), PublishError>;

    /// Upload one asset, replacing any asset of the same name.
    async fn upload_asset(&self, tag: &str, asset: &WheelArtifact) -> Result<(), PublishError>;
}

/// Container registry boundary.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Point `<repository>:<tag>` at the digest of `source` and return the
    /// reference as the registry now resolves it.
    async fn tag_image(&self, source: &ImageRef, tag: &str) -> Result<ImageRef, PublishError>;
}

/// One failed publish operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFailure {
    /// Asset file name, `release:<tag>` or `image:<tag>`.
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub tag: String,
    pub attempted: usize,
    pub uploaded: Vec<String>,
    pub image_tags: Vec<ImageRef>,
    pub failures: Vec<PublishFailure>,
}

impl PublishReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<Self, PublishError> {
        if self.success() {
            Ok(self)
        } else {
            Err(PublishError::PartialFailure {
                tag: self.tag,
                failed: self.failures.len(),
                attempted: self.attempted,
            })
        }
    }

    fn record_failure(&mut self, target: String, error: &PublishError) {
        kiln_core::obs::emit_publish_failed(&self.tag, &target, error);
        self.failures.push(PublishFailure {
            target,
            error: error.to_string(),
        });
    }
}

/// Publishes a [`ReleaseBundle`] to an asset host and a container registry.
pub struct ReleasePublisher {
    host: Arc<dyn AssetHost>,
    registry: Arc<dyn ContainerRegistry>,
}

impl ReleasePublisher {
    pub fn new(host: Arc<dyn AssetHost>, registry: Arc<dyn ContainerRegistry>) -> Self {
        Self { host, registry }
    }

    /// Publish everything in `bundle`. Never stops at the first failure.
    pub async fn publish(&self, bundle: &ReleaseBundle) -> PublishReport {
        let mut report = PublishReport {
            tag: bundle.tag.clone(),
            attempted: 0,
            uploaded: Vec::new(),
            image_tags: Vec::new(),
            failures: Vec::new(),
        };

        report.attempted += 1;
        match self.host.ensure_release(&bundle.tag, &bundle.commit_sha).await {
            Ok(()) => {
                let assets: Vec<&WheelArtifact> = bundle.assets().collect();
                report.attempted += assets.len();
                let uploads = assets
                    .iter()
                    .map(|asset| self.host.upload_asset(&bundle.tag, asset));
                for (asset, result) in assets.iter().zip(join_all(uploads).await) {
                    match result {
                        Ok(()) => {
                            kiln_core::obs::emit_asset_published(&bundle.tag, &asset.file_name);
                            report.uploaded.push(asset.file_name.clone());
                        }
                        Err(error) => report.record_failure(asset.file_name.clone(), &error),
                    }
                }
            }
            Err(error) => report.record_failure(format!("release:{}", bundle.tag), &error),
        }

        for tag in bundle.image_tags() {
            report.attempted += 1;
            let target = format!("image:{tag}");
            match self.tag_image(&bundle.image, tag).await {
                Ok(image) => {
                    kiln_core::obs::emit_asset_published(&bundle.tag, &image.to_string());
                    report.image_tags.push(image);
                }
                Err(error) => report.record_failure(target, &error),
            }
        }

        info!(
            tag = %bundle.tag,
            attempted = report.attempted,
            failed = report.failures.len(),
            "release published"
        );
        report
    }

    async fn tag_image(&self, source: &ImageRef, tag: &str) -> Result<ImageRef, PublishError> {
        let tagged = self.registry.tag_image(source, tag).await?;
        if tagged.digest != source.digest {
            return Err(PublishError::DigestMismatch {
                tag: tag.to_string(),
                expected: source.digest.clone().unwrap_or_default(),
                actual: tagged.digest.unwrap_or_default(),
            });
        }
        Ok(tagged)
    }
}

/// Release assets through the `gh` CLI.
pub struct GhReleaseHost {
    workdir: PathBuf,
    timeout_secs: u64,
}

impl GhReleaseHost {
    pub fn new(workdir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            workdir: workdir.into(),
            timeout_secs,
        }
    }

    async fn gh(&self, args: &[&str]) -> Result<(i32, String), String> {
        let mut command = vec!["gh".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        let (code, _stdout, stderr) = run_captured("gh", &command, &self.workdir, self.timeout_secs)
            .await
            .map_err(|e| e.to_string())?;
        Ok((code, stderr))
    }
}

#[async_trait]
impl AssetHost for GhReleaseHost {
    async fn ensure_release(&self, tag: &str, commit_sha: &str) -> Result<(), PublishError> {
        let setup = |reason: String| PublishError::ReleaseSetup {
            tag: tag.to_string(),
            reason,
        };

        let (code, _) = self.gh(&["release", "view", tag]).await.map_err(setup)?;
        if code == 0 {
            return Ok(());
        }

        let (code, stderr) = self
            .gh(&[
                "release",
                "create",
                tag,
                "--target",
                commit_sha,
                "--title",
                tag,
                "--generate-notes",
            ])
            .await
            .map_err(setup)?;
        if code != 0 {
            return Err(setup(stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn upload_asset(&self, tag: &str, asset: &WheelArtifact) -> Result<(), PublishError> {
        let path = asset.path.to_string_lossy();
        let upload = |reason: String| PublishError::Upload {
            asset: asset.file_name.clone(),
            reason,
        };
        let (code, stderr) = self
            .gh(&["release", "upload", tag, path.as_ref(), "--clobber"])
            .await
            .map_err(upload)?;
        if code != 0 {
            return Err(upload(stderr.trim().to_string()));
        }
        Ok(())
    }
}

/// Registry tagging through `docker buildx imagetools`.
pub struct DockerRegistry {
    workdir: PathBuf,
    timeout_secs: u64,
}

impl DockerRegistry {
    pub fn new(workdir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            workdir: workdir.into(),
            timeout_secs,
        }
    }

    async fn imagetools(&self, reference: &str, args: &[String]) -> Result<String, PublishError> {
        let registry = |reason: String| PublishError::Registry {
            reference: reference.to_string(),
            reason,
        };
        let mut command = vec![
            "docker".to_string(),
            "buildx".to_string(),
            "imagetools".to_string(),
        ];
        command.extend_from_slice(args);
        let (code, stdout, stderr) =
            run_captured("imagetools", &command, &self.workdir, self.timeout_secs)
                .await
                .map_err(|e| registry(e.to_string()))?;
        if code != 0 {
            return Err(registry(stderr.trim().to_string()));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl ContainerRegistry for DockerRegistry {
    async fn tag_image(&self, source: &ImageRef, tag: &str) -> Result<ImageRef, PublishError> {
        let target = ImageRef::new(&source.repository, tag);
        let reference = target.tagged();
        if source.digest.is_none() {
            return Err(PublishError::Registry {
                reference,
                reason: "source image has no digest".to_string(),
            });
        }

        self.imagetools(
            &reference,
            &[
                "create".to_string(),
                "--tag".to_string(),
                reference.clone(),
                source.pinned(),
            ],
        )
        .await?;

        let digest = self
            .imagetools(
                &reference,
                &[
                    "inspect".to_string(),
                    reference.clone(),
                    "--format".to_string(),
                    "{{.Manifest.Digest}}".to_string(),
                ],
            )
            .await?;
        Ok(target.with_digest(digest.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryAssetHost, MemoryRegistry};

    fn wheel(name: &str, platform: Platform) -> WheelArtifact {
        WheelArtifact {
            file_name: name.to_string(),
            path: PathBuf::from("wheelhouse").join(name),
            platform,
            size: 1,
            sha256: "00".repeat(32),
        }
    }

    fn upstream(with_image: bool) -> BTreeMap<JobName, Arc<ArtifactSet>> {
        let mut upstream = BTreeMap::new();
        upstream.insert(JobName::Test, Arc::new(ArtifactSet::default()));
        upstream.insert(
            JobName::BuildLinux,
            Arc::new(ArtifactSet::with_wheels(vec![wheel(
                "kiln-1.2.3-linux.whl",
                Platform::Linux,
            )])),
        );
        upstream.insert(
            JobName::BuildWindows,
            Arc::new(ArtifactSet::with_wheels(vec![wheel(
                "kiln-1.2.3-win.whl",
                Platform::Windows,
            )])),
        );
        if with_image {
            upstream.insert(
                JobName::Containerize,
                Arc::new(ArtifactSet::with_image(
                    ImageRef::new("ghcr.io/org/kiln", "v1.2.3").with_digest("sha256:feed"),
                )),
            );
        }
        upstream
    }

    #[test]
    fn test_assemble_keys_wheels_by_platform() {
        let bundle =
            ReleaseBundle::assemble(&TriggerEvent::tag("refs/tags/v1.2.3", "abc"), &upstream(true))
                .unwrap();
        assert_eq!(bundle.tag, "v1.2.3");
        assert_eq!(bundle.wheels.len(), 2);
        assert_eq!(bundle.assets().count(), 2);
        assert_eq!(bundle.image_tags(), ["v1.2.3", "latest"]);
    }

    #[test]
    fn test_assemble_rejects_non_version_refs() {
        for trigger in [
            TriggerEvent::tag("refs/tags/nightly", "abc"),
            TriggerEvent::push("refs/heads/main", "abc"),
            TriggerEvent::pull_request("refs/pull/3/merge", "abc"),
        ] {
            assert!(matches!(
                ReleaseBundle::assemble(&trigger, &upstream(true)),
                Err(PublishError::NotReleasable(_))
            ));
        }
    }

    #[test]
    fn test_assemble_requires_image_and_both_platforms() {
        let trigger = TriggerEvent::tag("v1.2.3", "abc");
        assert_eq!(
            ReleaseBundle::assemble(&trigger, &upstream(false)),
            Err(PublishError::MissingImage)
        );

        let mut partial = upstream(true);
        partial.remove(&JobName::BuildWindows);
        assert_eq!(
            ReleaseBundle::assemble(&trigger, &partial),
            Err(PublishError::MissingWheels(Platform::Windows))
        );
    }

    #[tokio::test]
    async fn test_publish_tags_ref_and_latest_on_same_digest() {
        let bundle =
            ReleaseBundle::assemble(&TriggerEvent::tag("v1.2.3", "abc"), &upstream(true)).unwrap();
        let host = Arc::new(MemoryAssetHost::new());
        let registry = Arc::new(MemoryRegistry::new());
        let publisher = ReleasePublisher::new(host.clone(), registry.clone());

        let report = publisher.publish(&bundle).await;
        assert!(report.success());
        assert_eq!(report.attempted, 5);
        assert_eq!(host.uploaded("v1.2.3").len(), 2);
        assert_eq!(
            registry.digest_of("ghcr.io/org/kiln:v1.2.3"),
            registry.digest_of("ghcr.io/org/kiln:latest")
        );
    }

    #[tokio::test]
    async fn test_failed_release_setup_still_tags_image() {
        let bundle =
            ReleaseBundle::assemble(&TriggerEvent::tag("v1.2.3", "abc"), &upstream(true)).unwrap();
        let host = Arc::new(MemoryAssetHost::new().failing_setup());
        let registry = Arc::new(MemoryRegistry::new());
        let report = ReleasePublisher::new(host, registry).publish(&bundle).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].target, "release:v1.2.3");
        assert_eq!(report.image_tags.len(), 2);
        assert!(matches!(
            report.into_result(),
            Err(PublishError::PartialFailure { failed: 1, .. })
        ));
    }
}

//! In-memory fakes for the pipeline boundaries (testing only)
//!
//! Provides `FakeJobRunner`, `MemoryAssetHost` and `MemoryRegistry` so the
//! executor and publisher can be driven without docker, gh or cibuildwheel.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PublishError, Result};
use crate::job::{ArtifactSet, ImageRef, JobName, Platform, WheelArtifact};
use crate::jobs::{JobContext, JobReport, JobRunner, DEFAULT_IMAGE_REPOSITORY};
use crate::runner::StepResult;
use crate::stage::Severity;

// ---------------------------------------------------------------------------
// FakeJobRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Script {
    Report(JobReport),
    Error(String),
}

/// Job runner with scripted per-node results.
///
/// Unscripted nodes succeed with the artifacts a real run would hand on:
/// one wheel per build node and a digest-pinned image for containerize.
#[derive(Debug, Default)]
pub struct FakeJobRunner {
    scripts: BTreeMap<JobName, Script>,
    delays: BTreeMap<JobName, Duration>,
    runs: Mutex<Vec<JobName>>,
    upstream_seen: Mutex<BTreeMap<JobName, BTreeSet<JobName>>>,
}

impl FakeJobRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `report` for `node`.
    pub fn with_report(mut self, node: JobName, report: JobReport) -> Self {
        self.scripts.insert(node, Script::Report(report));
        self
    }

    /// Make `node` fail `step` with a hard (blocking) exit code 1.
    pub fn hard_failing(self, node: JobName, step: &str) -> Self {
        let report = JobReport {
            steps: vec![step_result(step, Severity::Hard, 1)],
            artifacts: ArtifactSet::default(),
        };
        self.with_report(node, report)
    }

    /// Make `node` record a soft failure of `step` and otherwise succeed.
    pub fn soft_failing(self, node: JobName, step: &str) -> Self {
        let mut report = default_report(node);
        report.steps = vec![
            step_result("format", Severity::Hard, 0),
            step_result("lint", Severity::Hard, 0),
            step_result(step, Severity::Soft, 1),
        ];
        self.with_report(node, report)
    }

    /// Make the runner itself error for `node`.
    pub fn erroring(mut self, node: JobName, message: &str) -> Self {
        self.scripts.insert(node, Script::Error(message.to_string()));
        self
    }

    /// Sleep for `delay` before `node` returns.
    pub fn delayed(mut self, node: JobName, delay: Duration) -> Self {
        self.delays.insert(node, delay);
        self
    }

    /// Nodes in the order they started.
    pub fn runs(&self) -> Vec<JobName> {
        self.runs.lock().unwrap().clone()
    }

    /// Upstream artifact keys `node` was handed.
    pub fn upstream_seen(&self, node: JobName) -> Option<BTreeSet<JobName>> {
        self.upstream_seen.lock().unwrap().get(&node).cloned()
    }
}

#[async_trait]
impl JobRunner for FakeJobRunner {
    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        self.runs.lock().unwrap().push(ctx.node);
        self.upstream_seen
            .lock()
            .unwrap()
            .insert(ctx.node, ctx.upstream.keys().copied().collect());

        if let Some(delay) = self.delays.get(&ctx.node) {
            tokio::time::sleep(*delay).await;
        }

        match self.scripts.get(&ctx.node) {
            Some(Script::Report(report)) => Ok(report.clone()),
            Some(Script::Error(message)) => Err(PipelineError::MissingOutput {
                node: ctx.node,
                what: message.clone(),
            }),
            None => Ok(default_report(ctx.node)),
        }
    }
}

fn step_result(name: &str, severity: Severity, exit_code: i32) -> StepResult {
    StepResult {
        step_name: name.to_string(),
        severity,
        exit_code,
        stdout: String::new(),
        stderr: if exit_code == 0 {
            String::new()
        } else {
            format!("{name}: exit {exit_code}\n")
        },
        duration_ms: 1,
        skipped: false,
    }
}

/// A plausible wheel for `platform`.
pub fn fake_wheel(platform: Platform) -> WheelArtifact {
    let file_name = match platform {
        Platform::Linux => "kiln_native-1.2.3-cp312-abi3-manylinux_2_28_x86_64.whl",
        Platform::Windows => "kiln_native-1.2.3-cp312-abi3-win_amd64.whl",
    };
    WheelArtifact {
        file_name: file_name.to_string(),
        path: PathBuf::from("wheelhouse").join(platform.name()).join(file_name),
        platform,
        size: 4096,
        sha256: hex::encode(Sha256::digest(file_name.as_bytes())),
    }
}

/// Digest a fake registry assigns to `reference`.
pub fn fake_digest(reference: &str) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(reference.as_bytes())))
}

fn default_report(node: JobName) -> JobReport {
    let artifacts = match node {
        JobName::BuildLinux | JobName::BuildWindows => node
            .platform()
            .map(|platform| ArtifactSet::with_wheels(vec![fake_wheel(platform)]))
            .unwrap_or_default(),
        JobName::Containerize => {
            let image = ImageRef::new(DEFAULT_IMAGE_REPOSITORY, "build");
            let digest = fake_digest(&image.tagged());
            ArtifactSet::with_image(image.with_digest(digest))
        }
        JobName::Test | JobName::Release => ArtifactSet::default(),
    };
    JobReport {
        steps: vec![step_result(node.name(), Severity::Hard, 0)],
        artifacts,
    }
}

// ---------------------------------------------------------------------------
// MemoryAssetHost
// ---------------------------------------------------------------------------

/// Asset host keeping uploads in memory, keyed by release tag.
#[derive(Debug, Default)]
pub struct MemoryAssetHost {
    releases: Mutex<BTreeMap<String, Vec<String>>>,
    failing_assets: BTreeSet<String>,
    fail_setup: bool,
}

impl MemoryAssetHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject uploads of `file_name`.
    pub fn failing_asset(mut self, file_name: &str) -> Self {
        self.failing_assets.insert(file_name.to_string());
        self
    }

    /// Reject release creation.
    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    pub fn has_release(&self, tag: &str) -> bool {
        self.releases.lock().unwrap().contains_key(tag)
    }

    /// Uploaded asset names for `tag`, in upload order.
    pub fn uploaded(&self, tag: &str) -> Vec<String> {
        self.releases
            .lock()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl crate::release::AssetHost for MemoryAssetHost {
    async fn ensure_release(
        &self,
        tag: &str,
        _commit_sha: &str,
    ) -> std::result::Result<(), PublishError> {
        if self.fail_setup {
            return Err(PublishError::ReleaseSetup {
                tag: tag.to_string(),
                reason: "release creation rejected".to_string(),
            });
        }
        self.releases
            .lock()
            .unwrap()
            .entry(tag.to_string())
            .or_default();
        Ok(())
    }

    async fn upload_asset(
        &self,
        tag: &str,
        asset: &WheelArtifact,
    ) -> std::result::Result<(), PublishError> {
        if self.failing_assets.contains(&asset.file_name) {
            return Err(PublishError::Upload {
                asset: asset.file_name.clone(),
                reason: "HTTP 502".to_string(),
            });
        }
        let mut releases = self.releases.lock().unwrap();
        let Some(assets) = releases.get_mut(tag) else {
            return Err(PublishError::Upload {
                asset: asset.file_name.clone(),
                reason: format!("release '{tag}' not found"),
            });
        };
        assets.retain(|name| name != &asset.file_name);
        assets.push(asset.file_name.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// Registry mapping `repository:tag` to digests.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tags: Mutex<BTreeMap<String, String>>,
    failing_tags: BTreeSet<String>,
    drifting_tags: BTreeSet<String>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject tagging with `tag`.
    pub fn failing_tag(mut self, tag: &str) -> Self {
        self.failing_tags.insert(tag.to_string());
        self
    }

    /// Resolve `tag` to a different digest than the one requested.
    pub fn drifting_tag(mut self, tag: &str) -> Self {
        self.drifting_tags.insert(tag.to_string());
        self
    }

    /// Digest `reference` (`repository:tag`) currently points at.
    pub fn digest_of(&self, reference: &str) -> Option<String> {
        self.tags.lock().unwrap().get(reference).cloned()
    }
}

#[async_trait]
impl crate::release::ContainerRegistry for MemoryRegistry {
    async fn tag_image(
        &self,
        source: &ImageRef,
        tag: &str,
    ) -> std::result::Result<ImageRef, PublishError> {
        let target = ImageRef::new(&source.repository, tag);
        let reference = target.tagged();
        if self.failing_tags.contains(tag) {
            return Err(PublishError::Registry {
                reference,
                reason: "denied: requested access to the resource is denied".to_string(),
            });
        }
        let Some(digest) = source.digest.clone() else {
            return Err(PublishError::Registry {
                reference,
                reason: "source image has no digest".to_string(),
            });
        };
        let digest = if self.drifting_tags.contains(tag) {
            fake_digest(&reference)
        } else {
            digest
        };
        self.tags.lock().unwrap().insert(reference, digest.clone());
        Ok(target.with_digest(digest))
    }
}

//! Work nodes: the trait the executor drives and its command-backed
//! implementation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::job::{discover_wheels, ArtifactSet, ImageRef, JobName};
use crate::runner::{run_captured, StepResult, StepRunner};
use crate::stage::{containerize_steps, test_steps, wheel_steps, StepConfig};
use crate::trigger::{TriggerEvent, TriggerKind};

pub const DEFAULT_IMAGE_REPOSITORY: &str = "ghcr.io/stevedores-org/kiln-builder";
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 60 * 60;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30 * 60;

/// Pipeline settings shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Checked-out repository the steps run in.
    pub workspace: PathBuf,
    pub image_repository: String,
    /// Wall-clock ceiling for a whole node.
    pub node_timeout: Duration,
    pub step_timeout_secs: u64,
    /// Wheels land in `<wheel_dir>/<platform>` relative to the workspace.
    pub wheel_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            node_timeout: Duration::from_secs(DEFAULT_NODE_TIMEOUT_SECS),
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            wheel_dir: PathBuf::from("wheelhouse"),
        }
    }
}

impl PipelineConfig {
    /// Tag under which the containerize node publishes its image.
    ///
    /// Tags publish under their own name; everything else under `sha-<short>`.
    pub fn image_tag_for(&self, trigger: &TriggerEvent) -> String {
        match trigger.kind {
            TriggerKind::Tag => trigger.ref_name().to_string(),
            _ => format!("sha-{}", trigger.short_sha()),
        }
    }
}

/// Read-only inputs handed to a node.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub node: JobName,
    pub trigger: Arc<TriggerEvent>,
    /// Outputs of the node's completed dependencies.
    pub upstream: BTreeMap<JobName, Arc<ArtifactSet>>,
}

/// What a work node did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub steps: Vec<StepResult>,
    pub artifacts: ArtifactSet,
}

impl JobReport {
    pub fn first_hard_failure(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.is_hard_failure())
    }

    pub fn soft_failures(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.is_soft_failure())
            .map(|s| s.step_name.clone())
            .collect()
    }
}

/// Executes the work nodes (everything except release).
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<JobReport>;
}

/// Runs each node's steps as local commands.
pub struct CommandJobRunner {
    config: PipelineConfig,
}

impl CommandJobRunner {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `steps` in order. A hard failure stops the node; soft failures
    /// are recorded and execution continues.
    async fn run_steps(&self, node: JobName, steps: Vec<StepConfig>) -> Result<Vec<StepResult>> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            info!(node = %node, step = %step.name, "executing step");
            let result = StepRunner::execute_step(&step, &self.config.workspace).await?;
            let stop = result.is_hard_failure();
            results.push(result);
            if stop {
                break;
            }
        }
        Ok(results)
    }

    async fn containerize(&self, trigger: &TriggerEvent) -> Result<JobReport> {
        let image = ImageRef::new(
            &self.config.image_repository,
            self.config.image_tag_for(trigger),
        );
        let steps = containerize_steps(&image.tagged(), self.config.step_timeout_secs);
        let steps = self.run_steps(JobName::Containerize, steps).await?;

        let mut report = JobReport {
            steps,
            artifacts: ArtifactSet::default(),
        };
        if report.first_hard_failure().is_some() {
            return Ok(report);
        }

        let inspect = vec![
            "docker".to_string(),
            "buildx".to_string(),
            "imagetools".to_string(),
            "inspect".to_string(),
            image.tagged(),
            "--format".to_string(),
            "{{.Manifest.Digest}}".to_string(),
        ];
        let (exit_code, stdout, stderr) = run_captured(
            "image-digest",
            &inspect,
            &self.config.workspace,
            self.config.step_timeout_secs,
        )
        .await?;
        let digest = stdout.trim().to_string();
        if exit_code != 0 || digest.is_empty() {
            return Err(PipelineError::MissingOutput {
                node: JobName::Containerize,
                what: format!("image digest for {}: {}", image.tagged(), stderr.trim()),
            });
        }

        report.artifacts = ArtifactSet::with_image(image.with_digest(digest));
        Ok(report)
    }

    async fn build_wheels(&self, node: JobName) -> Result<JobReport> {
        let Some(platform) = node.platform() else {
            return Err(PipelineError::MissingOutput {
                node,
                what: "platform".to_string(),
            });
        };
        let relative = self.config.wheel_dir.join(platform.name());
        let steps = wheel_steps(
            platform,
            &relative.to_string_lossy(),
            self.config.step_timeout_secs,
        );
        let steps = self.run_steps(node, steps).await?;

        let mut report = JobReport {
            steps,
            artifacts: ArtifactSet::default(),
        };
        if report.first_hard_failure().is_some() {
            return Ok(report);
        }

        let wheels = discover_wheels(&self.config.workspace.join(&relative), platform)?;
        if wheels.is_empty() {
            return Err(PipelineError::MissingOutput {
                node,
                what: format!("wheels in {}", relative.display()),
            });
        }
        report.artifacts = ArtifactSet::with_wheels(wheels);
        Ok(report)
    }
}

#[async_trait]
impl JobRunner for CommandJobRunner {
    async fn run(&self, ctx: &JobContext) -> Result<JobReport> {
        match ctx.node {
            JobName::Test => Ok(JobReport {
                steps: self
                    .run_steps(JobName::Test, test_steps(self.config.step_timeout_secs))
                    .await?,
                artifacts: ArtifactSet::default(),
            }),
            JobName::Containerize => self.containerize(&ctx.trigger).await,
            JobName::BuildLinux | JobName::BuildWindows => self.build_wheels(ctx.node).await,
            JobName::Release => Err(PipelineError::MissingOutput {
                node: JobName::Release,
                what: "work steps; release is published by the executor".to_string(),
            }),
        }
    }
}

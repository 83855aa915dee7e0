//! kiln-ci: the release pipeline job graph.
//!
//! Resolves which of test, containerize, build-linux, build-windows and
//! release run for a trigger event, executes them concurrently as their
//! dependencies settle, and publishes version-tag releases.

pub mod error;
pub mod executor;
pub mod fakes;
pub mod graph;
pub mod job;
pub mod jobs;
pub mod release;
pub mod runner;
pub mod stage;
pub mod trigger;

pub use error::{PipelineError, PublishError, Result};
pub use executor::{NodeReport, PipelineExecutor, PipelineReport};
pub use graph::{
    resolve_node, JobNode, NodeOutcome, PipelineGraph, PipelinePlan, Resolution, SkipReason,
};
pub use job::{discover_wheels, ArtifactSet, ImageRef, JobName, Platform, WheelArtifact};
pub use jobs::{CommandJobRunner, JobContext, JobReport, JobRunner, PipelineConfig};
pub use release::{
    AssetHost, ContainerRegistry, DockerRegistry, GhReleaseHost, PublishFailure, PublishReport,
    ReleaseBundle, ReleasePublisher,
};
pub use runner::{StepResult, StepRunner};
pub use stage::{BuiltinCheck, Severity, StepConfig};
pub use trigger::{is_version_tag, TriggerEvent, TriggerKind};

//! Error types for pipeline execution and release publishing.

use thiserror::Error;

use crate::job::{JobName, Platform};

/// Errors produced while resolving or executing the job graph.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A node names a dependency that is not part of the graph.
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: JobName, dependency: JobName },

    /// The graph has no node of this name.
    #[error("unknown node '{0}'")]
    UnknownNode(JobName),

    /// The graph is not acyclic.
    #[error("dependency cycle detected involving nodes: {nodes:?}")]
    DependencyCycle { nodes: Vec<JobName> },

    /// The version-control event cannot drive the pipeline.
    #[error("unsupported trigger event '{0}'")]
    UnsupportedEvent(String),

    /// A required trigger field was absent.
    #[error("missing trigger field: {0}")]
    MissingTriggerField(&'static str),

    /// A formatting or lint step failed; blocks dependents.
    #[error("hard check '{step}' failed with exit code {exit_code}")]
    HardCheckFailure { step: String, exit_code: i32 },

    /// The node exceeded its wall-clock ceiling.
    #[error("node '{node}' timed out after {after_secs} seconds")]
    NodeTimeout { node: JobName, after_secs: u64 },

    /// A single step exceeded its own timeout.
    #[error("step '{step}' timed out after {after_secs} seconds")]
    StepTimeout { step: String, after_secs: u64 },

    /// A step had no command to run.
    #[error("step '{0}' has an empty command")]
    EmptyCommand(String),

    /// The step executable could not be started.
    #[error("failed to start step '{step}': {source}")]
    StepSpawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// The node ran but did not produce what dependents need.
    #[error("node '{node}' produced no {what}")]
    MissingOutput { node: JobName, what: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while assembling or publishing a release.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The trigger is not a version tag; no release bundle may exist.
    #[error("trigger ref '{0}' is not a releasable version tag")]
    NotReleasable(String),

    /// A build node produced no wheels for its platform.
    #[error("no wheel artifacts for platform {0}")]
    MissingWheels(Platform),

    /// The containerize node published no image.
    #[error("no container image reference from the containerize node")]
    MissingImage,

    /// The release node ran without a publisher attached.
    #[error("no release publisher configured")]
    NoPublisher,

    /// The release entry could not be created on the asset host.
    #[error("could not prepare release '{tag}': {reason}")]
    ReleaseSetup { tag: String, reason: String },

    /// A single asset upload failed.
    #[error("upload of '{asset}' failed: {reason}")]
    Upload { asset: String, reason: String },

    /// A registry tag operation failed.
    #[error("tagging {reference} failed: {reason}")]
    Registry { reference: String, reason: String },

    /// Two tags that must share an image point at different digests.
    #[error("tag '{tag}' resolves to {actual}, expected {expected}")]
    DigestMismatch {
        tag: String,
        expected: String,
        actual: String,
    },

    /// One or more sub-publishes failed.
    #[error("release '{tag}' partially failed: {failed} of {attempted} publish operations failed")]
    PartialFailure {
        tag: String,
        failed: usize,
        attempted: usize,
    },
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, PipelineError>;

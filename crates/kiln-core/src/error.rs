//! Error types for the container build path.

use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::BuildPhase;

/// Errors that move the build state machine into `FAILED`.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Disk or permission problem while cleaning or collecting.
    #[error("{phase}: filesystem error at {}: {source}", path.display())]
    Environment {
        phase: BuildPhase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The build directory resolves to a location that must never be removed.
    #[error("{phase}: refusing to remove {}: {reason}", path.display())]
    UnsafeBuildDir {
        phase: BuildPhase,
        path: PathBuf,
        reason: String,
    },

    /// The external configure or compile tool exited non-zero.
    #[error("{phase}: `{program}` exited with code {exit_code}")]
    Tool {
        phase: BuildPhase,
        program: String,
        exit_code: i32,
    },

    /// The external tool could not be started at all.
    #[error("{phase}: failed to start `{program}`: {source}")]
    ToolSpawn {
        phase: BuildPhase,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The artifact manifest itself is malformed.
    #[error("{phase}: invalid artifact manifest: {reason}")]
    InvalidManifest { phase: BuildPhase, reason: String },

    /// An entry of the artifact manifest was absent after compile.
    #[error("{phase}: expected artifact {} is missing", path.display())]
    MissingArtifact { phase: BuildPhase, path: PathBuf },
}

impl BuildError {
    /// Phase in which the failure happened.
    pub fn phase(&self) -> BuildPhase {
        match self {
            BuildError::Environment { phase, .. }
            | BuildError::UnsafeBuildDir { phase, .. }
            | BuildError::Tool { phase, .. }
            | BuildError::ToolSpawn { phase, .. }
            | BuildError::InvalidManifest { phase, .. }
            | BuildError::MissingArtifact { phase, .. } => *phase,
        }
    }

    /// Process exit code for this failure.
    ///
    /// Tool failures propagate the tool's own code; everything else is 1,
    /// except a missing executable which follows the shell convention of 127.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Tool { exit_code, .. } if *exit_code != 0 => *exit_code,
            BuildError::ToolSpawn { source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                127
            }
            _ => 1,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, BuildError>;

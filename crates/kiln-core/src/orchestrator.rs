//! Batch build state machine.
//!
//! ```text
//! START -> CLEAN -> CONFIGURE -> COMPILE -> COLLECT -> DONE
//!            \          \           \          \
//!             +----------+-----------+----------+--> FAILED
//! ```
//!
//! Phases run strictly in sequence and each blocks until its external tool
//! exits. The first failure is absorbing: later phases never run.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::artifact::{ArtifactStore, CollectedArtifact, ListingEntry};
use crate::config::EntryConfig;
use crate::error::{BuildError, Result};
use crate::obs;
use crate::toolchain::Toolchain;

/// States of the batch build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Start,
    Clean,
    Configure,
    Compile,
    Collect,
    Done,
    Failed,
}

impl BuildPhase {
    pub fn name(&self) -> &'static str {
        match self {
            BuildPhase::Start => "start",
            BuildPhase::Clean => "clean",
            BuildPhase::Configure => "configure",
            BuildPhase::Compile => "compile",
            BuildPhase::Collect => "collect",
            BuildPhase::Done => "done",
            BuildPhase::Failed => "failed",
        }
    }

    /// Successor on success; `None` for the terminal states.
    pub fn next(&self) -> Option<BuildPhase> {
        match self {
            BuildPhase::Start => Some(BuildPhase::Clean),
            BuildPhase::Clean => Some(BuildPhase::Configure),
            BuildPhase::Configure => Some(BuildPhase::Compile),
            BuildPhase::Compile => Some(BuildPhase::Collect),
            BuildPhase::Collect => Some(BuildPhase::Done),
            BuildPhase::Done | BuildPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }

    /// Whether a failure in this phase moves the machine to `FAILED`.
    pub fn can_fail(&self) -> bool {
        matches!(
            self,
            BuildPhase::Clean | BuildPhase::Configure | BuildPhase::Compile | BuildPhase::Collect
        )
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a batch run that reached `DONE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Every state entered, starting with `Start`.
    pub transitions: Vec<BuildPhase>,
    pub collected: Vec<CollectedArtifact>,
    /// Contents of the output directory after collection.
    pub listing: Vec<ListingEntry>,
    pub duration_ms: u64,
}

/// A batch run that ended in `FAILED`.
#[derive(Debug, Error)]
#[error("build failed during {phase}: {error}")]
pub struct BuildFailure {
    pub phase: BuildPhase,
    #[source]
    pub error: BuildError,
    /// Every state entered, ending with `Failed`.
    pub transitions: Vec<BuildPhase>,
}

impl BuildFailure {
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// Entry-point build state machine.
pub struct BuildOrchestrator<T> {
    config: EntryConfig,
    toolchain: T,
    store: ArtifactStore,
}

impl<T: Toolchain> BuildOrchestrator<T> {
    pub fn new(config: EntryConfig, toolchain: T) -> Self {
        let store = ArtifactStore::new(&config.output_dir);
        Self {
            config,
            toolchain,
            store,
        }
    }

    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Drive the machine from `START` to `DONE` or `FAILED`.
    pub fn run(&self) -> std::result::Result<BuildReport, BuildFailure> {
        let start = Instant::now();
        let mut transitions = vec![BuildPhase::Start];
        let mut collected = Vec::new();
        let mut listing = Vec::new();
        let mut phase = BuildPhase::Start;

        while let Some(next) = phase.next() {
            transitions.push(next);
            let phase_start = Instant::now();
            obs::emit_phase_started(next);

            let result = match next {
                BuildPhase::Clean => self.clean(),
                BuildPhase::Configure => self.configure(),
                BuildPhase::Compile => self.compile(),
                BuildPhase::Collect => self
                    .store
                    .collect(&self.config.manifest, &self.config.build_dir)
                    .map(|c| collected = c),
                BuildPhase::Done => {
                    listing = self.completion_listing();
                    Ok(())
                }
                BuildPhase::Start | BuildPhase::Failed => Ok(()),
            };

            if let Err(error) = result {
                obs::emit_phase_failed(next, &error);
                transitions.push(BuildPhase::Failed);
                return Err(BuildFailure {
                    phase: next,
                    error,
                    transitions,
                });
            }

            obs::emit_phase_finished(next, phase_start.elapsed().as_millis() as u64);
            phase = next;
        }

        Ok(BuildReport {
            transitions,
            collected,
            listing,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Remove and recreate the build directory.
    fn clean(&self) -> Result<()> {
        let phase = BuildPhase::Clean;
        let build_dir = &self.config.build_dir;
        self.check_build_dir_is_disposable()?;

        let env_err = |source| BuildError::Environment {
            phase,
            path: build_dir.clone(),
            source,
        };

        match fs::symlink_metadata(build_dir) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(build_dir).map_err(env_err)?,
            Ok(_) => fs::remove_file(build_dir).map_err(env_err)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(env_err(e)),
        }
        fs::create_dir_all(build_dir).map_err(env_err)
    }

    fn configure(&self) -> Result<()> {
        self.toolchain.configure(
            &self.config.source_dir,
            &self.config.build_dir,
            &self.config.generator,
        )
    }

    fn compile(&self) -> Result<()> {
        self.toolchain.compile(&self.config.build_dir, self.config.jobs)
    }

    fn completion_listing(&self) -> Vec<ListingEntry> {
        match self.store.listing() {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "could not list output directory");
                Vec::new()
            }
        }
    }

    /// The build directory must not contain the project, the filesystem
    /// root, or the output directory.
    fn check_build_dir_is_disposable(&self) -> Result<()> {
        let phase = BuildPhase::Clean;
        let build = absolute(&self.config.build_dir);
        let refuse = |reason: &str| -> Result<()> {
            Err(BuildError::UnsafeBuildDir {
                phase,
                path: self.config.build_dir.clone(),
                reason: reason.to_string(),
            })
        };

        if build.parent().is_none() {
            return refuse("it is the filesystem root");
        }
        if absolute(&self.config.source_dir).starts_with(&build) {
            return refuse("it contains the project source");
        }
        if absolute(&self.config.output_dir).starts_with(&build) {
            return refuse("it contains the output directory");
        }
        Ok(())
    }
}

/// Lexically absolute form of `path` (no filesystem access, no symlink
/// resolution).
fn absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

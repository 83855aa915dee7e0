//! kiln core - container build entrypoint
//!
//! Provides the pieces run when the build container starts:
//! - Entry mode detection (interactive shell vs unattended build)
//! - The clean/configure/compile/collect build state machine
//! - The toolchain boundary and the artifact output store
//! - Tracing setup and lifecycle event helpers shared with `kiln-ci`

pub mod artifact;
pub mod config;
pub mod error;
pub mod fakes;
pub mod mode;
pub mod obs;
pub mod orchestrator;
pub mod shell;
pub mod telemetry;
pub mod toolchain;

pub use artifact::{
    render_listing, ArtifactManifest, ArtifactStore, CollectedArtifact, ListingEntry,
    ManifestEntry,
};
pub use config::EntryConfig;
pub use error::{BuildError, Result};
pub use mode::{detect_mode, EntryMode, ProcessContext, SHELL_ARG};
pub use orchestrator::{BuildFailure, BuildOrchestrator, BuildPhase, BuildReport};
pub use shell::run_interactive_shell;
pub use telemetry::init_tracing;
pub use toolchain::{exit_code_of, CmakeToolchain, Toolchain};

//! Entrypoint configuration.
//!
//! Only `BUILD_DIR` and `OUTPUT_DIR` are read from the environment; every
//! other knob is fixed when the image is built.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactManifest;

/// Environment variable naming the build directory.
pub const BUILD_DIR_ENV: &str = "BUILD_DIR";
/// Environment variable naming the artifact output directory.
pub const OUTPUT_DIR_ENV: &str = "OUTPUT_DIR";

pub const DEFAULT_BUILD_DIR: &str = "build";
pub const DEFAULT_OUTPUT_DIR: &str = "dist/native";
pub const DEFAULT_GENERATOR: &str = "Ninja";
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Configuration handed to [`crate::BuildOrchestrator`] at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Project root passed to the configure step.
    pub source_dir: PathBuf,
    /// Recreated empty on every batch run.
    pub build_dir: PathBuf,
    /// Created if absent, never cleaned.
    pub output_dir: PathBuf,
    /// Build-system generator for the configure step.
    pub generator: String,
    /// Parallel job cap for the compile step; `None` uses all cores.
    pub jobs: Option<usize>,
    pub manifest: ArtifactManifest,
    /// Program started in interactive mode.
    pub shell: PathBuf,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            generator: DEFAULT_GENERATOR.to_string(),
            jobs: None,
            manifest: ArtifactManifest::standard(),
            shell: PathBuf::from(DEFAULT_SHELL),
        }
    }
}

impl EntryConfig {
    /// Read `BUILD_DIR` and `OUTPUT_DIR` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup(BUILD_DIR_ENV).filter(|v| !v.is_empty()) {
            config.build_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(OUTPUT_DIR_ENV).filter(|v| !v.is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_manifest(mut self, manifest: ArtifactManifest) -> Self {
        self.manifest = manifest;
        self
    }
}

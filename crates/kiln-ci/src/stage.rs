//! Step definitions for pipeline nodes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::Platform;

/// Formatting gate over the tracked C and C++ sources.
const FORMAT_CHECK_SCRIPT: &str = "git ls-files '*.c' '*.cc' '*.cpp' '*.h' '*.hpp' \
     | xargs --no-run-if-empty clang-format --dry-run --Werror";

/// Whether a failing step blocks dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure fails the node.
    Hard,
    /// Failure is recorded; the node still completes.
    Soft,
}

/// Builtin steps of the test node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinCheck {
    /// clang-format --dry-run --Werror over the native sources
    Format,

    /// ruff check over the python package
    Lint,

    /// pytest tests/python
    PythonTests,
}

impl BuiltinCheck {
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinCheck::Format => "format",
            BuiltinCheck::Lint => "lint",
            BuiltinCheck::PythonTests => "python-tests",
        }
    }

    pub fn command(&self) -> Vec<String> {
        match self {
            BuiltinCheck::Format => vec![
                "sh".to_string(),
                "-c".to_string(),
                FORMAT_CHECK_SCRIPT.to_string(),
            ],
            BuiltinCheck::Lint => vec!["ruff".to_string(), "check".to_string(), ".".to_string()],
            BuiltinCheck::PythonTests => vec![
                "python".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                "tests/python".to_string(),
            ],
        }
    }

    /// Tests run against native artifacts that are built later in the
    /// pipeline, so their failures do not block the build nodes.
    pub fn severity(&self) -> Severity {
        match self {
            BuiltinCheck::Format | BuiltinCheck::Lint => Severity::Hard,
            BuiltinCheck::PythonTests => Severity::Soft,
        }
    }

    /// Path (relative to the workspace) that must exist for the step to run.
    pub fn requires_path(&self) -> Option<PathBuf> {
        match self {
            BuiltinCheck::PythonTests => Some(PathBuf::from("tests/python")),
            _ => None,
        }
    }
}

/// A single command inside a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    pub severity: Severity,

    /// Timeout in seconds; 0 disables the step timeout.
    pub timeout_secs: u64,

    /// When set and absent from the workspace, the step is skipped as a pass.
    pub requires_path: Option<PathBuf>,
}

impl StepConfig {
    pub fn from_builtin(check: BuiltinCheck, timeout_secs: u64) -> Self {
        Self {
            name: check.name().to_string(),
            command: check.command(),
            severity: check.severity(),
            timeout_secs,
            requires_path: check.requires_path(),
        }
    }

    /// A hard step running `command`.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            severity: Severity::Hard,
            timeout_secs,
            requires_path: None,
        }
    }

    pub fn soft(mut self) -> Self {
        self.severity = Severity::Soft;
        self
    }

    pub fn requiring(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires_path = Some(path.into());
        self
    }
}

/// Steps of the test node, in order.
pub fn test_steps(timeout_secs: u64) -> Vec<StepConfig> {
    [BuiltinCheck::Format, BuiltinCheck::Lint, BuiltinCheck::PythonTests]
        .into_iter()
        .map(|check| StepConfig::from_builtin(check, timeout_secs))
        .collect()
}

/// `docker build` then `docker push` for `image` (`repository:tag`).
pub fn containerize_steps(image: &str, timeout_secs: u64) -> Vec<StepConfig> {
    vec![
        StepConfig::custom(
            "docker-build",
            vec![
                "docker".to_string(),
                "build".to_string(),
                "--tag".to_string(),
                image.to_string(),
                ".".to_string(),
            ],
            timeout_secs,
        ),
        StepConfig::custom(
            "docker-push",
            vec!["docker".to_string(), "push".to_string(), image.to_string()],
            timeout_secs,
        ),
    ]
}

/// Build wheels for `platform` into `output_dir`.
pub fn wheel_steps(platform: Platform, output_dir: &str, timeout_secs: u64) -> Vec<StepConfig> {
    vec![StepConfig::custom(
        format!("cibuildwheel-{platform}"),
        vec![
            "cibuildwheel".to_string(),
            "--platform".to_string(),
            platform.name().to_string(),
            "--output-dir".to_string(),
            output_dir.to_string(),
        ],
        timeout_secs,
    )]
}

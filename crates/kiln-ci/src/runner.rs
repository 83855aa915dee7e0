//! Step execution.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::stage::{Severity, StepConfig};

/// Result of a step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,

    pub severity: Severity,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout, verbatim.
    pub stdout: String,

    /// Captured stderr, verbatim.
    pub stderr: String,

    pub duration_ms: u64,

    /// The step's precondition path was absent so nothing ran.
    pub skipped: bool,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// A failure that fails the owning node.
    pub fn is_hard_failure(&self) -> bool {
        !self.passed() && self.severity == Severity::Hard
    }

    /// A failure that is recorded but does not block.
    pub fn is_soft_failure(&self) -> bool {
        !self.passed() && self.severity == Severity::Soft
    }
}

/// Executes steps as child processes.
pub struct StepRunner;

impl StepRunner {
    /// Execute a single step in `workdir` and return the result.
    ///
    /// A non-zero exit is a normal result; only spawn failures and timeouts
    /// are errors.
    pub async fn execute_step(config: &StepConfig, workdir: &Path) -> Result<StepResult> {
        let start = Instant::now();

        if let Some(required) = &config.requires_path {
            if !workdir.join(required).exists() {
                warn!(
                    step = %config.name,
                    path = %required.display(),
                    "required path not found, skipping step"
                );
                return Ok(StepResult {
                    step_name: config.name.clone(),
                    severity: config.severity,
                    exit_code: 0,
                    stdout: format!("{} not found, nothing to run\n", required.display()),
                    stderr: String::new(),
                    duration_ms: 0,
                    skipped: true,
                });
            }
        }

        let (exit_code, stdout, stderr) =
            run_captured(&config.name, &config.command, workdir, config.timeout_secs).await?;

        Ok(StepResult {
            step_name: config.name.clone(),
            severity: config.severity,
            exit_code,
            stdout,
            stderr,
            duration_ms: start.elapsed().as_millis() as u64,
            skipped: false,
        })
    }
}

/// Run `command` in `workdir`, capturing output. Returns
/// `(exit_code, stdout, stderr)`.
///
/// The child is killed if the timeout elapses or the future is dropped.
pub async fn run_captured(
    name: &str,
    command: &[String],
    workdir: &Path,
    timeout_secs: u64,
) -> Result<(i32, String, String)> {
    let Some((exe, args)) = command.split_first() else {
        return Err(PipelineError::EmptyCommand(name.to_string()));
    };

    let child = Command::new(exe)
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PipelineError::StepSpawn {
            step: name.to_string(),
            source,
        })?;

    let output = if timeout_secs > 0 {
        tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output())
            .await
            .map_err(|_| PipelineError::StepTimeout {
                step: name.to_string(),
                after_secs: timeout_secs,
            })??
    } else {
        child.wait_with_output().await?
    };

    let exit_code = if output.status.success() {
        0
    } else {
        kiln_core::exit_code_of(output.status)
    };
    Ok((
        exit_code,
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32, severity: Severity) -> StepResult {
        StepResult {
            step_name: "step".to_string(),
            severity,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            skipped: false,
        }
    }

    #[test]
    fn test_step_result_classification() {
        assert!(result(0, Severity::Hard).passed());
        assert!(result(1, Severity::Hard).is_hard_failure());
        assert!(!result(1, Severity::Hard).is_soft_failure());
        assert!(result(1, Severity::Soft).is_soft_failure());
        assert!(!result(1, Severity::Soft).is_hard_failure());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let config = StepConfig::custom(
            "echo_test",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        );
        let result = StepRunner::execute_step(&config, Path::new("."))
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let config = StepConfig::custom("false_test", vec!["false".to_string()], 60);
        let result = StepRunner::execute_step(&config, Path::new("."))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_missing_required_path_passes_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = StepConfig::custom("pytest", vec!["false".to_string()], 60)
            .soft()
            .requiring("tests/python");
        let result = StepRunner::execute_step(&config, dir.path()).await.unwrap();
        assert!(result.passed());
        assert!(result.skipped);
    }

    #[tokio::test]
    async fn test_step_timeout_is_error() {
        let config = StepConfig::custom("sleepy", vec!["sleep".to_string(), "5".to_string()], 1);
        let err = StepRunner::execute_step(&config, Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StepTimeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_error() {
        let config = StepConfig::custom("empty", Vec::new(), 60);
        let err = StepRunner::execute_step(&config, Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyCommand(_)));
    }
}

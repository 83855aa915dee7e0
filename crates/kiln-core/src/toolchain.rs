//! Thin invoker of the external configure/compile toolchain.
//!
//! The orchestrator only sees success or an exit code. Tool output is
//! inherited by the child so diagnostics reach the caller unmodified.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use tracing::debug;

use crate::error::{BuildError, Result};
use crate::orchestrator::BuildPhase;

/// Two-phase build system driven by the orchestrator.
pub trait Toolchain: Send + Sync {
    /// Generate the build tree in `build_dir` for the project at `source_dir`.
    fn configure(&self, source_dir: &Path, build_dir: &Path, generator: &str) -> Result<()>;

    /// Build everything in `build_dir`. `jobs = None` leaves parallelism to
    /// the tool.
    fn compile(&self, build_dir: &Path, jobs: Option<usize>) -> Result<()>;
}

/// CMake driver: `cmake -S -B -G` then `cmake --build --parallel`.
#[derive(Debug, Clone)]
pub struct CmakeToolchain {
    program: PathBuf,
}

impl Default for CmakeToolchain {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cmake"),
        }
    }
}

impl CmakeToolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for the configure phase.
    pub fn configure_args(source_dir: &Path, build_dir: &Path, generator: &str) -> Vec<String> {
        vec![
            "-S".to_string(),
            source_dir.to_string_lossy().into_owned(),
            "-B".to_string(),
            build_dir.to_string_lossy().into_owned(),
            "-G".to_string(),
            generator.to_string(),
        ]
    }

    /// Arguments for the compile phase.
    pub fn compile_args(build_dir: &Path, jobs: Option<usize>) -> Vec<String> {
        let mut args = vec![
            "--build".to_string(),
            build_dir.to_string_lossy().into_owned(),
            "--parallel".to_string(),
        ];
        if let Some(jobs) = jobs {
            args.push(jobs.to_string());
        }
        args
    }

    fn run(&self, phase: BuildPhase, args: &[String]) -> Result<()> {
        let program = self.program.to_string_lossy().into_owned();
        debug!(phase = %phase, program = %program, args = ?args, "invoking toolchain");

        let status = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| BuildError::ToolSpawn {
                phase,
                program: program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(BuildError::Tool {
                phase,
                program,
                exit_code: exit_code_of(status),
            })
        }
    }
}

impl Toolchain for CmakeToolchain {
    fn configure(&self, source_dir: &Path, build_dir: &Path, generator: &str) -> Result<()> {
        let args = Self::configure_args(source_dir, build_dir, generator);
        self.run(BuildPhase::Configure, &args)
    }

    fn compile(&self, build_dir: &Path, jobs: Option<usize>) -> Result<()> {
        let args = Self::compile_args(build_dir, jobs);
        self.run(BuildPhase::Compile, &args)
    }
}

/// Non-zero exit code for a finished child.
///
/// Signal termination maps to `128 + signal` like a POSIX shell.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

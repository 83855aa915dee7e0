//! In-memory fakes for the toolchain boundary (testing only)
//!
//! `FakeToolchain` records every call and can be told to fail a phase or to
//! drop files into the build directory when compile runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BuildError, Result};
use crate::orchestrator::BuildPhase;
use crate::toolchain::Toolchain;

/// A toolchain phase invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCall {
    Configure,
    Compile,
}

#[derive(Debug, Default)]
pub struct FakeToolchain {
    calls: Mutex<Vec<ToolCall>>,
    configure_exit: Option<i32>,
    compile_exit: Option<i32>,
    outputs: Vec<(PathBuf, Vec<u8>)>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the configure phase exit with `code`.
    pub fn failing_configure(mut self, code: i32) -> Self {
        self.configure_exit = Some(code);
        self
    }

    /// Make the compile phase exit with `code`.
    pub fn failing_compile(mut self, code: i32) -> Self {
        self.compile_exit = Some(code);
        self
    }

    /// Write `contents` to `build_dir/relative` on a successful compile.
    pub fn producing(mut self, relative: impl Into<PathBuf>, contents: &[u8]) -> Self {
        self.outputs.push((relative.into(), contents.to_vec()));
        self
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: ToolCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Toolchain for FakeToolchain {
    fn configure(&self, _source_dir: &Path, _build_dir: &Path, _generator: &str) -> Result<()> {
        self.record(ToolCall::Configure);
        match self.configure_exit {
            Some(exit_code) => Err(BuildError::Tool {
                phase: BuildPhase::Configure,
                program: "fake-configure".to_string(),
                exit_code,
            }),
            None => Ok(()),
        }
    }

    fn compile(&self, build_dir: &Path, _jobs: Option<usize>) -> Result<()> {
        self.record(ToolCall::Compile);
        if let Some(exit_code) = self.compile_exit {
            return Err(BuildError::Tool {
                phase: BuildPhase::Compile,
                program: "fake-compile".to_string(),
                exit_code,
            });
        }
        for (relative, contents) in &self.outputs {
            let path = build_dir.join(relative);
            let env_err = |source| BuildError::Environment {
                phase: BuildPhase::Compile,
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(env_err)?;
            }
            fs::write(&path, contents).map_err(env_err)?;
        }
        Ok(())
    }
}

//! kiln-entry - build container entrypoint
//!
//! Started as the container's entrypoint. With a terminal on stdin, or with
//! `shell` as the first argument, it hands control to an interactive shell.
//! Otherwise it runs the unattended clean/configure/compile/collect build
//! and prints the output directory listing.
//!
//! Build and output directories come from `BUILD_DIR` and `OUTPUT_DIR`.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::{
    detect_mode, init_tracing, render_listing, run_interactive_shell, BuildOrchestrator,
    CmakeToolchain, EntryConfig, EntryMode, ProcessContext, Toolchain, SHELL_ARG,
};
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "kiln-entry")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Build container entrypoint (interactive shell or unattended build)",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, env = "KILN_VERBOSE")]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "KILN_LOG_JSON")]
    json: bool,

    /// Project root handed to the configure step
    #[arg(long, env = "KILN_SOURCE_DIR", default_value = ".")]
    source_dir: PathBuf,

    /// Cap on parallel compile jobs (default: all cores)
    #[arg(long, env = "KILN_JOBS")]
    jobs: Option<usize>,

    /// `shell [ARGS...]` for an interactive session
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    /// Arguments forwarded to the shell: everything after a leading `shell`.
    fn shell_args(&self) -> &[String] {
        match self.args.split_first() {
            Some((first, rest)) if first == SHELL_ARG => rest,
            _ => &self.args,
        }
    }

    fn entry_config(&self) -> EntryConfig {
        let mut config = EntryConfig::from_env().with_source_dir(&self.source_dir);
        if let Some(jobs) = self.jobs {
            config = config.with_jobs(jobs);
        }
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let ctx = ProcessContext::capture(cli.args.first().cloned());
    let mode = detect_mode(&ctx);
    kiln_core::obs::emit_mode_selected(mode);

    let code = match mode {
        EntryMode::Interactive => run_shell(&cli)?,
        EntryMode::Batch => {
            if !cli.args.is_empty() {
                warn!(args = ?cli.args, "ignoring arguments in batch mode");
            }
            let config = cli.entry_config();
            let orchestrator = BuildOrchestrator::new(config, CmakeToolchain::default());
            let stdout = io::stdout();
            run_batch(&orchestrator, &mut stdout.lock())?
        }
    };

    std::process::exit(code);
}

fn run_shell(cli: &Cli) -> Result<i32> {
    let shell = cli.entry_config().shell;
    match run_interactive_shell(&shell, cli.shell_args()) {
        Ok(code) => Ok(code),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            error!(shell = %shell.display(), "shell not found");
            Ok(127)
        }
        Err(e) => Err(e).with_context(|| format!("failed to start {}", shell.display())),
    }
}

/// Run the build and write the completion listing to `out`. Returns the
/// process exit code.
fn run_batch<T: Toolchain>(
    orchestrator: &BuildOrchestrator<T>,
    out: &mut impl Write,
) -> Result<i32> {
    let config = orchestrator.config();
    info!(
        build_dir = %config.build_dir.display(),
        output_dir = %config.output_dir.display(),
        "starting batch build"
    );

    match orchestrator.run() {
        Ok(report) => {
            out.write_all(render_listing(&config.output_dir, &report.listing).as_bytes())
                .context("failed to write output listing")?;
            out.flush()?;
            info!(
                artifacts = report.collected.len(),
                duration_ms = report.duration_ms,
                "build complete"
            );
            Ok(0)
        }
        Err(failure) => {
            error!(phase = %failure.phase, error = %failure.error, "build failed");
            Ok(failure.exit_code())
        }
    }
}

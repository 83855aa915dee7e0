//! kiln - release pipeline CLI
//!
//! Drives the test → {containerize, build-linux, build-windows} → release
//! job graph for a version-control trigger.
//!
//! ## Commands
//!
//! - `pipeline plan`: show which nodes a trigger would run
//! - `pipeline run`: execute the whole graph locally
//! - `node run`: execute a single node (one CI agent per node)
//! - `release publish`: publish already-built wheels and image for a tag

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kiln_ci::jobs::{DEFAULT_IMAGE_REPOSITORY, DEFAULT_NODE_TIMEOUT_SECS, DEFAULT_STEP_TIMEOUT_SECS};
use kiln_ci::{
    discover_wheels, ArtifactSet, CommandJobRunner, DockerRegistry, GhReleaseHost, ImageRef,
    JobName, NodeReport, PipelineConfig, PipelineExecutor, PipelineGraph, PipelinePlan,
    PipelineReport, Platform, PublishReport, ReleaseBundle, ReleasePublisher, TriggerEvent,
    TriggerKind,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Release pipeline for the kiln native extension", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Format of the result printed to stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan or run the whole job graph
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Run one node of the graph
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Publish release assets and image tags
    Release {
        #[command(subcommand)]
        action: ReleaseAction,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Show which nodes run for a trigger, wave by wave
    Plan {
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Execute every enabled node
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        settings: PipelineArgs,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Execute a single node without upstream artifacts
    Run {
        /// Node name (test, containerize, build-linux, build-windows)
        job: JobName,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        settings: PipelineArgs,
    },
}

#[derive(Subcommand)]
enum ReleaseAction {
    /// Publish wheels from the wheel directory and tag the image
    Publish {
        /// Built image, `repository:tag@sha256:...` or `repository@sha256:...`
        #[arg(long, env = "KILN_IMAGE")]
        image: String,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        settings: PipelineArgs,
    },
}

/// Where the trigger event comes from.
#[derive(Args, Debug, Clone)]
struct TriggerArgs {
    /// Read the trigger from GITHUB_EVENT_NAME / GITHUB_REF / GITHUB_SHA
    #[arg(long, conflicts_with = "event")]
    from_env: bool,

    /// Trigger kind (push, pull_request, tag)
    #[arg(long)]
    event: Option<TriggerKind>,

    /// Git ref, e.g. refs/tags/v1.2.3
    #[arg(long = "ref", requires = "event")]
    git_ref: Option<String>,

    /// Commit SHA (default: git rev-parse HEAD)
    #[arg(long)]
    sha: Option<String>,

    /// Deny container registry writes for this run
    #[arg(long)]
    no_registry_write: bool,
}

impl TriggerArgs {
    fn resolve(&self) -> Result<TriggerEvent> {
        let trigger = if self.from_env {
            TriggerEvent::from_github_env(|key| std::env::var(key).ok())
                .context("Failed to read trigger from the environment")?
        } else {
            let kind = self
                .event
                .context("either --from-env or --event is required")?;
            let git_ref = self
                .git_ref
                .clone()
                .context("--ref is required with --event")?;
            let sha = self.sha.clone().unwrap_or_else(head_sha);
            TriggerEvent::new(kind, git_ref, sha)
        };

        if self.no_registry_write {
            Ok(trigger.with_registry_write(false))
        } else {
            Ok(trigger)
        }
    }
}

/// Commit checked out in the current directory.
fn head_sha() -> String {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Args, Debug, Clone)]
struct PipelineArgs {
    /// Repository checkout the steps run in
    #[arg(long, env = "KILN_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// Container image repository
    #[arg(long, env = "KILN_IMAGE_REPOSITORY", default_value = DEFAULT_IMAGE_REPOSITORY)]
    image_repository: String,

    /// Wall-clock ceiling per node, in seconds
    #[arg(long, env = "KILN_NODE_TIMEOUT", default_value_t = DEFAULT_NODE_TIMEOUT_SECS)]
    node_timeout: u64,

    /// Timeout per step, in seconds (0 disables)
    #[arg(long, env = "KILN_STEP_TIMEOUT", default_value_t = DEFAULT_STEP_TIMEOUT_SECS)]
    step_timeout: u64,

    /// Wheel output directory, relative to the workspace
    #[arg(long, env = "KILN_WHEEL_DIR", default_value = "wheelhouse")]
    wheel_dir: PathBuf,
}

impl PipelineArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            workspace: self.workspace.clone(),
            image_repository: self.image_repository.clone(),
            node_timeout: Duration::from_secs(self.node_timeout),
            step_timeout_secs: self.step_timeout,
            wheel_dir: self.wheel_dir.clone(),
        }
    }

    fn publisher(&self) -> Arc<ReleasePublisher> {
        Arc::new(ReleasePublisher::new(
            Arc::new(GhReleaseHost::new(&self.workspace, self.step_timeout)),
            Arc::new(DockerRegistry::new(&self.workspace, self.step_timeout)),
        ))
    }

    fn executor(&self) -> PipelineExecutor {
        let config = self.config();
        let node_timeout = config.node_timeout;
        PipelineExecutor::new(
            PipelineGraph::standard(),
            Arc::new(CommandJobRunner::new(config)),
        )
        .with_publisher(self.publisher())
        .with_node_timeout(node_timeout)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    kiln_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Pipeline { action } => match action {
            PipelineAction::Plan { trigger } => cmd_pipeline_plan(&trigger, cli.output)?,
            PipelineAction::Run { trigger, settings } => {
                cmd_pipeline_run(&trigger, &settings, cli.output).await?
            }
        },
        Commands::Node { action } => match action {
            NodeAction::Run {
                job,
                trigger,
                settings,
            } => cmd_node_run(job, &trigger, &settings, cli.output).await?,
        },
        Commands::Release { action } => match action {
            ReleaseAction::Publish {
                image,
                trigger,
                settings,
            } => cmd_release_publish(&image, &trigger, &settings, cli.output).await?,
        },
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn cmd_pipeline_plan(trigger: &TriggerArgs, output: OutputFormat) -> Result<i32> {
    let trigger = trigger.resolve()?;
    let plan = PipelineGraph::standard()
        .plan(&trigger)
        .context("Failed to plan pipeline")?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => print!("{}", render_plan(&plan)),
    }
    Ok(0)
}

async fn cmd_pipeline_run(
    trigger: &TriggerArgs,
    settings: &PipelineArgs,
    output: OutputFormat,
) -> Result<i32> {
    let trigger = trigger.resolve()?;
    info!(trigger = %trigger.kind, git_ref = %trigger.git_ref, "running pipeline");

    let report = settings
        .executor()
        .run(trigger)
        .await
        .context("Pipeline failed to run")?;

    match output {
        OutputFormat::Json => println!("{}", report.to_json()?),
        OutputFormat::Text => print_pipeline_report(&report),
    }
    Ok(report.exit_code())
}

async fn cmd_node_run(
    job: JobName,
    trigger: &TriggerArgs,
    settings: &PipelineArgs,
    output: OutputFormat,
) -> Result<i32> {
    if job == JobName::Release {
        anyhow::bail!("the release node needs upstream artifacts; use `kiln release publish`");
    }
    let trigger = trigger.resolve()?;
    let report = settings
        .executor()
        .run_node(job, trigger)
        .await
        .with_context(|| format!("Node {job} failed to run"))?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_node_report(&report),
    }
    Ok(if report.outcome.is_hard_failure() { 1 } else { 0 })
}

async fn cmd_release_publish(
    image: &str,
    trigger: &TriggerArgs,
    settings: &PipelineArgs,
    output: OutputFormat,
) -> Result<i32> {
    let trigger = trigger.resolve()?;
    let image = parse_image_ref(image)?;
    let wheel_root = settings.workspace.join(&settings.wheel_dir);

    let mut upstream = BTreeMap::new();
    upstream.insert(JobName::Containerize, Arc::new(ArtifactSet::with_image(image)));
    for (job, platform) in [
        (JobName::BuildLinux, Platform::Linux),
        (JobName::BuildWindows, Platform::Windows),
    ] {
        let dir = wheel_root.join(platform.name());
        let wheels = discover_wheels(&dir, platform)
            .with_context(|| format!("Failed to read wheels from {}", dir.display()))?;
        upstream.insert(job, Arc::new(ArtifactSet::with_wheels(wheels)));
    }

    let bundle = ReleaseBundle::assemble(&trigger, &upstream)?;
    let report = settings.publisher().publish(&bundle).await;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_publish_report(&report),
    }
    Ok(if report.success() { 0 } else { 1 })
}

/// Parse `repository[:tag]@digest`.
fn parse_image_ref(raw: &str) -> Result<ImageRef> {
    let (name, digest) = raw
        .split_once('@')
        .with_context(|| format!("image '{raw}' is not pinned to a digest"))?;
    if digest.is_empty() {
        anyhow::bail!("image '{raw}' has an empty digest");
    }

    // A colon after the last slash separates the tag; earlier colons belong
    // to a registry port.
    let last_slash = name.rfind('/').map_or(0, |i| i + 1);
    let (repository, tag) = match name[last_slash..].rfind(':') {
        Some(i) => (&name[..last_slash + i], &name[last_slash + i + 1..]),
        None => (name, "latest"),
    };
    Ok(ImageRef::new(repository, tag).with_digest(digest))
}

fn render_plan(plan: &PipelinePlan) -> String {
    let mut out = format!(
        "Trigger: {} {} ({})\n",
        plan.trigger.kind,
        plan.trigger.git_ref,
        plan.trigger.short_sha()
    );
    for (i, wave) in plan.waves.iter().enumerate() {
        let names: Vec<&str> = wave.iter().map(|job| job.name()).collect();
        out.push_str(&format!("  wave {}: {}\n", i + 1, names.join(", ")));
    }
    for (job, reason) in &plan.skipped {
        out.push_str(&format!("  skip {job}: {reason}\n"));
    }
    out
}

fn print_pipeline_report(report: &PipelineReport) {
    println!("Run ID: {}", report.run_id);
    println!(
        "Trigger: {} {} ({})",
        report.trigger.kind,
        report.trigger.git_ref,
        report.trigger.short_sha()
    );
    println!(
        "Status: {}",
        if report.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!();
    for node in report.nodes.values() {
        print_node_report(node);
    }
}

fn print_node_report(node: &NodeReport) {
    let status = if node.outcome.is_hard_failure() {
        "✗"
    } else if node.outcome.satisfies_dependents() {
        "✓"
    } else {
        "-"
    };
    println!("  {} {} ({}ms): {}", status, node.name, node.duration_ms, node.outcome);

    for step in node.failed_steps() {
        println!("    step {} exited with {}", step.step_name, step.exit_code);
        // Tool output is passed through untouched.
        print!("{}", step.stdout);
        eprint!("{}", step.stderr);
    }
    if let Some(release) = &node.release {
        print_publish_report(release);
    }
}

fn print_publish_report(report: &PublishReport) {
    println!("  Release {}:", report.tag);
    for asset in &report.uploaded {
        println!("    uploaded {asset}");
    }
    for image in &report.image_tags {
        println!("    tagged {image}");
    }
    for failure in &report.failures {
        println!("    FAILED {}: {}", failure.target, failure.error);
    }
}

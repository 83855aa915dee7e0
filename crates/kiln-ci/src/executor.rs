//! Trigger-driven execution of the job graph.
//!
//! Every node whose dependencies have settled is resolved as soon as the
//! last dependency finishes. Nodes that run are spawned onto the runtime and
//! bounded by the per-node wall-clock ceiling; same-wave nodes therefore run
//! concurrently. Each node settles exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::error::{PipelineError, PublishError, Result};
use crate::graph::{resolve_node, NodeOutcome, PipelineGraph, Resolution};
use crate::job::{ArtifactSet, JobName};
use crate::jobs::{JobContext, JobRunner, DEFAULT_NODE_TIMEOUT_SECS};
use crate::release::{PublishReport, ReleaseBundle, ReleasePublisher};
use crate::runner::StepResult;
use crate::trigger::TriggerEvent;

/// How one node settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: JobName,
    pub outcome: NodeOutcome,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    pub artifacts: ArtifactSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ReleaseBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<PublishReport>,
}

impl NodeReport {
    fn new(name: JobName, outcome: NodeOutcome) -> Self {
        Self {
            name,
            outcome,
            duration_ms: 0,
            steps: Vec::new(),
            artifacts: ArtifactSet::default(),
            bundle: None,
            release: None,
        }
    }

    /// Steps whose failure should be surfaced to the user.
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|step| !step.passed())
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub trigger: TriggerEvent,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: BTreeMap<JobName, NodeReport>,
}

impl PipelineReport {
    /// No executed node failed or timed out.
    pub fn success(&self) -> bool {
        !self.nodes.values().any(|node| node.outcome.is_hard_failure())
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, node: JobName) -> Option<&NodeOutcome> {
        self.nodes.get(&node).map(|report| &report.outcome)
    }

    /// Nodes that actually ran, in name order.
    pub fn executed(&self) -> Vec<JobName> {
        self.nodes
            .values()
            .filter(|node| !matches!(node.outcome, NodeOutcome::Skipped { .. }))
            .map(|node| node.name)
            .collect()
    }

    pub fn release_bundle(&self) -> Option<&ReleaseBundle> {
        self.nodes
            .get(&JobName::Release)
            .and_then(|node| node.bundle.as_ref())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Drives a [`PipelineGraph`] for one trigger.
pub struct PipelineExecutor {
    graph: PipelineGraph,
    jobs: Arc<dyn JobRunner>,
    publisher: Option<Arc<ReleasePublisher>>,
    node_timeout: Duration,
}

impl PipelineExecutor {
    pub fn new(graph: PipelineGraph, jobs: Arc<dyn JobRunner>) -> Self {
        Self {
            graph,
            jobs,
            publisher: None,
            node_timeout: Duration::from_secs(DEFAULT_NODE_TIMEOUT_SECS),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<ReleasePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_node_timeout(mut self, node_timeout: Duration) -> Self {
        self.node_timeout = node_timeout;
        self
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Run the whole graph for `trigger`.
    pub async fn run(&self, trigger: TriggerEvent) -> Result<PipelineReport> {
        self.graph.validate()?;
        let run_id = Uuid::new_v4().to_string();
        let span = kiln_core::obs::pipeline_span(&run_id);
        self.execute(run_id, Arc::new(trigger)).instrument(span).await
    }

    /// Run a single node in isolation, without upstream artifacts.
    ///
    /// The node's enablement predicate still applies; its dependencies are
    /// assumed to have completed elsewhere.
    pub async fn run_node(&self, name: JobName, trigger: TriggerEvent) -> Result<NodeReport> {
        let node = self.graph.node(name).ok_or(PipelineError::UnknownNode(name))?;
        if !node.is_enabled(&trigger) {
            let report = NodeReport::new(
                name,
                NodeOutcome::Skipped {
                    reason: crate::graph::SkipReason::Disabled,
                },
            );
            kiln_core::obs::emit_node_resolved(name.name(), report.outcome.label());
            return Ok(report);
        }

        let ctx = JobContext {
            node: name,
            trigger: Arc::new(trigger),
            upstream: BTreeMap::new(),
        };
        Ok(self.spawn_node(ctx).await)
    }

    async fn execute(&self, run_id: String, trigger: Arc<TriggerEvent>) -> Result<PipelineReport> {
        let started_at = Utc::now();
        info!(trigger = %trigger.kind, git_ref = %trigger.git_ref, "pipeline started");

        let mut pending: BTreeSet<JobName> = self.graph.nodes().map(|node| node.name).collect();
        let mut settled: BTreeMap<JobName, NodeOutcome> = BTreeMap::new();
        let mut outputs: BTreeMap<JobName, Arc<ArtifactSet>> = BTreeMap::new();
        let mut reports: BTreeMap<JobName, NodeReport> = BTreeMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            // Skips settle immediately and may unblock further nodes.
            let mut progressed = true;
            while progressed {
                progressed = false;
                let ready: Vec<JobName> = pending
                    .iter()
                    .copied()
                    .filter(|name| {
                        self.graph
                            .dependencies_of(*name)
                            .iter()
                            .all(|dependency| settled.contains_key(dependency))
                    })
                    .collect();

                for name in ready {
                    pending.remove(&name);
                    let Some(node) = self.graph.node(name) else {
                        continue;
                    };
                    match resolve_node(node, &trigger, &settled) {
                        Resolution::Skip(reason) => {
                            kiln_core::obs::emit_node_resolved(name.name(), "skip");
                            info!(node = %name, reason = %reason, "node skipped");
                            let outcome = NodeOutcome::Skipped { reason };
                            settled.insert(name, outcome.clone());
                            reports.insert(name, NodeReport::new(name, outcome));
                            progressed = true;
                        }
                        Resolution::Run => {
                            kiln_core::obs::emit_node_resolved(name.name(), "run");
                            let upstream = node
                                .depends_on
                                .iter()
                                .filter_map(|dep| {
                                    outputs.get(dep).map(|set| (*dep, Arc::clone(set)))
                                })
                                .collect();
                            let ctx = JobContext {
                                node: name,
                                trigger: Arc::clone(&trigger),
                                upstream,
                            };
                            running.push(self.spawn_node(ctx));
                        }
                    }
                }
            }

            let Some(report) = running.next().await else {
                break;
            };
            if report.outcome.satisfies_dependents() {
                outputs.insert(report.name, Arc::new(report.artifacts.clone()));
            }
            settled.insert(report.name, report.outcome.clone());
            reports.insert(report.name, report);
        }

        let report = PipelineReport {
            run_id,
            trigger: trigger.as_ref().clone(),
            started_at,
            finished_at: Utc::now(),
            nodes: reports,
        };
        info!(
            success = report.success(),
            executed = report.executed().len(),
            "pipeline finished"
        );
        Ok(report)
    }

    /// Spawn `ctx.node` and wait for it under the node timeout.
    fn spawn_node(
        &self,
        ctx: JobContext,
    ) -> impl std::future::Future<Output = NodeReport> + Send + 'static {
        let jobs = Arc::clone(&self.jobs);
        let publisher = self.publisher.clone();
        let node_timeout = self.node_timeout;

        async move {
            let name = ctx.node;
            let start = Instant::now();
            let task = tokio::spawn(execute_node(jobs, publisher, ctx));
            let abort = task.abort_handle();

            let mut report = match tokio::time::timeout(node_timeout, task).await {
                Ok(Ok(report)) => report,
                Ok(Err(join_error)) => NodeReport::new(
                    name,
                    NodeOutcome::Failed {
                        reason: format!("node task aborted: {join_error}"),
                    },
                ),
                Err(_) => {
                    abort.abort();
                    let err = PipelineError::NodeTimeout {
                        node: name,
                        after_secs: node_timeout.as_secs(),
                    };
                    tracing::warn!(node = %name, error = %err, "node timed out");
                    NodeReport::new(
                        name,
                        NodeOutcome::TimedOut {
                            after_secs: node_timeout.as_secs(),
                        },
                    )
                }
            };
            report.duration_ms = start.elapsed().as_millis() as u64;

            for step in report.steps.iter().filter(|step| step.is_soft_failure()) {
                kiln_core::obs::emit_soft_failure(name.name(), &step.step_name, step.exit_code);
            }
            kiln_core::obs::emit_node_finished(
                name.name(),
                report.outcome.label(),
                report.duration_ms,
            );
            report
        }
    }
}

async fn execute_node(
    jobs: Arc<dyn JobRunner>,
    publisher: Option<Arc<ReleasePublisher>>,
    ctx: JobContext,
) -> NodeReport {
    if ctx.node == JobName::Release {
        return publish_release(publisher, &ctx).await;
    }

    match jobs.run(&ctx).await {
        Ok(job) => {
            let outcome = if let Some(step) = job.first_hard_failure() {
                NodeOutcome::Failed {
                    reason: PipelineError::HardCheckFailure {
                        step: step.step_name.clone(),
                        exit_code: step.exit_code,
                    }
                    .to_string(),
                }
            } else {
                let failures = job.soft_failures();
                if failures.is_empty() {
                    NodeOutcome::Succeeded
                } else {
                    NodeOutcome::SoftFailed { failures }
                }
            };
            NodeReport {
                steps: job.steps,
                artifacts: job.artifacts,
                ..NodeReport::new(ctx.node, outcome)
            }
        }
        Err(err) => NodeReport::new(
            ctx.node,
            NodeOutcome::Failed {
                reason: err.to_string(),
            },
        ),
    }
}

async fn publish_release(publisher: Option<Arc<ReleasePublisher>>, ctx: &JobContext) -> NodeReport {
    let failed = |err: PublishError| {
        NodeReport::new(
            ctx.node,
            NodeOutcome::Failed {
                reason: err.to_string(),
            },
        )
    };

    let Some(publisher) = publisher else {
        return failed(PublishError::NoPublisher);
    };
    let bundle = match ReleaseBundle::assemble(&ctx.trigger, &ctx.upstream) {
        Ok(bundle) => bundle,
        Err(err) => return failed(err),
    };

    let published = publisher.publish(&bundle).await;
    let outcome = match published.clone().into_result() {
        Ok(_) => NodeOutcome::Succeeded,
        Err(err) => NodeOutcome::Failed {
            reason: err.to_string(),
        },
    };
    NodeReport {
        bundle: Some(bundle),
        release: Some(published),
        ..NodeReport::new(ctx.node, outcome)
    }
}

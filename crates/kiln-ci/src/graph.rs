//! Static job dependency graph and per-trigger node resolution.
//!
//! An edge `A -> B` means "B depends on A": A must settle before B is
//! resolved. Topological waves are computed with Kahn's algorithm so that
//! same-wave nodes can run concurrently on separate agents.
//!
//! Enablement is a pure function of the [`TriggerEvent`]; whether an enabled
//! node actually runs also depends on how its dependencies settled.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::job::JobName;
use crate::trigger::{TriggerEvent, TriggerKind};

/// Predicate deciding whether a node applies to a trigger.
pub type EnablePredicate = fn(&TriggerEvent) -> bool;

/// A node of the static graph.
#[derive(Debug, Clone)]
pub struct JobNode {
    pub name: JobName,
    /// Hard dependencies.
    pub depends_on: BTreeSet<JobName>,
    pub enabled_if: EnablePredicate,
    /// Soft-failed dependencies block this node too.
    pub requires_clean: bool,
}

impl JobNode {
    pub fn new(name: JobName, enabled_if: EnablePredicate) -> Self {
        Self {
            name,
            depends_on: BTreeSet::new(),
            enabled_if,
            requires_clean: false,
        }
    }

    pub fn after(mut self, dependencies: impl IntoIterator<Item = JobName>) -> Self {
        self.depends_on.extend(dependencies);
        self
    }

    /// Only clean successes of the dependencies let this node run.
    pub fn requiring_clean(mut self) -> Self {
        self.requires_clean = true;
        self
    }

    pub fn is_enabled(&self, trigger: &TriggerEvent) -> bool {
        (self.enabled_if)(trigger)
    }

    /// Whether a dependency that settled as `outcome` lets this node run.
    pub fn accepts(&self, outcome: &NodeOutcome) -> bool {
        if self.requires_clean {
            matches!(outcome, NodeOutcome::Succeeded)
        } else {
            outcome.satisfies_dependents()
        }
    }
}

/// Test runs for every trigger.
pub fn test_enabled(_trigger: &TriggerEvent) -> bool {
    true
}

/// Images are pushed for pushes and tags, and only with registry write access.
pub fn containerize_enabled(trigger: &TriggerEvent) -> bool {
    matches!(trigger.kind, TriggerKind::Push | TriggerKind::Tag) && trigger.registry_write
}

/// Wheels are built for every supported trigger.
pub fn build_enabled(trigger: &TriggerEvent) -> bool {
    matches!(
        trigger.kind,
        TriggerKind::Push | TriggerKind::PullRequest | TriggerKind::Tag
    )
}

/// Releases only happen for version tags.
pub fn release_enabled(trigger: &TriggerEvent) -> bool {
    trigger.is_version_tag()
}

/// How a node settled. Set once per node per trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    Succeeded,
    /// Completed, with recorded non-blocking failures.
    SoftFailed { failures: Vec<String> },
    Failed { reason: String },
    TimedOut { after_secs: u64 },
    Skipped { reason: SkipReason },
}

impl NodeOutcome {
    /// Whether ordinary dependents may proceed.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeOutcome::Succeeded | NodeOutcome::SoftFailed { .. })
    }

    /// Failures that make the whole run fail.
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, NodeOutcome::Failed { .. } | NodeOutcome::TimedOut { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Succeeded => "succeeded",
            NodeOutcome::SoftFailed { .. } => "soft_failed",
            NodeOutcome::Failed { .. } => "failed",
            NodeOutcome::TimedOut { .. } => "timed_out",
            NodeOutcome::Skipped { .. } => "skipped",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Succeeded => f.write_str("succeeded"),
            NodeOutcome::SoftFailed { failures } => {
                write!(f, "succeeded with soft failures ({})", failures.join(", "))
            }
            NodeOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            NodeOutcome::TimedOut { after_secs } => write!(f, "timed out after {after_secs}s"),
            NodeOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// Why a node did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The node's predicate rejected the trigger.
    Disabled,
    /// A hard dependency did not complete.
    DependencyNotSatisfied { dependency: JobName },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("not enabled for this trigger"),
            SkipReason::DependencyNotSatisfied { dependency } => {
                write!(f, "dependency '{dependency}' did not complete")
            }
        }
    }
}

/// Run-or-skip decision for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Run,
    Skip(SkipReason),
}

/// Decide whether `node` runs, given how its dependencies settled.
///
/// Every dependency must already be present in `settled`; an unsettled
/// dependency is treated as not satisfied.
pub fn resolve_node(
    node: &JobNode,
    trigger: &TriggerEvent,
    settled: &BTreeMap<JobName, NodeOutcome>,
) -> Resolution {
    if !node.is_enabled(trigger) {
        return Resolution::Skip(SkipReason::Disabled);
    }
    for dependency in &node.depends_on {
        let satisfied = settled
            .get(dependency)
            .map(|outcome| node.accepts(outcome))
            .unwrap_or(false);
        if !satisfied {
            return Resolution::Skip(SkipReason::DependencyNotSatisfied {
                dependency: *dependency,
            });
        }
    }
    Resolution::Run
}

/// Dry-run view of a graph for one trigger, assuming every node that runs
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub trigger: TriggerEvent,
    /// Nodes that would run, wave by wave.
    pub waves: Vec<Vec<JobName>>,
    pub skipped: BTreeMap<JobName, SkipReason>,
}

impl PipelinePlan {
    pub fn will_run(&self, job: JobName) -> bool {
        self.waves.iter().any(|wave| wave.contains(&job))
    }
}

/// Directed dependency graph over [`JobNode`]s.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    nodes: BTreeMap<JobName, JobNode>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// test -> {containerize, build-linux, build-windows} -> release
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.add_node(JobNode::new(JobName::Test, test_enabled));
        graph.add_node(
            JobNode::new(JobName::Containerize, containerize_enabled).after([JobName::Test]),
        );
        graph.add_node(JobNode::new(JobName::BuildLinux, build_enabled).after([JobName::Test]));
        graph.add_node(JobNode::new(JobName::BuildWindows, build_enabled).after([JobName::Test]));
        graph.add_node(
            JobNode::new(JobName::Release, release_enabled)
                .after([
                    JobName::Test,
                    JobName::Containerize,
                    JobName::BuildLinux,
                    JobName::BuildWindows,
                ])
                .requiring_clean(),
        );
        graph
    }

    /// Register a node. Re-registering a name replaces it.
    pub fn add_node(&mut self, node: JobNode) {
        self.nodes.insert(node.name, node);
    }

    /// Build a graph and check it with [`PipelineGraph::validate`].
    pub fn from_nodes(nodes: impl IntoIterator<Item = JobNode>) -> Result<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node);
        }
        graph.validate()?;
        Ok(graph)
    }

    pub fn node(&self, name: JobName) -> Option<&JobNode> {
        self.nodes.get(&name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every dependency is registered and there are no cycles.
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for dependency in &node.depends_on {
                if !self.nodes.contains_key(dependency) {
                    return Err(PipelineError::UnknownDependency {
                        node: node.name,
                        dependency: *dependency,
                    });
                }
            }
        }
        self.levels().map(|_| ())
    }

    /// Direct dependencies of `name`.
    pub fn dependencies_of(&self, name: JobName) -> Vec<JobName> {
        self.nodes
            .get(&name)
            .map(|node| node.depends_on.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: JobName) -> Vec<JobName> {
        self.nodes
            .values()
            .filter(|node| node.depends_on.contains(&name))
            .map(|node| node.name)
            .collect()
    }

    /// All transitive dependents of `name` (BFS over downstream edges).
    pub fn transitive_dependents_of(&self, name: JobName) -> BTreeSet<JobName> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if visited.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        visited
    }

    /// Topological waves: every node appears after all of its dependencies,
    /// and nodes in the same wave are independent of each other.
    pub fn levels(&self) -> Result<Vec<Vec<JobName>>> {
        let mut in_degree: BTreeMap<JobName, usize> = self
            .nodes
            .values()
            .map(|node| {
                let known = node
                    .depends_on
                    .iter()
                    .filter(|d| self.nodes.contains_key(*d))
                    .count();
                (node.name, known)
            })
            .collect();

        let mut wave: Vec<JobName> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !wave.is_empty() {
            placed += wave.len();
            let mut next = BTreeSet::new();
            for name in &wave {
                for dependent in self.dependents_of(*name) {
                    if let Some(deg) = in_degree.get_mut(&dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dependent);
                        }
                    }
                }
            }
            levels.push(std::mem::take(&mut wave));
            wave = next.into_iter().collect();
        }

        if placed != self.nodes.len() {
            let stuck = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name)
                .collect();
            return Err(PipelineError::DependencyCycle { nodes: stuck });
        }

        Ok(levels)
    }

    /// Resolve every node for `trigger` without executing anything.
    pub fn plan(&self, trigger: &TriggerEvent) -> Result<PipelinePlan> {
        let mut settled = BTreeMap::new();
        let mut skipped = BTreeMap::new();
        let mut waves = Vec::new();

        for level in self.levels()? {
            let mut running = Vec::new();
            for name in level {
                let Some(node) = self.nodes.get(&name) else {
                    continue;
                };
                match resolve_node(node, trigger, &settled) {
                    Resolution::Run => {
                        running.push(name);
                        settled.insert(name, NodeOutcome::Succeeded);
                    }
                    Resolution::Skip(reason) => {
                        settled.insert(
                            name,
                            NodeOutcome::Skipped {
                                reason: reason.clone(),
                            },
                        );
                        skipped.insert(name, reason);
                    }
                }
            }
            if !running.is_empty() {
                waves.push(running);
            }
        }

        Ok(PipelinePlan {
            trigger: trigger.clone(),
            waves,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(pairs: &[(JobName, NodeOutcome)]) -> BTreeMap<JobName, NodeOutcome> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_standard_graph_is_valid() {
        let graph = PipelineGraph::standard();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_standard_graph_waves() {
        let levels = PipelineGraph::standard().levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec![JobName::Test],
                vec![JobName::Containerize, JobName::BuildLinux, JobName::BuildWindows],
                vec![JobName::Release],
            ]
        );
    }

    #[test]
    fn test_transitive_dependents_of_test_is_everything_else() {
        let deps = PipelineGraph::standard().transitive_dependents_of(JobName::Test);
        assert_eq!(deps.len(), 4);
        assert!(!deps.contains(&JobName::Test));
    }

    #[test]
    fn test_release_depends_on_all_four() {
        let deps = PipelineGraph::standard().dependencies_of(JobName::Release);
        assert_eq!(deps.len(), 4);
    }

    #[test]
    fn test_cycle_detected() {
        let result = PipelineGraph::from_nodes([
            JobNode::new(JobName::Test, test_enabled).after([JobName::Release]),
            JobNode::new(JobName::Release, release_enabled).after([JobName::Test]),
        ]);
        assert!(matches!(result, Err(PipelineError::DependencyCycle { .. })));
    }

    #[test]
    fn test_unknown_dependency_detected() {
        let result = PipelineGraph::from_nodes([
            JobNode::new(JobName::Release, release_enabled).after([JobName::BuildLinux])
        ]);
        assert!(matches!(result, Err(PipelineError::UnknownDependency { .. })));
    }

    #[test]
    fn test_enablement_predicates() {
        let push = TriggerEvent::push("refs/heads/main", "abc");
        let pr = TriggerEvent::pull_request("refs/pull/1/merge", "abc");
        let tag = TriggerEvent::tag("refs/tags/v1.2.3", "abc");
        let odd_tag = TriggerEvent::tag("refs/tags/nightly", "abc");

        assert!(containerize_enabled(&push));
        assert!(containerize_enabled(&tag));
        assert!(!containerize_enabled(&pr));
        assert!(!containerize_enabled(&push.clone().with_registry_write(false)));

        assert!(build_enabled(&push) && build_enabled(&pr) && build_enabled(&tag));

        assert!(release_enabled(&tag));
        assert!(!release_enabled(&odd_tag));
        assert!(!release_enabled(&push));
        assert!(!release_enabled(&pr));
    }

    #[test]
    fn test_soft_failed_dependency_satisfies_dependents() {
        let graph = PipelineGraph::standard();
        let node = graph.node(JobName::BuildLinux).unwrap();
        let settled = outcomes(&[(
            JobName::Test,
            NodeOutcome::SoftFailed {
                failures: vec!["python-tests".to_string()],
            },
        )]);
        let trigger = TriggerEvent::pull_request("refs/pull/1/merge", "abc");
        assert_eq!(resolve_node(node, &trigger, &settled), Resolution::Run);
    }

    #[test]
    fn test_soft_failed_test_blocks_release() {
        let graph = PipelineGraph::standard();
        let node = graph.node(JobName::Release).unwrap();
        assert!(node.requires_clean);
        let settled = outcomes(&[
            (
                JobName::Test,
                NodeOutcome::SoftFailed {
                    failures: vec!["python-tests".to_string()],
                },
            ),
            (JobName::Containerize, NodeOutcome::Succeeded),
            (JobName::BuildLinux, NodeOutcome::Succeeded),
            (JobName::BuildWindows, NodeOutcome::Succeeded),
        ]);
        let trigger = TriggerEvent::tag("refs/tags/v1.2.3", "abc");
        assert_eq!(
            resolve_node(node, &trigger, &settled),
            Resolution::Skip(SkipReason::DependencyNotSatisfied {
                dependency: JobName::Test
            })
        );
    }

    #[test]
    fn test_failed_dependency_skips_dependent() {
        let graph = PipelineGraph::standard();
        let node = graph.node(JobName::BuildWindows).unwrap();
        let settled = outcomes(&[(
            JobName::Test,
            NodeOutcome::Failed {
                reason: "format".to_string(),
            },
        )]);
        let trigger = TriggerEvent::push("refs/heads/main", "abc");
        assert_eq!(
            resolve_node(node, &trigger, &settled),
            Resolution::Skip(SkipReason::DependencyNotSatisfied {
                dependency: JobName::Test
            })
        );
    }

    #[test]
    fn test_plan_for_pull_request_never_releases() {
        let plan = PipelineGraph::standard()
            .plan(&TriggerEvent::pull_request("refs/pull/1/merge", "abc"))
            .unwrap();
        assert!(plan.will_run(JobName::Test));
        assert!(plan.will_run(JobName::BuildLinux));
        assert!(plan.will_run(JobName::BuildWindows));
        assert!(!plan.will_run(JobName::Containerize));
        assert!(!plan.will_run(JobName::Release));
        assert_eq!(plan.skipped[&JobName::Release], SkipReason::Disabled);
    }

    #[test]
    fn test_plan_for_version_tag_runs_everything() {
        let plan = PipelineGraph::standard()
            .plan(&TriggerEvent::tag("refs/tags/v1.2.3", "abc"))
            .unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_plan_for_push_skips_release_only() {
        let plan = PipelineGraph::standard()
            .plan(&TriggerEvent::push("refs/heads/main", "abc"))
            .unwrap();
        assert!(plan.will_run(JobName::Containerize));
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped.contains_key(&JobName::Release));
    }
}

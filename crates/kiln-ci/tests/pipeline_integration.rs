//! Integration tests for the pipeline executor with in-memory fakes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_ci::fakes::{FakeJobRunner, MemoryAssetHost, MemoryRegistry};
use kiln_ci::jobs::DEFAULT_IMAGE_REPOSITORY;
use kiln_ci::{
    JobName, NodeOutcome, PipelineExecutor, PipelineGraph, Platform, ReleasePublisher, SkipReason,
    TriggerEvent,
};

struct Harness {
    executor: PipelineExecutor,
    jobs: Arc<FakeJobRunner>,
    host: Arc<MemoryAssetHost>,
    registry: Arc<MemoryRegistry>,
}

fn harness(jobs: FakeJobRunner) -> Harness {
    harness_with(jobs, MemoryAssetHost::new())
}

fn harness_with(jobs: FakeJobRunner, host: MemoryAssetHost) -> Harness {
    let jobs = Arc::new(jobs);
    let host = Arc::new(host);
    let registry = Arc::new(MemoryRegistry::new());
    let publisher = Arc::new(ReleasePublisher::new(host.clone(), registry.clone()));
    let executor =
        PipelineExecutor::new(PipelineGraph::standard(), jobs.clone()).with_publisher(publisher);
    Harness {
        executor,
        jobs,
        host,
        registry,
    }
}

fn version_tag() -> TriggerEvent {
    TriggerEvent::tag("refs/tags/v1.2.3", "9f8e7d6c5b4a")
}

/// Test: a pull request never reaches release, whatever the other nodes do
#[tokio::test]
async fn test_pull_request_never_releases() {
    let h = harness(FakeJobRunner::new());
    let report = h
        .executor
        .run(TriggerEvent::pull_request("refs/pull/42/merge", "abc123"))
        .await
        .expect("pipeline failed");

    assert!(report.success());
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
    assert!(matches!(
        report.outcome(JobName::Containerize),
        Some(NodeOutcome::Skipped { .. })
    ));
    assert!(report.release_bundle().is_none());
    assert!(!h.jobs.runs().contains(&JobName::Release));
    assert!(!h.host.has_release("refs/pull/42/merge"));
}

/// Test: a pull request with soft-failed tests builds wheels and still never releases
#[tokio::test]
async fn test_pull_request_with_soft_failed_tests_never_releases() {
    let h = harness(FakeJobRunner::new().soft_failing(JobName::Test, "python-tests"));
    let report = h
        .executor
        .run(TriggerEvent::pull_request("refs/pull/42/merge", "abc123"))
        .await
        .expect("pipeline failed");

    assert!(report.success());
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert_eq!(report.outcome(JobName::BuildWindows), Some(&NodeOutcome::Succeeded));
    assert_eq!(
        report.outcome(JobName::Containerize),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
    assert!(report.release_bundle().is_none());
}

/// Test: a pull request with a failed build reports the failure but release stays disabled
#[tokio::test]
async fn test_pull_request_with_failed_build_never_releases() {
    let h = harness(FakeJobRunner::new().hard_failing(JobName::BuildWindows, "cibuildwheel"));
    let report = h
        .executor
        .run(TriggerEvent::pull_request("refs/pull/42/merge", "abc123"))
        .await
        .expect("pipeline failed");

    assert!(!report.success());
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert!(matches!(
        report.outcome(JobName::BuildWindows),
        Some(NodeOutcome::Failed { .. })
    ));
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
}

/// Test: version tag with every node succeeding publishes both platforms and two image tags
#[tokio::test]
async fn test_version_tag_publishes_release() {
    let h = harness(FakeJobRunner::new());
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    assert!(report.success(), "pipeline should succeed: {report:?}");
    assert_eq!(report.outcome(JobName::Release), Some(&NodeOutcome::Succeeded));

    let bundle = report.release_bundle().expect("release bundle");
    assert_eq!(bundle.tag, "v1.2.3");
    assert!(bundle.wheels.contains_key(&Platform::Linux));
    assert!(bundle.wheels.contains_key(&Platform::Windows));
    assert_eq!(h.host.uploaded("v1.2.3").len(), 2);

    let release = report.nodes[&JobName::Release]
        .release
        .as_ref()
        .expect("publish report");
    let tags: Vec<&str> = release.image_tags.iter().map(|i| i.tag.as_str()).collect();
    assert_eq!(tags, vec!["v1.2.3", "latest"]);

    let repository = &bundle.image.repository;
    let versioned = h.registry.digest_of(&format!("{repository}:v1.2.3"));
    let latest = h.registry.digest_of(&format!("{repository}:latest"));
    assert!(versioned.is_some());
    assert_eq!(versioned, latest);
    assert_eq!(versioned, bundle.image.digest);
}

/// Test: soft test failure still lets both build nodes run to completion
#[tokio::test]
async fn test_soft_test_failure_does_not_block_builds() {
    let h = harness(FakeJobRunner::new().soft_failing(JobName::Test, "python-tests"));
    let report = h
        .executor
        .run(TriggerEvent::push("refs/heads/main", "abc123"))
        .await
        .expect("pipeline failed");

    assert_eq!(
        report.outcome(JobName::Test),
        Some(&NodeOutcome::SoftFailed {
            failures: vec!["python-tests".to_string()]
        })
    );
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert_eq!(report.outcome(JobName::BuildWindows), Some(&NodeOutcome::Succeeded));
    assert!(report.success());
}

/// Test: soft-failed tests still build every artifact but block release
#[tokio::test]
async fn test_soft_test_failure_blocks_release() {
    let h = harness(FakeJobRunner::new().soft_failing(JobName::Test, "python-tests"));
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    assert!(matches!(
        report.outcome(JobName::Test),
        Some(NodeOutcome::SoftFailed { .. })
    ));
    assert_eq!(report.outcome(JobName::Containerize), Some(&NodeOutcome::Succeeded));
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert_eq!(report.outcome(JobName::BuildWindows), Some(&NodeOutcome::Succeeded));
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::DependencyNotSatisfied {
                dependency: JobName::Test
            }
        })
    );
    assert!(report.release_bundle().is_none());
    assert!(!h.host.has_release("v1.2.3"));
    let latest = format!("{DEFAULT_IMAGE_REPOSITORY}:latest");
    assert!(h.registry.digest_of(&latest).is_none());
}

/// Test: a failing format check blocks every downstream node
#[tokio::test]
async fn test_hard_check_failure_skips_dependents() {
    let h = harness(FakeJobRunner::new().hard_failing(JobName::Test, "format"));
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    assert!(!report.success());
    assert_eq!(report.exit_code(), 1);
    assert_eq!(h.jobs.runs(), vec![JobName::Test]);
    assert!(matches!(
        report.outcome(JobName::Test),
        Some(NodeOutcome::Failed { reason }) if reason.contains("format")
    ));
    for node in [JobName::Containerize, JobName::BuildLinux, JobName::BuildWindows] {
        assert_eq!(
            report.outcome(node),
            Some(&NodeOutcome::Skipped {
                reason: SkipReason::DependencyNotSatisfied {
                    dependency: JobName::Test
                }
            })
        );
    }
    assert!(matches!(
        report.outcome(JobName::Release),
        Some(NodeOutcome::Skipped { .. })
    ));
    assert!(!h.host.has_release("v1.2.3"));
}

/// Test: failing stderr is kept verbatim in the node report
#[tokio::test]
async fn test_failed_step_output_is_preserved() {
    let h = harness(FakeJobRunner::new().hard_failing(JobName::Test, "lint"));
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    let failed: Vec<_> = report.nodes[&JobName::Test].failed_steps().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].stderr, "lint: exit 1\n");
}

/// Test: a failed containerize blocks release but not the builds
#[tokio::test]
async fn test_containerize_failure_blocks_release_only() {
    let h = harness(FakeJobRunner::new().hard_failing(JobName::Containerize, "docker-push"));
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert_eq!(report.outcome(JobName::BuildWindows), Some(&NodeOutcome::Succeeded));
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::DependencyNotSatisfied {
                dependency: JobName::Containerize
            }
        })
    );
}

/// Test: a node exceeding its wall-clock ceiling times out and blocks release
#[tokio::test]
async fn test_node_timeout() {
    let jobs = FakeJobRunner::new().delayed(JobName::BuildWindows, Duration::from_secs(30));
    let h = harness(jobs);
    let executor = h.executor.with_node_timeout(Duration::from_millis(200));

    let start = Instant::now();
    let report = executor.run(version_tag()).await.expect("pipeline failed");

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        report.outcome(JobName::BuildWindows),
        Some(NodeOutcome::TimedOut { .. })
    ));
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert!(matches!(
        report.outcome(JobName::Release),
        Some(NodeOutcome::Skipped { .. })
    ));
    assert!(!report.success());
}

/// Test: same-wave nodes run concurrently
#[tokio::test]
async fn test_independent_nodes_run_concurrently() {
    let delay = Duration::from_millis(400);
    let jobs = FakeJobRunner::new()
        .delayed(JobName::Containerize, delay)
        .delayed(JobName::BuildLinux, delay)
        .delayed(JobName::BuildWindows, delay);
    let h = harness(jobs);

    let start = Instant::now();
    let report = h
        .executor
        .run(TriggerEvent::push("refs/heads/main", "abc123"))
        .await
        .expect("pipeline failed");

    assert!(report.success());
    assert!(
        start.elapsed() < Duration::from_millis(1100),
        "wave took {:?}",
        start.elapsed()
    );
}

/// Test: every node runs at most once per trigger
#[tokio::test]
async fn test_no_node_runs_twice() {
    let h = harness(FakeJobRunner::new());
    h.executor.run(version_tag()).await.expect("pipeline failed");

    let runs = h.jobs.runs();
    let unique: BTreeSet<JobName> = runs.iter().copied().collect();
    assert_eq!(runs.len(), unique.len());
    // Release is published by the executor, not the job runner.
    assert_eq!(unique.len(), 4);
    assert_eq!(runs[0], JobName::Test);
}

/// Test: dependents receive exactly their dependencies' artifacts
#[tokio::test]
async fn test_dependents_see_upstream_artifacts() {
    let h = harness(FakeJobRunner::new());
    h.executor
        .run(TriggerEvent::push("refs/heads/main", "abc123"))
        .await
        .expect("pipeline failed");

    assert_eq!(h.jobs.upstream_seen(JobName::Test), Some(BTreeSet::new()));
    assert_eq!(
        h.jobs.upstream_seen(JobName::BuildLinux),
        Some(BTreeSet::from([JobName::Test]))
    );
}

/// Test: push without registry write skips containerize but still builds
#[tokio::test]
async fn test_push_without_registry_write() {
    let h = harness(FakeJobRunner::new());
    let trigger = TriggerEvent::push("refs/heads/main", "abc123").with_registry_write(false);
    let report = h.executor.run(trigger).await.expect("pipeline failed");

    assert_eq!(
        report.outcome(JobName::Containerize),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
    assert_eq!(report.outcome(JobName::BuildLinux), Some(&NodeOutcome::Succeeded));
    assert!(report.success());
}

/// Test: one failed upload fails the release but the other asset still lands
#[tokio::test]
async fn test_partial_upload_failure_fails_release() {
    let host = MemoryAssetHost::new()
        .failing_asset("kiln_native-1.2.3-cp312-abi3-win_amd64.whl");
    let h = harness_with(FakeJobRunner::new(), host);
    let report = h.executor.run(version_tag()).await.expect("pipeline failed");

    assert!(!report.success());
    assert!(matches!(
        report.outcome(JobName::Release),
        Some(NodeOutcome::Failed { reason }) if reason.contains("1 of 5")
    ));
    assert_eq!(
        h.host.uploaded("v1.2.3"),
        vec!["kiln_native-1.2.3-cp312-abi3-manylinux_2_28_x86_64.whl".to_string()]
    );
    let release = report.nodes[&JobName::Release].release.as_ref().unwrap();
    assert_eq!(release.image_tags.len(), 2);
}

/// Test: a non-version tag runs everything except release
#[tokio::test]
async fn test_non_version_tag_skips_release() {
    let h = harness(FakeJobRunner::new());
    let report = h
        .executor
        .run(TriggerEvent::tag("refs/tags/nightly", "abc123"))
        .await
        .expect("pipeline failed");

    assert_eq!(report.executed().len(), 4);
    assert_eq!(
        report.outcome(JobName::Release),
        Some(&NodeOutcome::Skipped {
            reason: SkipReason::Disabled
        })
    );
}

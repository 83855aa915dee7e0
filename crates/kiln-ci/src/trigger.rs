//! Trigger events that drive node selection.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// `v` followed by a semantic version, with optional pre-release and build
/// metadata.
pub const VERSION_TAG_PATTERN: &str =
    r"^v(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$";

/// Variable consulted for registry write permission.
pub const REGISTRY_WRITE_ENV: &str = "KILN_REGISTRY_WRITE";

fn version_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(VERSION_TAG_PATTERN).expect("version tag pattern is valid"))
}

/// Whether `name` (a short ref, e.g. `v1.2.3`) is a version tag.
pub fn is_version_tag(name: &str) -> bool {
    version_tag_regex().is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Tag,
}

impl TriggerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Tag => "tag",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            "tag" => Ok(TriggerKind::Tag),
            other => Err(PipelineError::UnsupportedEvent(other.to_string())),
        }
    }
}

/// The version-control event a pipeline run reacts to. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit_sha: String,
    /// Whether the run may push to the container registry.
    pub registry_write: bool,
}

impl TriggerEvent {
    /// Registry write defaults to allowed except for pull requests.
    pub fn new(
        kind: TriggerKind,
        git_ref: impl Into<String>,
        commit_sha: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            commit_sha: commit_sha.into(),
            registry_write: kind != TriggerKind::PullRequest,
        }
    }

    pub fn push(git_ref: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(TriggerKind::Push, git_ref, commit_sha)
    }

    pub fn pull_request(git_ref: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(TriggerKind::PullRequest, git_ref, commit_sha)
    }

    pub fn tag(git_ref: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self::new(TriggerKind::Tag, git_ref, commit_sha)
    }

    pub fn with_registry_write(mut self, allowed: bool) -> Self {
        self.registry_write = allowed;
        self
    }

    /// The ref without its `refs/tags/`, `refs/heads/` or `refs/pull/` prefix.
    pub fn ref_name(&self) -> &str {
        ["refs/tags/", "refs/heads/", "refs/pull/"]
            .iter()
            .find_map(|prefix| self.git_ref.strip_prefix(prefix))
            .unwrap_or(&self.git_ref)
    }

    /// A tag event whose ref is a version tag.
    pub fn is_version_tag(&self) -> bool {
        self.kind == TriggerKind::Tag && is_version_tag(self.ref_name())
    }

    /// First seven characters of the commit.
    pub fn short_sha(&self) -> &str {
        let end = self
            .commit_sha
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.commit_sha.len());
        &self.commit_sha[..end]
    }

    /// Derive the trigger from GitHub Actions variables.
    ///
    /// `GITHUB_EVENT_NAME` selects push or pull request; a push whose
    /// `GITHUB_REF` is under `refs/tags/` becomes a tag event.
    /// `KILN_REGISTRY_WRITE` overrides the default registry permission.
    pub fn from_github_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let event = lookup("GITHUB_EVENT_NAME")
            .ok_or(PipelineError::MissingTriggerField("GITHUB_EVENT_NAME"))?;
        let git_ref = lookup("GITHUB_REF").ok_or(PipelineError::MissingTriggerField("GITHUB_REF"))?;
        let commit_sha =
            lookup("GITHUB_SHA").ok_or(PipelineError::MissingTriggerField("GITHUB_SHA"))?;

        let kind = match event.as_str() {
            "push" if git_ref.starts_with("refs/tags/") => TriggerKind::Tag,
            "push" => TriggerKind::Push,
            "pull_request" | "pull_request_target" => TriggerKind::PullRequest,
            other => return Err(PipelineError::UnsupportedEvent(other.to_string())),
        };

        let mut trigger = Self::new(kind, git_ref, commit_sha);
        if let Some(flag) = lookup(REGISTRY_WRITE_ENV) {
            trigger.registry_write = matches!(flag.trim(), "1" | "true" | "yes");
        }
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_version_tag_pattern() {
        assert!(is_version_tag("v1.2.3"));
        assert!(is_version_tag("v0.10.0-rc.1"));
        assert!(is_version_tag("v2.0.0+build.5"));
        assert!(!is_version_tag("1.2.3"));
        assert!(!is_version_tag("v1.2"));
        assert!(!is_version_tag("v01.2.3"));
        assert!(!is_version_tag("release-1"));
    }

    #[test]
    fn test_ref_name_strips_prefix() {
        let trigger = TriggerEvent::tag("refs/tags/v1.2.3", "abc");
        assert_eq!(trigger.ref_name(), "v1.2.3");
        assert!(trigger.is_version_tag());

        let trigger = TriggerEvent::tag("v1.2.3", "abc");
        assert_eq!(trigger.ref_name(), "v1.2.3");
    }

    #[test]
    fn test_push_with_version_ref_is_not_version_tag() {
        assert!(!TriggerEvent::push("v1.2.3", "abc").is_version_tag());
    }

    #[test]
    fn test_pull_request_has_no_registry_write() {
        assert!(!TriggerEvent::pull_request("refs/pull/7/merge", "abc").registry_write);
        assert!(TriggerEvent::push("refs/heads/main", "abc").registry_write);
    }

    #[test]
    fn test_short_sha() {
        let trigger = TriggerEvent::push("main", "0123456789abcdef");
        assert_eq!(trigger.short_sha(), "0123456");
        assert_eq!(TriggerEvent::push("main", "abc").short_sha(), "abc");
    }

    #[test]
    fn test_from_github_env_tag_push() {
        let trigger = TriggerEvent::from_github_env(env(&[
            ("GITHUB_EVENT_NAME", "push"),
            ("GITHUB_REF", "refs/tags/v1.2.3"),
            ("GITHUB_SHA", "deadbeef"),
        ]))
        .unwrap();
        assert_eq!(trigger.kind, TriggerKind::Tag);
        assert!(trigger.is_version_tag());
        assert!(trigger.registry_write);
    }

    #[test]
    fn test_from_github_env_pull_request_and_override() {
        let trigger = TriggerEvent::from_github_env(env(&[
            ("GITHUB_EVENT_NAME", "pull_request"),
            ("GITHUB_REF", "refs/pull/9/merge"),
            ("GITHUB_SHA", "deadbeef"),
        ]))
        .unwrap();
        assert_eq!(trigger.kind, TriggerKind::PullRequest);
        assert!(!trigger.registry_write);

        let trigger = TriggerEvent::from_github_env(env(&[
            ("GITHUB_EVENT_NAME", "push"),
            ("GITHUB_REF", "refs/heads/main"),
            ("GITHUB_SHA", "deadbeef"),
            (REGISTRY_WRITE_ENV, "false"),
        ]))
        .unwrap();
        assert!(!trigger.registry_write);
    }

    #[test]
    fn test_from_github_env_rejects_unknown_event() {
        let err = TriggerEvent::from_github_env(env(&[
            ("GITHUB_EVENT_NAME", "schedule"),
            ("GITHUB_REF", "refs/heads/main"),
            ("GITHUB_SHA", "deadbeef"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedEvent(_)));
    }

    #[test]
    fn test_from_github_env_requires_sha() {
        let err = TriggerEvent::from_github_env(env(&[
            ("GITHUB_EVENT_NAME", "push"),
            ("GITHUB_REF", "refs/heads/main"),
        ]))
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingTriggerField("GITHUB_SHA")));
    }

    #[test]
    fn test_trigger_serialises_ref_field() {
        let json = serde_json::to_value(TriggerEvent::tag("v1.0.0", "abc")).unwrap();
        assert_eq!(json["ref"], "v1.0.0");
        assert_eq!(json["kind"], "tag");
    }
}

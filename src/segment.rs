//! Data model (spec.md §3): `Segment`, `ExecutionContext`, `FlowNode`,
//! `Ride`, `SegmentResult`, and the small value types they're built from.

use crate::artifact::ArtifactStore;
use crate::logger::SegmentLogger;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Terminal outcome of running one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SegmentStatus {
    Success,
    Failure,
    Skipped,
    Timeout,
}

impl SegmentStatus {
    pub fn is_success(self) -> bool {
        matches!(self, SegmentStatus::Success)
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SegmentStatus::Success => "SUCCESS",
            SegmentStatus::Failure => "FAILURE",
            SegmentStatus::Skipped => "SKIPPED",
            SegmentStatus::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

/// An error raised by a segment's `execute`/`condition`/hook body. Carries a
/// short type tag so `retryOn` can do its substring match against something
/// resembling an exception class name (spec.md §4.5, §9 Open Questions)
/// even though Rust has no class hierarchy to inspect.
#[derive(Debug, Clone)]
pub struct SegmentError {
    pub kind: String,
    pub message: String,
}

impl SegmentError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new("RuntimeException", message)
    }
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SegmentError {}

impl From<crate::error::RunnerError> for SegmentError {
    fn from(e: crate::error::RunnerError) -> Self {
        SegmentError::new(e.type_tag(), e.to_string())
    }
}

pub type SegmentFuture = BoxFuture<'static, std::result::Result<(), SegmentError>>;
pub type ConditionFn = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;
pub type ExecuteFn = Arc<dyn Fn(ExecutionContext) -> SegmentFuture + Send + Sync>;
pub type OnSuccessFn = Arc<dyn Fn(&ExecutionContext) -> SegmentFuture + Send + Sync>;
pub type OnFailureFn = Arc<dyn Fn(&ExecutionContext, &SegmentError) -> SegmentFuture + Send + Sync>;
pub type OnCompleteFn = Arc<dyn Fn(&ExecutionContext, SegmentStatus) -> SegmentFuture + Send + Sync>;

/// An immutable unit of work. Closures are modeled as `Arc<dyn Fn>`
/// trait-object callbacks (spec.md §9): the scheduler never inspects their
/// implementation, only invokes them with the context.
#[derive(Clone)]
pub struct Segment {
    pub name: String,
    pub description: Option<String>,
    pub depends_on: Vec<String>,
    pub condition: Option<ConditionFn>,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_on: Vec<String>,
    pub outputs: HashMap<String, String>,
    pub execute: ExecuteFn,
    pub on_success: Option<OnSuccessFn>,
    pub on_failure: Option<OnFailureFn>,
    pub on_complete: Option<OnCompleteFn>,
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Segment {
    /// Builder seeded with a no-op body; callers set `execute` via
    /// `with_execute` before scheduling. Mirrors the config-time validation
    /// in spec.md §7: blank name, negative retry knobs are caller errors
    /// surfaced by `validate`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            depends_on: Vec::new(),
            condition: None,
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            retry_on: Vec::new(),
            outputs: HashMap::new(),
            execute: Arc::new(|_ctx| Box::pin(async { Ok(()) })),
            on_success: None,
            on_failure: None,
            on_complete: None,
        }
    }

    pub fn with_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> SegmentFuture + Send + Sync + 'static,
    {
        self.execute = Arc::new(f);
        self
    }

    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(f));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_retry_on(mut self, substrings: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.retry_on = substrings.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), path.into());
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> SegmentFuture + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionContext, &SegmentError) -> SegmentFuture + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExecutionContext, SegmentStatus) -> SegmentFuture + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// A clone of this segment with `overrides` layered on top — a
    /// `SegmentRef`'s per-flow `timeout`/`max_retries` override the shared
    /// definition for this one ride invocation without mutating it (spec.md
    /// §3 FlowNode: "`SegmentRef(name, overrides?)`").
    pub fn with_overrides(&self, overrides: &SegmentOverrides) -> Self {
        let mut segment = self.clone();
        if let Some(timeout) = overrides.timeout {
            segment.timeout = Some(timeout);
        }
        if let Some(max_retries) = overrides.max_retries {
            segment.max_retries = max_retries;
        }
        segment
    }

    /// Config-time validation (spec.md §7): blank name, negative retry
    /// knobs, non-positive timeout. Scheduling never begins if this fails.
    pub fn validate(&self) -> std::result::Result<(), crate::error::RunnerError> {
        if self.name.trim().is_empty() {
            return Err(crate::error::RunnerError::BlankSegmentName);
        }
        if let Some(t) = self.timeout {
            if t.is_zero() {
                return Err(crate::error::RunnerError::NonPositiveTimeout(self.name.clone()));
            }
        }
        Ok(())
    }
}

/// Per-segment, per-invocation bundle of environment and services.
/// Cloning produces a per-segment logger-bound copy; the artifact store and
/// environment map are shared (spec.md §3 Ownership).
#[derive(Clone)]
pub struct ExecutionContext {
    pub branch: String,
    pub commit_sha: String,
    pub environment: Arc<HashMap<String, String>>,
    pub workspace: PathBuf,
    pub artifacts: Arc<ArtifactStore>,
    pub logger: Option<Arc<SegmentLogger>>,
}

impl ExecutionContext {
    pub fn new(
        branch: impl Into<String>,
        commit_sha: impl Into<String>,
        environment: HashMap<String, String>,
        workspace: PathBuf,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            branch: branch.into(),
            commit_sha: commit_sha.into(),
            environment: Arc::new(environment),
            workspace,
            artifacts,
            logger: None,
        }
    }

    /// A copy bound to a specific segment's logger; the underlying
    /// environment map and artifact store remain shared.
    pub fn with_logger(&self, logger: Arc<SegmentLogger>) -> Self {
        let mut ctx = self.clone();
        ctx.logger = Some(logger);
        ctx
    }

    /// A copy with `overrides` layered on top of the existing environment
    /// map (overrides win on key collision). Used once per ride invocation
    /// to apply a `Ride`'s global environment overrides (spec.md §3) before
    /// any segment runs; the rest of the context is shared as usual.
    pub fn with_environment_overrides(&self, overrides: &HashMap<String, String>) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let mut merged = (*self.environment).clone();
        for (k, v) in overrides {
            merged.insert(k.clone(), v.clone());
        }
        let mut ctx = self.clone();
        ctx.environment = Arc::new(merged);
        ctx
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }

    /// True when the environment matches any recognized CI provider
    /// (spec.md §6): `CI=true`, or a platform-specific variable being
    /// `true` (case-insensitive), or `JENKINS_HOME`/`TEAMCITY_VERSION`
    /// being merely non-empty.
    pub fn is_ci(&self) -> bool {
        let truthy = |name: &str| {
            self.env(name)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let non_empty = |name: &str| self.env(name).map(|v| !v.is_empty()).unwrap_or(false);

        truthy("CI")
            || truthy("GITHUB_ACTIONS")
            || truthy("GITLAB_CI")
            || truthy("CIRCLECI")
            || truthy("TRAVIS")
            || truthy("BUILDKITE")
            || non_empty("JENKINS_HOME")
            || non_empty("TEAMCITY_VERSION")
    }

    pub fn run_process(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
        masker: &crate::secret::SecretMasker,
    ) -> impl std::future::Future<Output = crate::error::Result<crate::process::ProcessOutput>> + '_ {
        crate::process::run(
            argv,
            Some(self.workspace.as_path()),
            &self.environment,
            timeout,
            masker,
            self.logger.as_deref(),
        )
    }
}

/// One override a `Ride`'s flow may apply to a referenced segment, without
/// mutating the shared `Segment` definition itself.
#[derive(Debug, Clone, Default)]
pub struct SegmentOverrides {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

/// Tagged tree describing which segments to run and in what composition
/// (spec.md §3). Matched exhaustively at every traversal site — no
/// inheritance hierarchy.
#[derive(Debug, Clone)]
pub enum FlowNode {
    SegmentRef(String, Option<SegmentOverrides>),
    Sequential(Vec<FlowNode>),
    Parallel(Vec<FlowNode>),
}

impl FlowNode {
    /// Collect every segment name referenced anywhere in this flow.
    pub fn segment_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, out: &mut Vec<String>) {
        match self {
            FlowNode::SegmentRef(name, _) => out.push(name.clone()),
            FlowNode::Sequential(children) | FlowNode::Parallel(children) => {
                for child in children {
                    child.collect_names(out);
                }
            }
        }
    }

    /// Collect per-flow overrides keyed by segment name (spec.md §3
    /// `SegmentRef(name, overrides?)`). A name referenced more than once
    /// with an override takes the last one encountered in a pre-order walk.
    pub fn overrides_by_name(&self) -> HashMap<String, SegmentOverrides> {
        let mut out = HashMap::new();
        self.collect_overrides(&mut out);
        out
    }

    fn collect_overrides(&self, out: &mut HashMap<String, SegmentOverrides>) {
        match self {
            FlowNode::SegmentRef(name, Some(overrides)) => {
                out.insert(name.clone(), overrides.clone());
            }
            FlowNode::SegmentRef(_, None) => {}
            FlowNode::Sequential(children) | FlowNode::Parallel(children) => {
                for child in children {
                    child.collect_overrides(out);
                }
            }
        }
    }

    /// Structural validation: `Sequential`/`Parallel` must have at least one
    /// child (spec.md §3 Invariants). Spec §7 classifies an empty block as a
    /// **graph-validation** error, not a config-time one — "the scheduler
    /// still returns a well-formed result" — so this returns plain messages
    /// for `DependencyGraph::validate` to fold into its `ValidationReport`
    /// rather than an `Err` that would abort scheduling outright.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        self.collect_structural_errors(&mut errors);
        errors
    }

    fn collect_structural_errors(&self, out: &mut Vec<String>) {
        match self {
            FlowNode::SegmentRef(_, _) => {}
            FlowNode::Sequential(children) => {
                if children.is_empty() {
                    out.push("sequential flow block must have at least one child".to_string());
                }
                for child in children {
                    child.collect_structural_errors(out);
                }
            }
            FlowNode::Parallel(children) => {
                if children.is_empty() {
                    out.push("parallel flow block must have at least one child".to_string());
                }
                for child in children {
                    child.collect_structural_errors(out);
                }
            }
        }
    }
}

/// A named composition of segments (spec.md §3).
pub struct Ride {
    pub name: String,
    pub flow: FlowNode,
    pub environment: HashMap<String, String>,
    pub max_concurrency: Option<usize>,
    /// Caller-invoked hook when `SchedulerResult::is_success` is false
    /// (spec.md §9 Open Questions — not called by the scheduler itself).
    pub on_failure: Option<Arc<dyn Fn(&crate::scheduler::SchedulerResult) + Send + Sync>>,
}

impl Ride {
    pub fn new(name: impl Into<String>, flow: FlowNode) -> Self {
        Self {
            name: name.into(),
            flow,
            environment: HashMap::new(),
            max_concurrency: None,
            on_failure: None,
        }
    }

    /// Config-time validation only: blank name, non-positive concurrency
    /// (spec.md §7 — these prevent scheduling outright, the scheduler never
    /// runs). Structural flow errors (an empty `Sequential`/`Parallel`
    /// block) are a graph-validation concern instead; see
    /// `FlowNode::structural_errors` and `DependencyGraph::validate`.
    pub fn validate(&self) -> std::result::Result<(), crate::error::RunnerError> {
        if self.name.trim().is_empty() {
            return Err(crate::error::RunnerError::BlankSegmentName);
        }
        if let Some(c) = self.max_concurrency {
            if c == 0 {
                return Err(crate::error::RunnerError::NonPositiveConcurrency(0));
            }
        }
        Ok(())
    }
}

/// Per-segment outcome (spec.md §3). Created once per segment per
/// invocation; immutable after the scheduler writes it.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub segment_name: String,
    pub status: SegmentStatus,
    pub message: Option<String>,
    pub error: Option<String>,
    pub failure_cause: Option<String>,
    pub duration_ms: u64,
    pub log_output: String,
}

impl SegmentResult {
    pub fn success(segment_name: impl Into<String>, duration_ms: u64, log_output: String) -> Self {
        Self {
            segment_name: segment_name.into(),
            status: SegmentStatus::Success,
            message: None,
            error: None,
            failure_cause: None,
            duration_ms,
            log_output,
        }
    }

    pub fn skipped(segment_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            status: SegmentStatus::Skipped,
            message: Some(reason.into()),
            error: None,
            failure_cause: None,
            duration_ms: 0,
            log_output: String::new(),
        }
    }

    pub fn failure(
        segment_name: impl Into<String>,
        error: &SegmentError,
        duration_ms: u64,
        log_output: String,
    ) -> Self {
        Self {
            segment_name: segment_name.into(),
            status: SegmentStatus::Failure,
            message: None,
            error: Some(error.message.clone()),
            failure_cause: Some(error.kind.clone()),
            duration_ms,
            log_output,
        }
    }

    pub fn timeout(segment_name: impl Into<String>, timeout: Duration, duration_ms: u64, log_output: String) -> Self {
        Self {
            segment_name: segment_name.into(),
            status: SegmentStatus::Timeout,
            message: None,
            error: Some(format!("segment exceeded configured timeout of {timeout:?}")),
            failure_cause: None,
            duration_ms,
            log_output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_collects_nested_segment_names() {
        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::Parallel(vec![
                FlowNode::SegmentRef("b".into(), None),
                FlowNode::SegmentRef("c".into(), None),
            ]),
        ]);
        let mut names = flow.segment_names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_parallel_block_is_a_structural_error_not_a_validate_err() {
        // Spec §7: an empty block is a graph-validation error, not a
        // config-time one, so it surfaces as a message for the dependency
        // graph to fold in, never as an `Err` from `Ride::validate`.
        let flow = FlowNode::Parallel(vec![]);
        assert_eq!(flow.structural_errors(), vec!["parallel flow block must have at least one child"]);

        let ride = Ride::new("empty-block", flow);
        assert!(ride.validate().is_ok());
    }

    #[test]
    fn empty_sequential_block_is_flagged_even_when_nested() {
        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::Sequential(vec![]),
        ]);
        assert_eq!(flow.structural_errors(), vec!["sequential flow block must have at least one child"]);
    }

    #[test]
    fn blank_segment_name_fails_validation() {
        let seg = Segment::new("   ");
        assert!(seg.validate().is_err());
    }

    #[test]
    fn is_ci_detects_generic_ci_flag() {
        let store = Arc::new(crate::artifact::ArtifactStore::new(std::env::temp_dir().join("kite-test-artifacts-ctx")));
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());
        let ctx = ExecutionContext::new("main", "abc123", env, PathBuf::from("."), store);
        assert!(ctx.is_ci());
    }

    #[test]
    fn is_ci_treats_jenkins_home_nonempty_as_ci_without_true() {
        let store = Arc::new(crate::artifact::ArtifactStore::new(std::env::temp_dir().join("kite-test-artifacts-ctx2")));
        let mut env = HashMap::new();
        env.insert("JENKINS_HOME".to_string(), "/var/jenkins_home".to_string());
        let ctx = ExecutionContext::new("main", "abc123", env, PathBuf::from("."), store);
        assert!(ctx.is_ci());
    }

    #[test]
    fn is_ci_false_when_no_markers_present() {
        let store = Arc::new(crate::artifact::ArtifactStore::new(std::env::temp_dir().join("kite-test-artifacts-ctx3")));
        let ctx = ExecutionContext::new("main", "abc123", HashMap::new(), PathBuf::from("."), store);
        assert!(!ctx.is_ci());
    }
}

//! Ride Scheduler (C6): walks a validated `Ride`'s flow either strictly in
//! topological order or level-by-level with bounded concurrency, propagating
//! cascading skips, and assembling the final `SchedulerResult` (spec.md
//! §4.6, §5).

use crate::error::{Result, RunnerError};
use crate::executor::execute_segment;
use crate::graph::DependencyGraph;
use crate::logger::LoggerManager;
use crate::secret::SecretMasker;
use crate::segment::{ExecutionContext, Ride, Segment, SegmentOverrides, SegmentResult, SegmentStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Final outcome of running a whole `Ride` (spec.md §3).
#[derive(Debug, Clone)]
pub struct SchedulerResult {
    pub ride_name: String,
    pub results: Vec<SegmentResult>,
    /// Wall-clock time from invocation start to the last result being
    /// written (spec.md §4.6.2 "Wall-clock measurement").
    pub execution_time_ms: u64,
    /// Sum of every segment's own `duration_ms`; compared against
    /// `execution_time_ms` as an observed parallelism factor.
    pub total_duration_ms: u64,
}

impl SchedulerResult {
    pub fn total_count(&self) -> usize {
        self.results.len()
    }

    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == SegmentStatus::Success || r.status == SegmentStatus::Skipped)
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == SegmentStatus::Failure || r.status == SegmentStatus::Timeout)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results.iter().filter(|r| r.status == SegmentStatus::Skipped).count()
    }

    /// True only when there are zero failures/timeouts AND at least one
    /// segment actually succeeded — SKIPPED alone does not make a ride
    /// successful (spec.md §3 "isSuccess is true only when failure_count ==
    /// 0 AND at least one real success exists").
    pub fn is_success(&self) -> bool {
        let no_failures = self
            .results
            .iter()
            .all(|r| r.status != SegmentStatus::Failure && r.status != SegmentStatus::Timeout);
        let has_real_success = self.results.iter().any(|r| r.status == SegmentStatus::Success);
        no_failures && has_real_success
    }

    pub fn result_for(&self, segment_name: &str) -> Option<&SegmentResult> {
        self.results.iter().find(|r| r.segment_name == segment_name)
    }
}

/// Which of the two interchangeable scheduler strategies (spec.md §4.6)
/// drives a ride. Both strategies share the same dependency resolution and
/// cascading-skip rules; they differ only in how much of the graph runs at
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Single-threaded: at most one `execute` body runs at a time, in
    /// topological order (spec.md §4.6.1).
    Sequential,
    /// Bounded-parallelism, level-by-level (spec.md §4.6.2). `None` resolves
    /// `max_concurrency` to the host logical CPU count.
    Parallel,
}

/// Runs `ride` against the given segment definitions using `strategy`.
/// `segments` may be a superset of what this ride needs — only the names
/// the flow references, plus the transitive closure of their declared
/// `dependsOn`, are validated and scheduled (spec.md §2, §3). A flow
/// reference with no matching entry in `segments` is a graph-validation
/// error (spec.md §4.4), not silently ignored.
///
/// Returns `Err` only for config-time errors (spec.md §7: blank name,
/// negative retry knobs, non-positive concurrency) — these prevent
/// scheduling outright, so the scheduler never runs. Graph-validation
/// failures (missing dependency, cycle, unreachable node, empty parallel
/// block) do *not* abort with `Err`: they still produce a well-formed
/// `SchedulerResult` with every segment marked SKIPPED and an error
/// referencing the first validation problem (spec.md §7 "the scheduler
/// still returns a well-formed result").
pub async fn run_ride(
    ride: &Ride,
    segments: &HashMap<String, Segment>,
    ctx: &ExecutionContext,
    logger_manager: &LoggerManager,
    log_root: &std::path::Path,
    masker: &SecretMasker,
    strategy: SchedulingStrategy,
) -> Result<SchedulerResult> {
    ride.validate()?;

    // Schedule only the segments the flow actually references, plus the
    // transitive closure of their declared `dependsOn` (spec.md §3:
    // "Collecting all SegmentRef names from a Flow yields the set of
    // segments to schedule"; §2: the flow identifies "which subset to
    // run"). A caller may hand in a superset of segment definitions with
    // no bearing on this particular ride — those extras are neither
    // validated nor run. A name the flow references with no matching
    // entry in `segments` is simply left out here; graph validation below
    // reports it as an undeclared reference.
    let mut declared_names: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = ride.flow.segment_names().into();
    while let Some(name) = queue.pop_front() {
        if declared_names.contains(&name) {
            continue;
        }
        if let Some(segment) = segments.get(&name) {
            declared_names.insert(name.clone());
            for dep in &segment.depends_on {
                queue.push_back(dep.clone());
            }
        }
    }

    for name in &declared_names {
        segments[name].validate()?;
    }

    let declared: Vec<(String, Vec<String>)> = segments
        .iter()
        .filter(|(name, _)| declared_names.contains(name.as_str()))
        .map(|(name, s)| (name.clone(), s.depends_on.clone()))
        .collect();
    let graph = DependencyGraph::new(&declared);

    let start = Instant::now();
    let report = graph.validate(&ride.flow);
    if !report.valid {
        warn!(ride = %ride.name, errors = %report.errors.join("; "), "graph validation failed");
        let reason = report
            .errors
            .first()
            .cloned()
            .unwrap_or_else(|| "graph validation failed".to_string());
        let results: Vec<SegmentResult> = declared_names
            .iter()
            .map(|name| SegmentResult::skipped(name, reason.clone()))
            .collect();
        return Ok(SchedulerResult {
            ride_name: ride.name.clone(),
            execution_time_ms: start.elapsed().as_millis() as u64,
            total_duration_ms: 0,
            results,
        });
    }

    let max_concurrency = match strategy {
        SchedulingStrategy::Sequential => 1,
        SchedulingStrategy::Parallel => ride.max_concurrency.unwrap_or_else(num_cpus::get).max(1),
    };

    info!(ride = %ride.name, ?strategy, max_concurrency, "starting ride");

    // The ride's global environment overrides apply to every segment it
    // runs, layered on top of the caller-supplied context (spec.md §3).
    let ctx = ctx.with_environment_overrides(&ride.environment);
    let ctx = &ctx;

    // Per-flow `SegmentRef(name, overrides?)` overrides (spec.md §3),
    // applied at dispatch so the shared `Segment` definition is never
    // mutated across rides.
    let overrides = ride.flow.overrides_by_name();

    let levels = graph.levels();
    let results = match strategy {
        SchedulingStrategy::Sequential => {
            run_sequential(&levels, segments, &overrides, ctx, logger_manager, log_root, masker).await?
        }
        SchedulingStrategy::Parallel => {
            run_parallel(&levels, segments, &overrides, ctx, logger_manager, log_root, masker, max_concurrency).await?
        }
    };

    let ordered: Vec<SegmentResult> = graph
        .topo_order()
        .into_iter()
        .filter_map(|name| results.get(&name).cloned())
        .collect();

    let execution_time_ms = start.elapsed().as_millis() as u64;
    let total_duration_ms = ordered.iter().map(|r| r.duration_ms).sum();
    info!(ride = %ride.name, execution_time_ms, segments = ordered.len(), "ride finished");

    // `ride.on_failure` is deliberately not invoked here: it's the caller's
    // hook to run once it has the final `SchedulerResult` in hand, not a
    // scheduler-internal callback.
    Ok(SchedulerResult {
        ride_name: ride.name.clone(),
        results: ordered,
        execution_time_ms,
        total_duration_ms,
    })
}

/// Sequential strategy (spec.md §4.6.1): iterate the topological order one
/// segment at a time. A dependency that did not end in SUCCESS (failed,
/// timed out, or was itself skipped) cascades a skip to its dependents.
async fn run_sequential(
    levels: &[Vec<String>],
    segments: &HashMap<String, Segment>,
    overrides: &HashMap<String, SegmentOverrides>,
    ctx: &ExecutionContext,
    logger_manager: &LoggerManager,
    log_root: &std::path::Path,
    masker: &SecretMasker,
) -> Result<HashMap<String, SegmentResult>> {
    let mut results: HashMap<String, SegmentResult> = HashMap::new();
    let mut failed_or_skipped: HashSet<String> = HashSet::new();

    for name in levels.iter().flatten() {
        let base = segments
            .get(name)
            .unwrap_or_else(|| panic!("graph referenced unknown segment {name:?}"));
        let segment = match overrides.get(name) {
            Some(o) => base.with_overrides(o),
            None => base.clone(),
        };
        let segment = &segment;

        let blocking_dependency = segment
            .depends_on
            .iter()
            .find(|dep| failed_or_skipped.contains(dep.as_str()))
            .cloned();

        let logger = logger_manager.start(&segment.name, log_root, masker.clone(), false)?;
        let result = execute_segment(segment, ctx.clone(), logger, blocking_dependency.as_deref()).await;
        logger_manager.stop(&segment.name);

        if result.status == SegmentStatus::Failure
            || result.status == SegmentStatus::Timeout
            || result.status == SegmentStatus::Skipped
        {
            failed_or_skipped.insert(name.clone());
        }
        results.insert(name.clone(), result);
    }

    Ok(results)
}

/// Parallel strategy (spec.md §4.6.2): every level's segments are dispatched
/// concurrently, gated by a semaphore of capacity `max_concurrency`; a level
/// is fully awaited before the next one starts, so dependency lookups in the
/// next level are race-free (spec.md §4.6.2 "Concurrency correctness").
async fn run_parallel(
    levels: &[Vec<String>],
    segments: &HashMap<String, Segment>,
    overrides: &HashMap<String, SegmentOverrides>,
    ctx: &ExecutionContext,
    logger_manager: &LoggerManager,
    log_root: &std::path::Path,
    masker: &SecretMasker,
    max_concurrency: usize,
) -> Result<HashMap<String, SegmentResult>> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let mut results: HashMap<String, SegmentResult> = HashMap::new();
    let mut failed_or_skipped: HashSet<String> = HashSet::new();

    for level in levels {
        if level.is_empty() {
            continue;
        }

        let handles: Vec<_> = level
            .iter()
            .map(|name| {
                let base = segments
                    .get(name)
                    .unwrap_or_else(|| panic!("graph referenced unknown segment {name:?}"));
                let segment = match overrides.get(name) {
                    Some(o) => base.with_overrides(o),
                    None => base.clone(),
                };
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                let logger_manager = logger_manager.clone();
                let masker = masker.clone();
                let log_root = log_root.to_path_buf();

                let blocking_dependency = segment
                    .depends_on
                    .iter()
                    .find(|dep| failed_or_skipped.contains(dep.as_str()))
                    .cloned();

                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                    let logger = logger_manager
                        .start(&segment.name, &log_root, masker, false)
                        .expect("logger creation is infrastructure, not segment, failure");

                    let result = execute_segment(&segment, ctx, logger, blocking_dependency.as_deref()).await;
                    logger_manager.stop(&segment.name);
                    (segment.name.clone(), result)
                })
            })
            .collect();

        for handle in handles {
            let (name, result) = handle.await.map_err(|e| RunnerError::Other(anyhow::anyhow!(e)))?;
            if result.status == SegmentStatus::Failure
                || result.status == SegmentStatus::Timeout
                || result.status == SegmentStatus::Skipped
            {
                failed_or_skipped.insert(name.clone());
            }
            results.insert(name, result);
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactStore;
    use crate::segment::{FlowNode, SegmentError};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_ctx(root: &std::path::Path) -> ExecutionContext {
        let store = Arc::new(ArtifactStore::new(root.join("artifacts")));
        ExecutionContext::new("main", "deadbeef", HashMap::new(), PathBuf::from("."), store)
    }

    fn linear_segment(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Segment {
        let name_owned = name.to_string();
        Segment::new(name)
            .with_depends_on(deps.iter().map(|s| s.to_string()))
            .with_execute(move |_ctx| {
                let log = log.clone();
                let name = name_owned.clone();
                Box::pin(async move {
                    log.lock().push(name);
                    Ok(())
                })
            })
    }

    #[tokio::test]
    async fn linear_chain_runs_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &[], order.clone()));
        segments.insert("b".to_string(), linear_segment("b", &["a"], order.clone()));
        segments.insert("c".to_string(), linear_segment("c", &["b"], order.clone()));

        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::SegmentRef("b".into(), None),
            FlowNode::SegmentRef("c".into(), None),
        ]);
        let ride = Ride::new("build-chain", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn sequential_strategy_runs_one_segment_at_a_time_in_topo_order() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));
        let concurrent = Arc::new(Mutex::new(0i32));
        let max_seen = Arc::new(Mutex::new(0i32));

        let mut segments = HashMap::new();
        for name in ["a", "b", "c"] {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            let order = order.clone();
            let name_owned = name.to_string();
            segments.insert(
                name.to_string(),
                Segment::new(name).with_execute(move |_ctx| {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    let order = order.clone();
                    let name = name_owned.clone();
                    Box::pin(async move {
                        {
                            let mut c = concurrent.lock();
                            *c += 1;
                            let mut m = max_seen.lock();
                            if *c > *m {
                                *m = *c;
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        order.lock().push(name);
                        *concurrent.lock() -= 1;
                        Ok(())
                    })
                }),
            );
        }

        let flow = FlowNode::Parallel(
            ["a", "b", "c"]
                .iter()
                .map(|n| FlowNode::SegmentRef(n.to_string(), None))
                .collect(),
        );
        let ride = Ride::new("one-at-a-time", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Sequential,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(*max_seen.lock(), 1, "sequential strategy must never run two bodies at once");
        assert_eq!(order.lock().len(), 3);
    }

    #[tokio::test]
    async fn independent_segments_run_in_the_same_level() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &[], order.clone()));
        segments.insert("b".to_string(), linear_segment("b", &[], order.clone()));
        segments.insert("c".to_string(), linear_segment("c", &[], order.clone()));

        let flow = FlowNode::Parallel(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::SegmentRef("b".into(), None),
            FlowNode::SegmentRef("c".into(), None),
        ]);
        let ride = Ride::new("fan-out", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.results.len(), 3);
    }

    #[tokio::test]
    async fn failure_cascades_to_dependents_as_skips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());

        let mut segments = HashMap::new();
        segments.insert(
            "a".to_string(),
            Segment::new("a").with_execute(|_ctx| Box::pin(async { Err(SegmentError::generic("boom")) })),
        );
        segments.insert(
            "b".to_string(),
            Segment::new("b")
                .with_depends_on(["a"])
                .with_execute(|_ctx| Box::pin(async { Ok(()) })),
        );

        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::SegmentRef("b".into(), None),
        ]);
        let ride = Ride::new("cascade", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(!result.is_success());
        assert_eq!(result.result_for("a").unwrap().status, SegmentStatus::Failure);
        assert_eq!(result.result_for("b").unwrap().status, SegmentStatus::Skipped);
    }

    #[tokio::test]
    async fn cyclic_ride_returns_a_well_formed_all_skipped_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &["b"], order.clone()));
        segments.insert("b".to_string(), linear_segment("b", &["a"], order.clone()));

        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::SegmentRef("b".into(), None),
        ]);
        let ride = Ride::new("cyclic", flow);

        // Graph-validation failures never abort with `Err` (spec.md §7): the
        // scheduler still returns a well-formed `SchedulerResult` with every
        // declared segment SKIPPED and an error referencing the cycle.
        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(order.lock().is_empty(), "no segment should run once graph validation fails");
        assert!(!result.is_success());
        assert_eq!(result.total_count(), 2);
        assert!(result.results.iter().all(|r| r.status == SegmentStatus::Skipped));
        assert!(result
            .result_for("a")
            .unwrap()
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("cyclic"));
    }

    #[tokio::test]
    async fn empty_parallel_block_returns_a_well_formed_all_skipped_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &[], order.clone()));

        // An empty `Parallel` block is a graph-validation error (spec.md
        // §7), not a config-time one: `run_ride` must not abort with `Err`,
        // it must still return a well-formed result with every declared
        // segment SKIPPED.
        let flow = FlowNode::Sequential(vec![
            FlowNode::SegmentRef("a".into(), None),
            FlowNode::Parallel(vec![]),
        ]);
        let ride = Ride::new("empty-block", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(order.lock().is_empty(), "no segment should run once graph validation fails");
        assert!(!result.is_success());
        assert_eq!(result.total_count(), 1);
        assert_eq!(result.result_for("a").unwrap().status, SegmentStatus::Skipped);
        assert!(result
            .result_for("a")
            .unwrap()
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("at least one child"));
    }

    #[tokio::test]
    async fn config_time_error_still_aborts_with_err() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());

        let mut segments = HashMap::new();
        segments.insert("  ".to_string(), Segment::new("  "));

        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("  ".into(), None)]);
        let ride = Ride::new("bad-config", flow);

        let err = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::BlankSegmentName));
    }

    #[tokio::test]
    async fn max_concurrency_caps_simultaneous_segments() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let concurrent = Arc::new(Mutex::new(0i32));
        let max_seen = Arc::new(Mutex::new(0i32));

        let mut segments = HashMap::new();
        for name in ["a", "b", "c", "d"] {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            segments.insert(
                name.to_string(),
                Segment::new(name).with_execute(move |_ctx| {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    Box::pin(async move {
                        {
                            let mut c = concurrent.lock();
                            *c += 1;
                            let mut m = max_seen.lock();
                            if *c > *m {
                                *m = *c;
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        *concurrent.lock() -= 1;
                        Ok(())
                    })
                }),
            );
        }

        let flow = FlowNode::Parallel(
            ["a", "b", "c", "d"]
                .iter()
                .map(|n| FlowNode::SegmentRef(n.to_string(), None))
                .collect(),
        );
        let mut ride = Ride::new("capped", flow);
        ride.max_concurrency = Some(2);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert!(*max_seen.lock() <= 2);
    }

    #[tokio::test]
    async fn undeclared_flow_reference_yields_well_formed_skipped_result() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let segments: HashMap<String, Segment> = HashMap::new();

        // A single segment referenced by flow but never declared fails
        // graph validation (missing reference), which must still return a
        // well-formed (here: empty, since no segments were declared) result
        // rather than an `Err`.
        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("nonexistent".into(), None)]);
        let ride = Ride::new("undeclared", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();
        assert_eq!(result.total_count(), 0);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn ride_environment_overrides_are_visible_to_segments() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let seen = Arc::new(Mutex::new(None));

        let captured = seen.clone();
        let segment = Segment::new("reads-env").with_execute(move |ctx| {
            let captured = captured.clone();
            Box::pin(async move {
                *captured.lock() = ctx.env("DEPLOY_TARGET").map(str::to_string);
                Ok(())
            })
        });
        let mut segments = HashMap::new();
        segments.insert("reads-env".to_string(), segment);

        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("reads-env".into(), None)]);
        let mut ride = Ride::new("with-env", flow);
        ride.environment.insert("DEPLOY_TARGET".to_string(), "staging".to_string());

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Sequential,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(seen.lock().as_deref(), Some("staging"));
    }

    #[tokio::test]
    async fn empty_levels_produce_an_empty_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let segments: HashMap<String, Segment> = HashMap::new();
        let levels: Vec<Vec<String>> = Vec::new();

        let no_overrides = HashMap::new();
        let parallel = run_parallel(
            &levels,
            &segments,
            &no_overrides,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            4,
        )
        .await
        .unwrap();
        assert!(parallel.is_empty(), "empty segment set must yield zero entries, not an error");

        let sequential = run_sequential(
            &levels,
            &segments,
            &no_overrides,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
        )
        .await
        .unwrap();
        assert!(sequential.is_empty());
    }

    #[tokio::test]
    async fn segment_ref_overrides_apply_only_to_that_flow_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let attempts = Arc::new(Mutex::new(0u32));

        let counted = attempts.clone();
        let segment = Segment::new("flaky").with_execute(move |_ctx| {
            let counted = counted.clone();
            Box::pin(async move {
                let mut c = counted.lock();
                *c += 1;
                if *c < 2 {
                    Err(SegmentError::generic("not yet"))
                } else {
                    Ok(())
                }
            })
        });
        let mut segments = HashMap::new();
        segments.insert("flaky".to_string(), segment);

        // The shared segment definition has max_retries: 0, but this flow
        // overrides it to 2 retries for this one ride — the definition
        // itself must stay untouched (spec.md §3 SegmentRef overrides).
        let overrides = SegmentOverrides { timeout: None, max_retries: Some(2) };
        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("flaky".into(), Some(overrides))]);
        let ride = Ride::new("with-overrides", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Sequential,
        )
        .await
        .unwrap();

        assert!(result.is_success(), "{:?}", result.result_for("flaky"));
        assert_eq!(segments["flaky"].max_retries, 0, "the shared definition must not be mutated");
    }

    #[tokio::test]
    async fn unreferenced_segments_are_excluded_from_scheduling() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &[], order.clone()));
        // "b" is declared with no dependency on "a" and no cycle, so it
        // would silently run if the scheduler scheduled every declared
        // segment instead of only the flow's referenced subset.
        segments.insert("b".to_string(), linear_segment("b", &[], order.clone()));

        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("a".into(), None)]);
        let ride = Ride::new("subset-only", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert_eq!(result.total_count(), 1);
        assert!(result.result_for("b").is_none());
        assert_eq!(*order.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn unreferenced_segment_required_as_a_transitive_dependency_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut segments = HashMap::new();
        segments.insert("a".to_string(), linear_segment("a", &[], order.clone()));
        segments.insert("b".to_string(), linear_segment("b", &["a"], order.clone()));

        // Only "b" is referenced by the flow, but "b" depends on "a", so
        // "a" must still be pulled in and run (spec.md §3: the schedulable
        // set is the flow's referenced names plus their transitive deps).
        let flow = FlowNode::Sequential(vec![FlowNode::SegmentRef("b".into(), None)]);
        let ride = Ride::new("transitive-pull", flow);

        let result = run_ride(
            &ride,
            &segments,
            &ctx,
            &LoggerManager::new(),
            dir.path(),
            &SecretMasker::new(),
            SchedulingStrategy::Parallel,
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.total_count(), 2);
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }
}

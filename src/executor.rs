//! Segment Executor (C5): runs a single segment to its terminal
//! `SegmentResult`, including condition checks, the retry/timeout state
//! machine, and at-most-once lifecycle hooks (spec.md §4.5, §5).

use crate::logger::SegmentLogger;
use crate::segment::{ExecutionContext, Segment, SegmentError, SegmentResult, SegmentStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs `segment.condition` (if any) and, when it passes, the
/// attempt/retry/timeout loop for `segment.execute`, then invokes exactly
/// one of `on_success`/`on_failure` followed by `on_complete` (spec.md §5
/// "Lifecycle hooks fire exactly once per segment per invocation").
///
/// `depends_on_skipped` short-circuits straight to a cascading skip without
/// evaluating the condition or running any hooks, since an upstream
/// dependency never ran and therefore produced none of this segment's
/// expected inputs (spec.md §4.5 Edge cases).
pub async fn execute_segment(
    segment: &Segment,
    ctx: ExecutionContext,
    logger: Arc<SegmentLogger>,
    depends_on_skipped: Option<&str>,
) -> SegmentResult {
    let ctx = ctx.with_logger(logger.clone());

    if let Some(upstream) = depends_on_skipped {
        let reason = format!("dependency {upstream:?} did not run");
        logger.info(format!("skipping: {reason}"));
        return SegmentResult::skipped(&segment.name, reason);
    }

    if let Some(condition) = &segment.condition {
        if !condition(&ctx) {
            logger.info("skipping: condition evaluated to false");
            return SegmentResult::skipped(&segment.name, "condition evaluated to false");
        }
    }

    let start = Instant::now();
    let outcome = run_with_retries(segment, &ctx, &logger).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    if let Attempt::Success = outcome {
        capture_outputs(segment, &ctx, &logger).await;
    }

    let result = match outcome {
        Attempt::Success => SegmentResult::success(&segment.name, duration_ms, logger.buffer()),
        Attempt::Timeout(timeout) => {
            SegmentResult::timeout(&segment.name, timeout, duration_ms, logger.buffer())
        }
        Attempt::Failure(err) => SegmentResult::failure(&segment.name, &err, duration_ms, logger.buffer()),
    };

    run_hooks(segment, &ctx, &result, &outcome).await;
    result
}

/// Best-effort artifact capture on clean completion (spec.md §4.5 step 3):
/// a failure to store any single output is logged as a warning and never
/// fails the segment.
async fn capture_outputs(segment: &Segment, ctx: &ExecutionContext, logger: &SegmentLogger) {
    for (name, relative_path) in &segment.outputs {
        let source = ctx.workspace.join(relative_path);
        if let Err(err) = ctx.artifacts.put(name, &source) {
            logger.warn(format!("failed to capture artifact {name:?} from {relative_path:?}: {err}"));
        }
    }
}

enum Attempt {
    Success,
    Failure(SegmentError),
    Timeout(Duration),
}

/// Attempt loop: runs `execute` up to `max_retries + 1` times, waiting
/// `retry_delay` between attempts, but only retries a failure whose error
/// kind matches one of `retry_on`'s substrings (spec.md §4.5 "retryOn
/// filters which failures are retried"; empty `retry_on` retries anything).
/// A timeout is never retried regardless of `retry_on` (spec.md §4.1
/// "timeouts are terminal").
async fn run_with_retries(segment: &Segment, ctx: &ExecutionContext, logger: &SegmentLogger) -> Attempt {
    let mut attempt = 0u32;

    loop {
        let timeout = segment.timeout;
        let fut = (segment.execute)(ctx.clone());

        let attempt_result = match timeout {
            Some(t) => match tokio::time::timeout(t, fut).await {
                Ok(inner) => inner.map_err(AttemptError::Segment),
                Err(_) => Err(AttemptError::Timeout(t)),
            },
            None => fut.await.map_err(AttemptError::Segment),
        };

        match attempt_result {
            Ok(()) => return Attempt::Success,
            Err(AttemptError::Timeout(t)) => {
                logger.error(format!("attempt {} timed out after {:?}", attempt + 1, t));
                return Attempt::Timeout(t);
            }
            Err(AttemptError::Segment(err)) => {
                let should_retry = attempt < segment.max_retries && retry_matches(segment, &err);
                logger.error(format!(
                    "attempt {} failed: {err}{}",
                    attempt + 1,
                    if should_retry { " (retrying)" } else { "" }
                ));

                if !should_retry {
                    return Attempt::Failure(err);
                }

                attempt += 1;
                if !segment.retry_delay.is_zero() {
                    tokio::time::sleep(segment.retry_delay).await;
                }
            }
        }
    }
}

enum AttemptError {
    Segment(SegmentError),
    Timeout(Duration),
}

fn retry_matches(segment: &Segment, err: &SegmentError) -> bool {
    if segment.retry_on.is_empty() {
        return true;
    }
    segment
        .retry_on
        .iter()
        .any(|substring| err.kind.contains(substring.as_str()))
}

/// Dispatches at most one of `on_success`/`on_failure`, then `on_complete`
/// exactly once. `on_failure` never fires for a timeout (spec.md §4.5 step 4
/// "do not invoke onFailure"; §8 invariant 5 "never for TIMEOUT or
/// SKIPPED"). Hook exceptions never escape the executor — they're logged as
/// a warning and otherwise ignored (spec.md §7 "Hook failure").
async fn run_hooks(segment: &Segment, ctx: &ExecutionContext, result: &SegmentResult, outcome: &Attempt) {
    match outcome {
        Attempt::Success => {
            if let Some(hook) = &segment.on_success {
                log_hook_failure(ctx, "onSuccess", hook(ctx).await);
            }
        }
        Attempt::Failure(err) => {
            if let Some(hook) = &segment.on_failure {
                log_hook_failure(ctx, "onFailure", hook(ctx, err).await);
            }
        }
        Attempt::Timeout(_) => {}
    }

    if let Some(hook) = &segment.on_complete {
        log_hook_failure(ctx, "onComplete", hook(ctx, result.status).await);
    }
}

fn log_hook_failure(ctx: &ExecutionContext, hook_name: &str, outcome: std::result::Result<(), SegmentError>) {
    if let Err(err) = outcome {
        if let Some(logger) = &ctx.logger {
            logger.warn(format!("{hook_name} hook raised: {err}"));
        }
    }
}

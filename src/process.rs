//! Process Executor (C1): spawns a child process to completion, streaming
//! stdout/stderr through the secret masker and the segment logger, and
//! enforcing a wall-clock timeout with forced termination of the whole
//! process tree.

use crate::error::{Result, RunnerError};
use crate::logger::SegmentLogger;
use crate::secret::SecretMasker;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Successful process execution.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Run an argv vector to completion.
///
/// Spawns with the merged environment (process env is inherited, `env`
/// overrides/adds on top), streams stdout/stderr concurrently with each
/// completed line masked and appended to `logger` (if present), inherits
/// stdin from `/dev/null`, and on timeout kills the entire process tree
/// before returning a `ProcessTimeout` error.
pub async fn run(
    argv: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    timeout: Option<Duration>,
    masker: &SecretMasker,
    logger: Option<&SegmentLogger>,
) -> Result<ProcessOutput> {
    let command_str = reconstruct_command(argv);
    if let Some(l) = logger {
        l.exec_start(&command_str);
    }

    let start = Instant::now();
    let child = spawn(argv, cwd, env)?;
    let pid = child.id();

    let outcome = match timeout {
        Some(t) => match tokio::time::timeout(t, run_to_completion(child, masker, logger, &command_str)).await {
            Ok(result) => result,
            Err(_) => {
                // The timed-out future (and the Child it owns) is dropped
                // here, which (kill_on_drop) signals the direct child; we
                // additionally kill the whole process group explicitly so
                // grandchildren spawned by the command don't leak.
                if let Some(pid) = pid {
                    kill_tree(pid);
                }
                if let Some(l) = logger {
                    l.exec_complete(&command_str, start.elapsed(), false);
                }
                return Err(RunnerError::ProcessTimeout(t));
            }
        },
        None => run_to_completion(child, masker, logger, &command_str).await,
    };

    let duration = start.elapsed();
    if let Some(l) = logger {
        l.exec_complete(&command_str, duration, outcome.is_ok());
    }
    outcome.map(|(stdout, stderr)| ProcessOutput {
        command: command_str,
        stdout,
        stderr,
        duration,
    })
}

async fn run_to_completion(
    mut child: Child,
    masker: &SecretMasker,
    logger: Option<&SegmentLogger>,
    command_str: &str,
) -> Result<(String, String)> {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (stdout_result, stderr_result, status) = tokio::join!(
        capture_stream(stdout, masker, logger),
        capture_stream(stderr, masker, logger),
        child.wait(),
    );

    let status = status.map_err(|e| RunnerError::Spawn(e.to_string()))?;
    let stdout = stdout_result?;
    let stderr = stderr_result?;

    match status.code() {
        Some(0) => Ok((stdout, stderr)),
        Some(code) => Err(RunnerError::ExitCode { code, stdout, stderr }),
        None => Err(RunnerError::Spawn(format!(
            "{command_str}: process terminated by signal"
        ))),
    }
}

fn spawn(argv: &[String], cwd: Option<&Path>, env: &HashMap<String, String>) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| RunnerError::Spawn("empty argv".to_string()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    new_process_group(&mut command);

    command
        .spawn()
        .map_err(|e| RunnerError::Spawn(e.to_string()))
}

#[cfg(unix)]
fn new_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // Own process group so a timeout can kill the whole descendant tree
    // (build tools and test runners routinely spawn grandchildren) rather
    // than leaking orphans that would otherwise survive the parent.
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut Command) {}

/// Forcibly terminate the process (and its process group, on Unix) backing
/// a still-running child. Used by the timeout path and by the segment
/// executor's cancellation path (spec.md §5).
pub fn kill_tree(pid: u32) {
    #[cfg(unix)]
    {
        // SIGKILL the whole process group; negative pid targets the group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

async fn capture_stream<R>(
    reader: R,
    masker: &SecretMasker,
    logger: Option<&SegmentLogger>,
) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();

    while let Some(line) = lines.next_line().await? {
        let masked = masker.mask(&line);
        if let Some(l) = logger {
            l.stdout_line(&masked);
        }
        captured.push_str(&masked);
        captured.push('\n');
    }

    Ok(captured)
}

fn reconstruct_command(argv: &[String]) -> String {
    argv.iter()
        .map(|part| {
            if part.contains(' ') {
                format!("\"{part}\"")
            } else {
                part.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a single shell string into an argv vector using simple
/// whitespace/quote splitting (no full shell grammar — the external
/// configuration layer is responsible for anything fancier).
pub fn shell_split(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn runs_successful_command_and_captures_stdout() {
        let argv = shell_split("echo hello-world");
        let out = run(&argv, None, &HashMap::new(), None, &SecretMasker::new(), None)
            .await
            .unwrap();
        assert!(out.stdout.contains("hello-world"));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_an_error() {
        let argv = vec!["false".to_string()];
        let err = run(&argv, None, &HashMap::new(), None, &SecretMasker::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ExitCode { code: 1, .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let argv = vec!["this-binary-does-not-exist-xyz".to_string()];
        let err = run(&argv, None, &HashMap::new(), None, &SecretMasker::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn(_)));
    }

    #[tokio::test]
    async fn timeout_is_reported_and_does_not_hang() {
        let argv = shell_split("sleep 5");
        let err = run(
            &argv,
            None,
            &HashMap::new(),
            Some(Duration::from_millis(50)),
            &SecretMasker::new(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunnerError::ProcessTimeout(_)));
    }

    #[tokio::test]
    async fn secrets_are_masked_in_captured_output() {
        let masker = SecretMasker::new();
        masker.register("supersecretvalue");
        let argv = shell_split("echo supersecretvalue");
        let out = run(&argv, None, &HashMap::new(), None, &masker, None)
            .await
            .unwrap();
        assert!(!out.stdout.contains("supersecretvalue"));
    }

    #[test]
    fn shell_split_handles_quotes() {
        let parts = shell_split(r#"git commit -m "hello world""#);
        assert_eq!(parts, vec!["git", "commit", "-m", "hello world"]);
    }
}

//! Segment Logger (C2): per-segment sink for structured log calls, captured
//! subprocess output, and command-start/complete markers. Writes a
//! timestamped file under the log root and optionally echoes line-prefixed
//! output to the console.

use crate::error::Result;
use crate::secret::SecretMasker;
use chrono::Local;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn marker(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Per-segment log stream: a truncated file at `<log-root>/<name>.log`, an
/// in-memory buffer mirroring the same content (for `SegmentResult`), and a
/// console echo gated by `console`.
pub struct SegmentLogger {
    name: String,
    masker: SecretMasker,
    console: bool,
    file: Mutex<File>,
    buffer: Mutex<String>,
}

impl SegmentLogger {
    pub fn create(name: &str, log_root: &Path, masker: SecretMasker, console: bool) -> Result<Self> {
        std::fs::create_dir_all(log_root)?;
        let path = log_root.join(format!("{name}.log"));
        let file = File::create(path)?; // truncated on creation, retries reuse the logger instance
        Ok(Self {
            name: name.to_string(),
            masker,
            console,
            file: Mutex::new(file),
            buffer: Mutex::new(String::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        self.write_line(level.marker(), message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn exec_start(&self, command: &str) {
        self.write_line("EXEC", &format!("$ {command}"));
    }

    pub fn exec_complete(&self, command: &str, duration: Duration, success: bool) {
        self.write_line(
            "EXEC",
            &format!(
                "{command} finished ({}) in {}ms",
                if success { "success" } else { "failure" },
                duration.as_millis()
            ),
        );
    }

    /// Captured subprocess stdout/stderr line.
    pub fn stdout_line(&self, line: &str) {
        self.write_line("OUT", line);
    }

    /// General user log output not tied to an in-flight process.
    pub fn general_output(&self, line: &str) {
        self.write_line("LOG", line);
    }

    pub fn buffer(&self) -> String {
        self.buffer.lock().clone()
    }

    fn write_line(&self, marker: &str, payload: &str) {
        let masked = self.masker.mask(payload);
        let timestamp = Local::now().format("%H:%M:%S%.3f");
        let line = format!("[{timestamp}] [{marker}] {masked}");

        {
            let mut file = self.file.lock();
            let _ = writeln!(file, "{line}");
        }
        self.buffer.lock().push_str(&line);
        self.buffer.lock().push('\n');

        if self.console {
            println!("[{}] {}", self.name, line);
        }
    }
}

/// Process-wide registry of active loggers, keyed by segment name. Entries
/// are added when a segment's first attempt starts and removed after its
/// terminal attempt, so helpers that don't hold an explicit logger handle
/// can still find one for their segment.
#[derive(Clone, Default)]
pub struct LoggerManager {
    active: Arc<DashMap<String, Arc<SegmentLogger>>>,
}

impl LoggerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &self,
        name: &str,
        log_root: &Path,
        masker: SecretMasker,
        console: bool,
    ) -> Result<Arc<SegmentLogger>> {
        let logger = Arc::new(SegmentLogger::create(name, log_root, masker, console)?);
        self.active.insert(name.to_string(), logger.clone());
        Ok(logger)
    }

    pub fn get(&self, name: &str) -> Option<Arc<SegmentLogger>> {
        self.active.get(name).map(|entry| entry.clone())
    }

    pub fn stop(&self, name: &str) {
        self.active.remove(name);
    }
}

tokio::task_local! {
    /// The logger bound to the segment task currently executing, so that
    /// helper code deep in a call stack (without an explicit `&SegmentLogger`)
    /// can still emit to the right stream. Scoped per task via
    /// `with_current_logger`, the async analogue of a thread-local.
    static CURRENT_LOGGER: Arc<SegmentLogger>;
}

pub async fn with_current_logger<F>(logger: Arc<SegmentLogger>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_LOGGER.scope(logger, fut).await
}

pub fn current_logger() -> Option<Arc<SegmentLogger>> {
    CURRENT_LOGGER.try_with(|l| l.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::SecretMasker;

    #[test]
    fn writes_timestamped_lines_to_file_and_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SegmentLogger::create("build", dir.path(), SecretMasker::new(), false).unwrap();
        logger.info("starting");
        logger.exec_start("cargo build");

        let buf = logger.buffer();
        assert!(buf.contains("[INFO] starting"));
        assert!(buf.contains("[EXEC] $ cargo build"));

        let on_disk = std::fs::read_to_string(dir.path().join("build.log")).unwrap();
        assert_eq!(on_disk, buf);
    }

    #[test]
    fn masks_secrets_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let masker = SecretMasker::new();
        masker.register("topsecretvalue");
        let logger = SegmentLogger::create("deploy", dir.path(), masker, false).unwrap();
        logger.info("token=topsecretvalue");
        assert!(!logger.buffer().contains("topsecretvalue"));
        assert!(logger.buffer().contains("***"));
    }

    #[test]
    fn truncates_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = SegmentLogger::create("t", dir.path(), SecretMasker::new(), false).unwrap();
            logger.info("first run");
        }
        let logger = SegmentLogger::create("t", dir.path(), SecretMasker::new(), false).unwrap();
        logger.info("second run");
        let on_disk = std::fs::read_to_string(dir.path().join("t.log")).unwrap();
        assert!(!on_disk.contains("first run"));
        assert!(on_disk.contains("second run"));
    }

    #[test]
    fn manager_tracks_active_loggers() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LoggerManager::new();
        mgr.start("seg-a", dir.path(), SecretMasker::new(), false).unwrap();
        assert!(mgr.get("seg-a").is_some());
        mgr.stop("seg-a");
        assert!(mgr.get("seg-a").is_none());
    }

    #[tokio::test]
    async fn current_logger_scoped_to_task() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(SegmentLogger::create("x", dir.path(), SecretMasker::new(), false).unwrap());
        let found = with_current_logger(logger.clone(), async { current_logger() }).await;
        assert!(found.is_some());
        assert!(current_logger().is_none());
    }
}

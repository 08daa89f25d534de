//! Run log sink and the captured-output scope around a pipeline run.
//!
//! A [`RunLog`] is one append-only file per run, named after the dataset and
//! the start timestamp. [`RunLogger::with_captured_output`] routes every
//! `tracing` event emitted by the run future into that file through a scoped
//! dispatcher, so nothing process-wide is redirected and the console is left
//! intact for the final status block.
//!
//! ```text
//! STATUS: ERROR
//! LOG: logs/bench01_20240101_120000.log
//! ```

use std::fmt;
use std::fs::{self, File, Metadata, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use futures::FutureExt;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt as tracing_fmt, prelude::*, EnvFilter};

use crate::error::PipelineError;

/// Timestamp layout used in run log file names.
const LOG_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Builds the file name of a run log: `<dataset>_<YYYYmmdd_HHMMSS>.log`.
pub fn log_file_name(dataset: &str, started_at: DateTime<Local>) -> String {
    format!(
        "{}_{}.log",
        dataset,
        started_at.format(LOG_TIMESTAMP_FORMAT)
    )
}

/// Append-only log file owned by one run.
///
/// Cheap to clone; every clone writes to the same file handle.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RunLog {
    /// Creates the log directory if needed and opens the run's log file.
    pub fn create(
        log_dir: &Path,
        dataset: &str,
        started_at: DateTime<Local>,
    ) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(log_file_name(dataset, started_at));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata of the open log file.
    pub fn metadata(&self) -> io::Result<Metadata> {
        self.lock().metadata()
    }

    /// Appends raw bytes, typically container output.
    pub fn write_raw(&self, bytes: &[u8]) {
        let _ = self.lock().write_all(bytes);
    }

    /// Appends one line.
    pub fn write_line(&self, line: &str) {
        let mut file = self.lock();
        let _ = file.write_all(line.as_bytes());
        let _ = file.write_all(b"\n");
    }

    /// Writes a notice to the log and to the operator's console.
    ///
    /// Used for the few messages an operator must act on while the run's
    /// output is otherwise diverted, such as the picker address.
    pub fn announce(&self, message: &str) {
        self.write_line(message);
        eprintln!("{}", message);
    }

    /// Flushes file contents to disk, best-effort.
    pub fn sync(&self) {
        let file = self.lock();
        let _ = file.sync_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `io::Write` handle handed out to the `tracing` formatter.
pub struct RunLogWriter {
    file: Arc<Mutex<File>>,
}

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Final outcome reported on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Ok => write!(f, "OK"),
            RunStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Writes the two-line status block.
pub fn write_status<W: Write>(console: &mut W, status: RunStatus, log_path: &Path) {
    let _ = writeln!(console, "STATUS: {}", status);
    let _ = writeln!(console, "LOG: {}", log_path.display());
    let _ = console.flush();
}

/// Scoped logging context for one run.
pub struct RunLogger {
    log: RunLog,
    filter: String,
}

impl RunLogger {
    /// Creates a logger bound to the given run log at `info` level.
    pub fn new(log: RunLog) -> Self {
        Self {
            log,
            filter: "info".to_string(),
        }
    }

    /// Sets the `EnvFilter` directive used inside the captured scope.
    pub fn with_filter(mut self, directive: impl Into<String>) -> Self {
        self.filter = directive.into();
        self
    }

    /// The run log this logger writes to.
    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Runs `run` with all of its diagnostics captured to the run log and
    /// reports the outcome on stdout.
    pub async fn with_captured_output<F, T>(&self, run: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        let mut console = io::stdout();
        self.with_captured_output_to(run, &mut console).await
    }

    /// Same as [`with_captured_output`](Self::with_captured_output) with an
    /// explicit console.
    ///
    /// The scoped dispatcher only lives for the duration of the future, so the
    /// console is back in charge on every exit path: success, error, a dropped
    /// future and a panic, which is reported and then resumed.
    pub async fn with_captured_output_to<F, T, W>(
        &self,
        run: F,
        console: &mut W,
    ) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
        W: Write,
    {
        let dispatch = self.dispatch();
        let outcome = AssertUnwindSafe(run.with_subscriber(dispatch.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                tracing::dispatcher::with_default(&dispatch, || {
                    tracing::info!(log = %self.log.path().display(), "run finished");
                });
                self.log.write_line("STATUS: OK");
                self.log.sync();
                write_status(console, RunStatus::Ok, self.log.path());
                Ok(value)
            }
            Ok(Err(e)) => {
                tracing::dispatcher::with_default(&dispatch, || {
                    tracing::error!(kind = e.kind(), error = %e, "run failed");
                });
                self.log.write_line("STATUS: ERROR");
                self.log.sync();
                write_status(console, RunStatus::Error, self.log.path());
                Err(e)
            }
            Err(panic) => {
                self.log.write_line("run panicked");
                self.log.write_line("STATUS: ERROR");
                self.log.sync();
                write_status(console, RunStatus::Error, self.log.path());
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn dispatch(&self) -> Dispatch {
        let filter =
            EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(
                tracing_fmt::layer()
                    .with_writer(self.log.clone())
                    .with_ansi(false)
                    .with_target(false),
            )
            .with(filter);
        Dispatch::new(subscriber)
    }
}

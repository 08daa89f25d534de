//! Filesystem signals from the interactive stage.
//!
//! The picker runs in a detached container and talks back only through files
//! in the dataset's indexed output directory:
//!
//! - `__picker_done.flag`: the operator finished (sentinel)
//! - `__use_existing.flag`: the operator chose to keep the previous prompts
//! - `prompts.json`: the annotation artifact itself
//!
//! [`PollingSignalWatch`] stats those paths once per tick. A sentinel that is
//! present ends the wait even if the artifact was not touched.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::PipelineError;

/// File name of the completion sentinel.
pub const DONE_FLAG: &str = "__picker_done.flag";

/// File name of the "reuse previous prompts" flag.
pub const USE_EXISTING_FLAG: &str = "__use_existing.flag";

/// File name of the annotation artifact.
pub const PROMPTS_FILE: &str = "prompts.json";

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// The sentinel file appeared.
    Completed,
    /// The tracked file's modification time moved past the baseline.
    Updated,
}

/// Receiving half of the operator interrupt channel.
pub type CancelReceiver = watch::Receiver<bool>;

/// Creates a cancel channel; send `true` to interrupt every waiter.
pub fn cancel_channel() -> (watch::Sender<bool>, CancelReceiver) {
    watch::channel(false)
}

/// Resolves once the cancel channel carries `true`.
///
/// A dropped sender never cancels.
pub async fn cancelled(cancel: &mut CancelReceiver) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// The two SyncFlags of one dataset.
#[derive(Debug, Clone)]
pub struct SyncFlags {
    pub done: PathBuf,
    pub use_existing: PathBuf,
}

impl SyncFlags {
    /// Flags living in the dataset's indexed output directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            done: dir.join(DONE_FLAG),
            use_existing: dir.join(USE_EXISTING_FLAG),
        }
    }

    /// Removes both flags so a fresh wait cannot observe a stale signal.
    pub fn reset(&self) -> Result<(), PipelineError> {
        remove_if_present(&self.done)?;
        remove_if_present(&self.use_existing)?;
        Ok(())
    }

    /// Reads the use-existing flag and deletes both flags.
    ///
    /// Returns whether "use existing" was selected.
    pub fn consume(&self) -> Result<bool, PipelineError> {
        let use_existing = self.use_existing.exists();
        self.reset()?;
        Ok(use_existing)
    }
}

fn remove_if_present(path: &Path) -> Result<(), PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Waits for the interactive stage to signal completion.
#[async_trait]
pub trait SignalWatcher: Send + Sync {
    /// Blocks until `sentinel` exists or `tracked` is modified, the timeout
    /// elapses, or `cancel` fires.
    async fn wait_for_signal(
        &self,
        sentinel: &Path,
        tracked: &Path,
        cancel: &mut CancelReceiver,
    ) -> Result<SignalOutcome, PipelineError>;
}

/// Poll-based [`SignalWatcher`].
#[derive(Debug, Clone)]
pub struct PollingSignalWatch {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl PollingSignalWatch {
    /// Creates a watcher polling at `poll_interval` with no timeout.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            timeout: None,
        }
    }

    /// Bounds the wait.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// One poll tick: sentinel first, then the tracked file against the baseline.
    fn check(sentinel: &Path, tracked: &Path, baseline: Option<SystemTime>) -> Option<SignalOutcome> {
        if sentinel.exists() {
            return Some(SignalOutcome::Completed);
        }
        match (modified_time(tracked), baseline) {
            (Some(current), Some(base)) if current > base => Some(SignalOutcome::Updated),
            (Some(_), None) => Some(SignalOutcome::Updated),
            _ => None,
        }
    }
}

#[async_trait]
impl SignalWatcher for PollingSignalWatch {
    async fn wait_for_signal(
        &self,
        sentinel: &Path,
        tracked: &Path,
        cancel: &mut CancelReceiver,
    ) -> Result<SignalOutcome, PipelineError> {
        let baseline = modified_time(tracked);
        let deadline = self.timeout.map(|t| Instant::now() + t);

        tracing::info!(
            sentinel = %sentinel.display(),
            tracked = %tracked.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "waiting for interactive stage"
        );

        loop {
            if let Some(outcome) = Self::check(sentinel, tracked, baseline) {
                tracing::info!(?outcome, "interactive stage signalled");
                return Ok(outcome);
            }

            let tick = tokio::time::sleep(self.poll_interval);
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::Timeout(self.timeout.unwrap_or_default()));
                    }
                    tokio::select! {
                        _ = tick => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            // One last look so a signal landing on the deadline still counts.
                            if let Some(outcome) = Self::check(sentinel, tracked, baseline) {
                                return Ok(outcome);
                            }
                            return Err(PipelineError::Timeout(self.timeout.unwrap_or_default()));
                        }
                        _ = cancelled(cancel) => return Err(PipelineError::Cancelled),
                    }
                }
                None => {
                    tokio::select! {
                        _ = tick => {}
                        _ = cancelled(cancel) => return Err(PipelineError::Cancelled),
                    }
                }
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

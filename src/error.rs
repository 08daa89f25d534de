//! Error types for reconforge operations.
//!
//! Defines the error taxonomy for the orchestration core:
//! - Configuration and preconditions checked before any stage starts
//! - Container runtime interactions
//! - Stage outcomes, interactive waits and stage handoffs

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::config::ConfigError;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },
}

/// Errors that abort a pipeline run.
///
/// Every variant is fatal to the run. The only recoveries are best-effort
/// container cleanup, best-effort permission normalization and tolerated
/// optional handoffs, none of which surface as errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing required input.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A required external directory or tool is missing.
    #[error("Required path does not exist: {}", path.display())]
    Precondition { path: PathBuf },

    /// The container runtime is unreachable or the host environment is unusable.
    #[error("Environment error: {0}")]
    Environment(String),

    /// No free port in the scanned range.
    #[error("No free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// An external stage exited with a non-zero code.
    #[error("Stage '{stage}' failed with exit code {exit_code}")]
    StageFailed { stage: String, exit_code: i64 },

    /// The interactive wait exceeded its configured bound.
    #[error("Timed out after {0:?} waiting for the interactive stage")]
    Timeout(Duration),

    /// A handoff artifact is absent after a decision point.
    #[error("Missing artifact {}: {reason}", path.display())]
    MissingArtifact { path: PathBuf, reason: String },

    /// Another run holds the lock for this dataset.
    #[error("Dataset '{dataset}' is already being processed (lock: {})", lock.display())]
    RunInProgress { dataset: String, lock: PathBuf },

    /// The operator interrupted the run.
    #[error("Run cancelled by operator")]
    Cancelled,

    #[error("Docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable taxonomy name, used in status output and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "ConfigError",
            PipelineError::Precondition { .. } => "PreconditionError",
            PipelineError::Environment(_) => "EnvironmentError",
            PipelineError::ResourceExhausted { .. } => "ResourceExhaustedError",
            PipelineError::StageFailed { .. } => "StageFailedError",
            PipelineError::Timeout(_) => "TimeoutError",
            PipelineError::MissingArtifact { .. } => "MissingArtifactError",
            PipelineError::RunInProgress { .. } => "RunInProgressError",
            PipelineError::Cancelled => "Cancelled",
            PipelineError::Docker(DockerError::DaemonUnavailable(_)) => "EnvironmentError",
            PipelineError::Docker(_) => "DockerError",
            PipelineError::Io(_) => "IoError",
        }
    }

    /// Shorthand for a missing handoff artifact.
    pub fn missing_artifact(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::MissingArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

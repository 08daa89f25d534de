//! Pipeline configuration for the reconstruction controller.
//!
//! This module provides configuration options for a single pipeline run,
//! including the tool working areas, container images, the interactive
//! picker's port and polling settings, training length and handoff policy.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::staging::HandoffPolicy;

/// Preferred port for the interactive picker.
pub const DEFAULT_PICKER_PORT: u16 = 8092;

/// How many ports above the preferred one are scanned.
pub const DEFAULT_PORT_RANGE: u16 = 18;

/// Suffix of the renumbered frame and mask directories.
pub const DEFAULT_INDEX_SUFFIX: &str = "_indexed";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was not provided.
    #[error("Missing required value: {0}")]
    MissingValue(String),

    /// A value could not be parsed or is out of range.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Dataset identifier; names every per-dataset directory and the run log.
    pub dataset: String,

    // Tool working areas
    /// Segmentation tool root (contains `data/in` and `data/out`).
    pub segmentation_root: PathBuf,
    /// Structure-from-motion working root (one subdirectory per dataset).
    pub reconstruction_root: PathBuf,
    /// Surface training root (`data/`, `output/`, `cache/`).
    pub training_root: PathBuf,
    /// Directory receiving run logs and dataset locks.
    pub log_dir: PathBuf,

    // Container images
    pub segmentation_image: String,
    pub reconstruction_image: String,
    pub training_image: String,

    // Interactive stage
    /// Preferred port for the picker web endpoint.
    pub picker_port: u16,
    /// Number of ports scanned above `picker_port`.
    pub picker_port_range: u16,
    /// Cadence of the completion poll.
    pub poll_interval: Duration,
    /// Upper bound on the interactive wait; `None` waits until interrupted.
    pub picker_timeout: Option<Duration>,

    // Stage behavior
    /// Refinement iterations handed to the training stage.
    pub train_iterations: u32,
    /// Whether to propagate the prompts to every frame after the picker.
    pub run_segmentation: bool,
    /// What to do when a required handoff source is missing.
    pub handoff_policy: HandoffPolicy,
    /// Suffix of the indexed frame/mask directories.
    pub index_suffix: String,

    // Identity overrides
    pub host_uid: Option<u32>,
    pub host_gid: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: String::new(),

            segmentation_root: PathBuf::from("./SAM2"),
            reconstruction_root: PathBuf::from("./colmap"),
            training_root: PathBuf::from("./training"),
            log_dir: PathBuf::from("./logs"),

            segmentation_image: "sam2:latest".to_string(),
            reconstruction_image: "colmap/colmap:latest".to_string(),
            training_image: "2dgs:latest".to_string(),

            picker_port: DEFAULT_PICKER_PORT,
            picker_port_range: DEFAULT_PORT_RANGE,
            poll_interval: Duration::from_secs(2),
            picker_timeout: None,

            train_iterations: 30_000,
            run_segmentation: true,
            handoff_policy: HandoffPolicy::BestEffort,
            index_suffix: DEFAULT_INDEX_SUFFIX.to_string(),

            host_uid: None,
            host_gid: None,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration for the given dataset with default values.
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATASET_NAME`: Dataset identifier (required)
    /// - `SAM2_ROOT`: Segmentation tool root (default: ./SAM2)
    /// - `COLMAP_ROOT`: Reconstruction root (default: ./colmap)
    /// - `TRAINING_ROOT`: Training root (default: ./training)
    /// - `LOG_DIR`: Run log directory (default: ./logs)
    /// - `SAM2_IMAGE`, `COLMAP_IMAGE`, `TRAINING_IMAGE`: Container images
    /// - `PICKER_PORT`: Preferred picker port (default: 8092)
    /// - `PICKER_PORT_RANGE`: Ports scanned above the preferred one (default: 18)
    /// - `POLL_INTERVAL_SECS`: Completion poll cadence (default: 2)
    /// - `PICKER_TIMEOUT_SECS`: Interactive wait bound (default: unbounded)
    /// - `TRAIN_ITERATIONS`: Refinement iterations (default: 30000)
    /// - `SKIP_SEGMENTATION`: Skip prompt propagation (default: false)
    /// - `HANDOFF_POLICY`: `best-effort` or `strict` (default: best-effort)
    /// - `INDEX_SUFFIX`: Indexed directory suffix (default: _indexed)
    /// - `HOST_UID`, `HOST_GID`: Container run-as identity overrides
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.dataset = std::env::var("DATASET_NAME")
            .map_err(|_| ConfigError::MissingValue("DATASET_NAME".to_string()))?;

        if let Ok(val) = std::env::var("SAM2_ROOT") {
            config.segmentation_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("COLMAP_ROOT") {
            config.reconstruction_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("TRAINING_ROOT") {
            config.training_root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SAM2_IMAGE") {
            config.segmentation_image = val;
        }
        if let Ok(val) = std::env::var("COLMAP_IMAGE") {
            config.reconstruction_image = val;
        }
        if let Ok(val) = std::env::var("TRAINING_IMAGE") {
            config.training_image = val;
        }

        if let Ok(val) = std::env::var("PICKER_PORT") {
            config.picker_port = parse_env_value(&val, "PICKER_PORT")?;
        }
        if let Ok(val) = std::env::var("PICKER_PORT_RANGE") {
            config.picker_port_range = parse_env_value(&val, "PICKER_PORT_RANGE")?;
        }
        if let Ok(val) = std::env::var("POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PICKER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PICKER_TIMEOUT_SECS")?;
            config.picker_timeout = Some(Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("TRAIN_ITERATIONS") {
            config.train_iterations = parse_env_value(&val, "TRAIN_ITERATIONS")?;
        }
        if let Ok(val) = std::env::var("SKIP_SEGMENTATION") {
            config.run_segmentation = !parse_env_bool(&val, "SKIP_SEGMENTATION")?;
        }
        if let Ok(val) = std::env::var("HANDOFF_POLICY") {
            config.handoff_policy = parse_env_value(&val, "HANDOFF_POLICY")?;
        }
        if let Ok(val) = std::env::var("INDEX_SUFFIX") {
            config.index_suffix = val;
        }

        if let Ok(val) = std::env::var("HOST_UID") {
            config.host_uid = Some(parse_env_value(&val, "HOST_UID")?);
        }
        if let Ok(val) = std::env::var("HOST_GID") {
            config.host_gid = Some(parse_env_value(&val, "HOST_GID")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingValue` for an empty dataset and
    /// `ConfigError::ValidationFailed` if any other value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dataset = self.dataset.trim();
        if dataset.is_empty() {
            return Err(ConfigError::MissingValue("dataset".to_string()));
        }
        validate_dataset_name(dataset)?;

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self
            .picker_port
            .checked_add(self.picker_port_range)
            .is_none()
        {
            return Err(ConfigError::ValidationFailed(format!(
                "picker port range {}+{} exceeds 65535",
                self.picker_port, self.picker_port_range
            )));
        }

        if self.picker_port == 0 {
            return Err(ConfigError::ValidationFailed(
                "picker_port must be greater than 0".to_string(),
            ));
        }

        if self.train_iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "train_iterations must be greater than 0".to_string(),
            ));
        }

        for (key, image) in [
            ("segmentation_image", &self.segmentation_image),
            ("reconstruction_image", &self.reconstruction_image),
            ("training_image", &self.training_image),
        ] {
            if image.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} cannot be empty",
                    key
                )));
            }
        }

        if self.index_suffix.is_empty() || self.index_suffix.contains('/') {
            return Err(ConfigError::ValidationFailed(format!(
                "index_suffix '{}' must be a non-empty name fragment",
                self.index_suffix
            )));
        }

        Ok(())
    }

    /// Builder method to set the segmentation tool root.
    pub fn with_segmentation_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.segmentation_root = path.into();
        self
    }

    /// Builder method to set the reconstruction root.
    pub fn with_reconstruction_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.reconstruction_root = path.into();
        self
    }

    /// Builder method to set the training root.
    pub fn with_training_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.training_root = path.into();
        self
    }

    /// Builder method to set the log directory.
    pub fn with_log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_dir = path.into();
        self
    }

    /// Builder method to set the preferred picker port and scan range.
    pub fn with_picker_port(mut self, port: u16, range: u16) -> Self {
        self.picker_port = port;
        self.picker_port_range = range;
        self
    }

    /// Builder method to set the completion poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to bound the interactive wait.
    pub fn with_picker_timeout(mut self, timeout: Duration) -> Self {
        self.picker_timeout = Some(timeout);
        self
    }

    /// Builder method to set training iterations.
    pub fn with_train_iterations(mut self, iterations: u32) -> Self {
        self.train_iterations = iterations;
        self
    }

    /// Builder method to enable or disable prompt propagation.
    pub fn with_segmentation(mut self, enabled: bool) -> Self {
        self.run_segmentation = enabled;
        self
    }

    /// Builder method to set the handoff policy.
    pub fn with_handoff_policy(mut self, policy: HandoffPolicy) -> Self {
        self.handoff_policy = policy;
        self
    }

    /// Builder method to force the container run-as identity.
    pub fn with_host_identity(mut self, uid: u32, gid: u32) -> Self {
        self.host_uid = Some(uid);
        self.host_gid = Some(gid);
        self
    }
}

/// Dataset names end up in directory names and container names, so they are
/// restricted to what both accept.
fn validate_dataset_name(dataset: &str) -> Result<(), ConfigError> {
    let first_ok = dataset
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let rest_ok = dataset
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if !first_ok || !rest_ok {
        return Err(ConfigError::InvalidValue {
            key: "dataset".to_string(),
            message: format!(
                "'{}' must start with a letter or digit and contain only [A-Za-z0-9_.-]",
                dataset
            ),
        });
    }
    Ok(())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

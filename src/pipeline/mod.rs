//! Pipeline orchestration for segmentation, reconstruction and training.
//!
//! This module provides the run-level pieces around the stage primitives:
//!
//! - **Config**: every tunable of a run, from flags or environment
//! - **Context**: derived per-dataset paths, host identity, run log and lock
//! - **Stages**: the container declarations of the four tools
//! - **Controller**: the state machine that sequences them
//!
//! # Pipeline Flow
//!
//! 1. **Validate**: tool roots exist, the container runtime answers
//! 2. **Interactive stage**: the point picker is served on a free local port
//! 3. **Await signal**: the operator saves prompts or confirms existing ones
//! 4. **Segmentation**: prompts are propagated to every frame (optional)
//! 5. **Stage data**: frames and masks are mirrored into the reconstruction workspace
//! 6. **Reconstruction**: structure-from-motion produces a sparse model
//! 7. **Stage data**: the model, images and cutouts are mirrored into training
//! 8. **Training**: surface training and mesh extraction
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use reconforge::execution::DockerStageRunner;
//! use reconforge::pipeline::{PipelineConfig, PipelineController, RunContext};
//! use reconforge::signal::{cancel_channel, PollingSignalWatch};
//!
//! let config = PipelineConfig::from_env()?;
//! let mut ctx = RunContext::new(config)?;
//! let runner = DockerStageRunner::connect()?.with_identity(ctx.identity);
//! let watch = PollingSignalWatch::new(ctx.config.poll_interval);
//! let (_cancel_tx, cancel_rx) = cancel_channel();
//!
//! let mut controller = PipelineController::new(Arc::new(runner), Box::new(watch), cancel_rx);
//! let summary = controller.run(&mut ctx).await?;
//! println!("{:?}", summary.states);
//! ```

pub mod config;
pub mod context;
pub mod controller;
pub mod stages;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use context::{DatasetLock, DatasetPaths, HostIdentity, RunContext};
pub use controller::{
    Decision, HandoffRecord, PipelineController, PipelineState, RunSummary, StageOutcome,
    StageRecord,
};

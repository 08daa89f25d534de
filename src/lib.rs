//! reconforge: orchestration core of a containerized 3D-reconstruction pipeline.
//!
//! This library sequences an interactive segmentation picker, prompt
//! propagation, structure-from-motion and surface training, each running in
//! its own container and handing data to the next through directories.

// Core modules
pub mod cli;
pub mod error;
pub mod execution;
pub mod pipeline;
pub mod ports;
pub mod runlog;
pub mod signal;
pub mod staging;

// Re-export commonly used error types
pub use error::{DockerError, PipelineError};

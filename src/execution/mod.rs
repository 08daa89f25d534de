//! Container execution layer for pipeline stages.
//!
//! This module provides the Docker execution layer using the bollard crate:
//! a thin client, a tracked container lifecycle, the declarative [`Stage`]
//! and the [`StageRunner`] seam the controller drives.
//!
//! # Example
//!
//! ```ignore
//! use reconforge::execution::{DockerStageRunner, Stage, StageMode, StageRunner};
//!
//! let runner = DockerStageRunner::connect()?;
//! runner.check_runtime().await?;
//!
//! let stage = Stage::new("reconstruction", StageMode::Attached, "colmap/colmap:latest", "colmap-bench01")
//!     .mount("/srv/colmap/bench01", "/workspace")
//!     .command(["colmap", "automatic_reconstructor", "--workspace_path", "/workspace"]);
//! runner.run_attached(&stage).await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod runner;
pub mod stage;

pub use container::{Container, ContainerStatus};
pub use docker_client::{ContainerConfig, ContainerStatusInfo, DockerClient};
pub use runner::{DockerStageRunner, StageRunner};
pub use stage::{Mount, PublishedPort, Stage, StageMode};

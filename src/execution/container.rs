//! Lifecycle tracking for one stage container.
//!
//! ```text
//! PENDING → RUNNING → COMPLETED/FAILED → REMOVED
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DockerError;
use crate::execution::docker_client::{ContainerConfig, DockerClient};

/// Status of a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ContainerStatus {
    /// Created, not started.
    Pending,
    Running,
    /// Exited with code 0.
    Completed,
    /// Exited non-zero.
    Failed { exit_code: i64 },
    /// Force-removed by cleanup.
    Removed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Pending => write!(f, "pending"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Completed => write!(f, "completed"),
            ContainerStatus::Failed { exit_code } => write!(f, "failed (exit {})", exit_code),
            ContainerStatus::Removed => write!(f, "removed"),
        }
    }
}

/// A stage container created through [`DockerClient`].
#[derive(Debug)]
pub struct Container {
    id: String,
    status: ContainerStatus,
    config: ContainerConfig,
    created_at: DateTime<Utc>,
}

impl Container {
    /// Creates the container, pulling its image first when it is not present.
    ///
    /// A leftover container with the same name from an interrupted run is
    /// removed before creating the new one.
    pub async fn create(client: &DockerClient, config: ContainerConfig) -> Result<Self, DockerError> {
        if !client.image_exists(&config.image).await {
            tracing::info!(image = %config.image, "pulling image");
            client.pull_image(&config.image).await?;
        }

        client.remove_container(&config.name).await?;
        let id = client.create_container(&config).await?;
        tracing::debug!(container = %config.name, %id, "container created");

        Ok(Self {
            id,
            status: ContainerStatus::Pending,
            config,
            created_at: Utc::now(),
        })
    }

    /// Starts the container.
    pub async fn start(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        if self.status != ContainerStatus::Pending {
            return Err(DockerError::RunFailed(format!(
                "Cannot start container in {} state",
                self.status
            )));
        }

        client.start_container(&self.id).await?;
        self.status = ContainerStatus::Running;
        Ok(())
    }

    /// Waits for exit and records the outcome.
    pub async fn wait(&mut self, client: &DockerClient) -> Result<i64, DockerError> {
        let exit_code = client.wait_container(&self.id).await?;
        self.status = if exit_code == 0 {
            ContainerStatus::Completed
        } else {
            ContainerStatus::Failed { exit_code }
        };
        Ok(exit_code)
    }

    /// Force-removes the container. Safe to call more than once.
    pub async fn cleanup(&mut self, client: &DockerClient) -> Result<(), DockerError> {
        if self.status == ContainerStatus::Removed {
            return Ok(());
        }
        client.remove_container(&self.id).await?;
        self.status = ContainerStatus::Removed;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> &ContainerStatus {
        &self.status
    }

    /// Seconds since creation.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}

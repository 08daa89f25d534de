//! Stage execution.
//!
//! [`StageRunner`] is the seam between the pipeline controller and the
//! container runtime. [`DockerStageRunner`] is the production implementation;
//! tests drive the controller with fakes that simulate the stages' file
//! effects instead.

use async_trait::async_trait;

use crate::error::{DockerError, PipelineError};
use crate::execution::container::Container;
use crate::execution::docker_client::{ContainerConfig, DockerClient};
use crate::execution::stage::{Stage, StageMode};
use crate::pipeline::context::HostIdentity;
use crate::runlog::RunLog;

/// Launches stages in isolated containers.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Fails with an environment error when the runtime cannot be reached.
    async fn check_runtime(&self) -> Result<(), PipelineError>;

    /// Starts `stage` in the background under `stage.container`, replacing
    /// any leftover container of that name, and returns once it is running.
    async fn run_detached(&self, stage: &Stage) -> Result<(), PipelineError>;

    /// Runs `stage` to completion.
    ///
    /// # Errors
    ///
    /// `PipelineError::StageFailed` when the container exits non-zero.
    async fn run_attached(&self, stage: &Stage) -> Result<(), PipelineError>;

    /// Stops and removes a named container. Never fails.
    async fn stop(&self, container: &str);
}

/// [`StageRunner`] backed by the local Docker daemon.
pub struct DockerStageRunner {
    client: DockerClient,
    identity: Option<HostIdentity>,
    log: Option<RunLog>,
}

impl DockerStageRunner {
    pub fn new(client: DockerClient) -> Self {
        Self {
            client,
            identity: None,
            log: None,
        }
    }

    /// Connects to the local daemon.
    pub fn connect() -> Result<Self, PipelineError> {
        let client = DockerClient::new().map_err(|e| PipelineError::Environment(e.to_string()))?;
        Ok(Self::new(client))
    }

    /// Runs every container as `identity`.
    pub fn with_identity(mut self, identity: HostIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Streams stage container output into `log`.
    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = Some(log);
        self
    }

    fn container_config(&self, stage: &Stage) -> ContainerConfig {
        let mut config = ContainerConfig::new(&stage.container, &stage.image)
            .with_env(stage.env_list())
            .with_binds(stage.binds())
            .with_gpu(stage.gpu);

        if !stage.command.is_empty() {
            config = config.with_cmd(stage.command.clone());
        }
        if let Some(dir) = &stage.working_dir {
            config = config.with_working_dir(dir);
        }
        if let Some(port) = stage.port {
            config = config.with_port(port);
        }
        if let Some(identity) = &self.identity {
            config = config.with_user(identity.user_spec());
        }
        config
    }

    async fn launch(&self, stage: &Stage) -> Result<Container, PipelineError> {
        tracing::info!(
            stage = %stage.name,
            container = %stage.container,
            image = %stage.image,
            mode = ?stage.mode,
            gpu = stage.gpu,
            "starting stage"
        );
        for mount in &stage.mounts {
            tracing::debug!(stage = %stage.name, bind = %mount.bind(), "mount");
        }

        let mut container = Container::create(&self.client, self.container_config(stage)).await?;
        container.start(&self.client).await?;
        Ok(container)
    }
}

#[async_trait]
impl StageRunner for DockerStageRunner {
    async fn check_runtime(&self) -> Result<(), PipelineError> {
        self.client.ping().await.map_err(|e| match e {
            DockerError::DaemonUnavailable(msg) => PipelineError::Environment(msg),
            other => PipelineError::Environment(other.to_string()),
        })
    }

    async fn run_detached(&self, stage: &Stage) -> Result<(), PipelineError> {
        debug_assert_eq!(stage.mode, StageMode::Detached);
        let container = self.launch(stage).await?;

        if let Some(log) = self.log.clone() {
            let client = self.client.clone();
            let id = container.id().to_string();
            tokio::spawn(async move {
                if let Err(e) = client.follow_logs(&id, &log).await {
                    tracing::debug!(error = %e, "detached log stream ended");
                }
            });
        }

        tracing::info!(stage = %stage.name, container = %container.name(), "stage running in background");
        Ok(())
    }

    async fn run_attached(&self, stage: &Stage) -> Result<(), PipelineError> {
        debug_assert_eq!(stage.mode, StageMode::Attached);
        let mut container = self.launch(stage).await?;

        if let Some(log) = &self.log {
            if let Err(e) = self.client.follow_logs(container.id(), log).await {
                tracing::warn!(stage = %stage.name, error = %e, "lost stage output stream");
            }
        }

        let exit_code = container.wait(&self.client).await;
        if let Err(e) = container.cleanup(&self.client).await {
            tracing::warn!(stage = %stage.name, error = %e, "failed to remove stage container");
        }
        let exit_code = exit_code?;

        tracing::info!(
            stage = %stage.name,
            exit_code,
            elapsed_secs = container.age_secs(),
            status = %container.status(),
            "stage finished"
        );

        if exit_code != 0 {
            return Err(PipelineError::StageFailed {
                stage: stage.name.clone(),
                exit_code,
            });
        }
        Ok(())
    }

    async fn stop(&self, container: &str) {
        if let Err(e) = self.client.stop_container(container).await {
            tracing::warn!(container, error = %e, "failed to stop container");
        }
        if let Err(e) = self.client.remove_container(container).await {
            tracing::warn!(container, error = %e, "failed to remove container");
        }
    }
}

//! Docker API wrapper using the bollard crate.
//!
//! This module provides the container operations the stage runner needs:
//! daemon checks, image presence, container create/start/stop/remove, exit
//! code waits and log streaming into the run log.

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::stage::PublishedPort;
use crate::runlog::RunLog;

/// Seconds Docker waits after SIGTERM before killing a stopped container.
const STOP_GRACE_SECS: i64 = 10;

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Unique container name.
    pub name: String,
    /// Docker image to use.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts in `host:container` form.
    pub binds: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Request every GPU on the host.
    pub gpu: bool,
    /// Container port published on the host loopback.
    pub port: Option<PublishedPort>,
}

impl ContainerConfig {
    /// Creates a new container configuration with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Sets environment variables.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets bind mounts.
    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    /// Sets the user to run as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Requests GPU access.
    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Publishes a container port on 127.0.0.1.
    pub fn with_port(mut self, port: PublishedPort) -> Self {
        self.port = Some(port);
        self
    }

    fn host_config(&self) -> HostConfig {
        let port_bindings = self.port.map(|port| {
            let mut bindings = HashMap::new();
            bindings.insert(
                format!("{}/tcp", port.container),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.host.to_string()),
                }]),
            );
            bindings
        });

        let device_requests = self.gpu.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        HostConfig {
            binds: if self.binds.is_empty() {
                None
            } else {
                Some(self.binds.clone())
            },
            port_bindings,
            device_requests,
            ..Default::default()
        }
    }

    fn to_bollard(&self) -> Config<String> {
        let exposed_ports = self.port.map(|port| {
            let mut ports = HashMap::new();
            ports.insert(format!("{}/tcp", port.container), HashMap::new());
            ports
        });

        Config {
            image: Some(self.image.clone()),
            cmd: self.cmd.clone(),
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env.clone())
            },
            working_dir: self.working_dir.clone(),
            user: self.user.clone(),
            exposed_ports,
            host_config: Some(self.host_config()),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }
}

/// Status of a container as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatusInfo {
    Created,
    Running,
    Paused,
    Restarting,
    Exited { exit_code: i64 },
    Removing,
    Dead,
    Unknown(String),
}

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(format!("Ping failed: {e}")))?;
        Ok(())
    }

    /// Creates a new container with the given configuration.
    ///
    /// # Returns
    ///
    /// The container ID on success.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String, DockerError> {
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config.to_bollard())
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to create container: {e}")))?;

        for warning in &response.warnings {
            tracing::warn!(container = %config.name, %warning, "docker create warning");
        }

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container by ID or name.
    ///
    /// Sends SIGTERM and waits up to 10 seconds before sending SIGKILL. A
    /// container that is already gone or already stopped is not an error.
    pub async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            Err(e) => Err(DockerError::RunFailed(format!("Failed to stop container: {e}"))),
        }
    }

    /// Force-removes a container by ID or name; a missing container is fine.
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_conflict(&e) => Ok(()),
            Err(e) => Err(DockerError::RunFailed(format!("Failed to remove container: {e}"))),
        }
    }

    /// Copies the container's output into `log` until the container exits.
    pub async fn follow_logs(&self, id: &str, log: &RunLog) -> Result<(), DockerError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(output) => log.write_raw(&output.into_bytes()),
                Err(e) if is_not_found(&e) => break,
                Err(e) => {
                    return Err(DockerError::RunFailed(format!("Error reading logs: {e}")));
                }
            }
        }

        Ok(())
    }

    /// Gets the status of a container.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::RunFailed(format!("Failed to inspect container: {e}"))
                }
            })?;

        let state = info
            .state
            .ok_or_else(|| DockerError::RunFailed("Container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "created" => Ok(ContainerStatusInfo::Created),
            "running" => Ok(ContainerStatusInfo::Running),
            "paused" => Ok(ContainerStatusInfo::Paused),
            "restarting" => Ok(ContainerStatusInfo::Restarting),
            "removing" => Ok(ContainerStatusInfo::Removing),
            "exited" => Ok(ContainerStatusInfo::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            "dead" => Ok(ContainerStatusInfo::Dead),
            other => Ok(ContainerStatusInfo::Unknown(other.to_string())),
        }
    }

    /// Pulls a Docker image from a registry.
    pub async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::ImagePullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Waits for a container to stop running.
    ///
    /// # Returns
    ///
    /// The exit code of the container.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            return match result {
                Ok(response) => Ok(response.status_code),
                // bollard reports a non-zero exit as an error carrying the code
                Err(BollardError::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) => Err(DockerError::RunFailed(format!(
                    "Error waiting for container: {e}"
                ))),
            };
        }

        match self.container_status(id).await? {
            ContainerStatusInfo::Exited { exit_code } => Ok(exit_code),
            _ => Err(DockerError::RunFailed(
                "Container did not exit normally".to_string(),
            )),
        }
    }
}

fn status_code(e: &BollardError) -> Option<u16> {
    match e {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(e: &BollardError) -> bool {
    status_code(e) == Some(404)
}

fn is_not_modified(e: &BollardError) -> bool {
    status_code(e) == Some(304)
}

/// Removal already in progress.
fn is_conflict(e: &BollardError) -> bool {
    status_code(e) == Some(409)
}

//! Description of one containerized stage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// How the controller waits on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Started in the background; completion is signalled through files.
    Detached,
    /// Runs to completion; its exit code decides the run.
    Attached,
}

/// A host directory mounted into the stage container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }

    /// Docker bind string, `host:container`.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host.display(), self.container)
    }
}

/// A container port published on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishedPort {
    pub host: u16,
    pub container: u16,
}

impl PublishedPort {
    pub fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }
}

/// One external processing step.
#[derive(Debug, Clone, Serialize)]
pub struct Stage {
    /// Stage name reported in logs and failures.
    pub name: String,
    pub mode: StageMode,
    pub image: String,
    /// Container name, unique per dataset (and port for the picker).
    pub container: String,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub gpu: bool,
    pub port: Option<PublishedPort>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        mode: StageMode,
        image: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            image: image.into(),
            container: container.into(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            command: Vec::new(),
            working_dir: None,
            gpu: false,
            port: None,
        }
    }

    pub fn mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push(Mount::new(host, container));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), value.to_string());
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn gpu(mut self) -> Self {
        self.gpu = true;
        self
    }

    /// Publishes `container` on host port `host`.
    pub fn publish(mut self, host: u16, container: u16) -> Self {
        self.port = Some(PublishedPort::new(host, container));
        self
    }

    /// Environment in `KEY=value` form, sorted by key.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::bind).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.container)
    }
}

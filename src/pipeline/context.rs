//! Per-run context: derived paths, host identity, run log and dataset lock.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::PipelineError;
use crate::pipeline::config::PipelineConfig;
use crate::runlog::RunLog;
use crate::signal::{SyncFlags, PROMPTS_FILE};

/// Every per-dataset directory the pipeline reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetPaths {
    /// Segmentation data area, mounted at `/data`.
    pub segmentation_data: PathBuf,
    /// Raw frames, `data/in/<ds>`.
    pub frames: PathBuf,
    /// Renumbered frames, `data/in/<ds><suffix>`.
    pub indexed_frames: PathBuf,
    /// Prompts, flags and masks, `data/out/<ds><suffix>`.
    pub indexed_output: PathBuf,
    /// Cutouts, `data/out/<ds><suffix>_masked`.
    pub masked_output: PathBuf,

    /// Reconstruction workspace, mounted at `/workspace`.
    pub reconstruction_workspace: PathBuf,
    pub reconstruction_images: PathBuf,
    pub reconstruction_masks: PathBuf,
    pub reconstruction_sparse: PathBuf,

    /// Training inputs, mounted at `/data`.
    pub training_data: PathBuf,
    /// Training outputs, mounted at `/output`.
    pub training_output: PathBuf,
    /// Model cache shared across datasets, mounted at `/cache`.
    pub training_cache: PathBuf,
}

impl DatasetPaths {
    pub fn new(
        dataset: &str,
        segmentation_root: &Path,
        reconstruction_root: &Path,
        training_root: &Path,
        index_suffix: &str,
    ) -> Self {
        let segmentation_data = segmentation_root.join("data");
        let indexed = format!("{dataset}{index_suffix}");
        let workspace = reconstruction_root.join(dataset);

        Self {
            frames: segmentation_data.join("in").join(dataset),
            indexed_frames: segmentation_data.join("in").join(&indexed),
            indexed_output: segmentation_data.join("out").join(&indexed),
            masked_output: segmentation_data.join("out").join(format!("{indexed}_masked")),
            segmentation_data,

            reconstruction_images: workspace.join("images"),
            reconstruction_masks: workspace.join("masks"),
            reconstruction_sparse: workspace.join("sparse"),
            reconstruction_workspace: workspace,

            training_data: training_root.join("data").join(dataset),
            training_output: training_root.join("output").join(dataset),
            training_cache: training_root.join("cache"),
        }
    }

    /// The interactive stage's annotation artifact.
    pub fn prompts(&self) -> PathBuf {
        self.indexed_output.join(PROMPTS_FILE)
    }

    pub fn sync_flags(&self) -> SyncFlags {
        SyncFlags::in_dir(&self.indexed_output)
    }

    /// Directories the controller writes to or mounts, in pipeline order.
    pub fn writable_dirs(&self) -> Vec<&Path> {
        vec![
            self.indexed_output.as_path(),
            self.reconstruction_workspace.as_path(),
            self.reconstruction_masks.as_path(),
            self.training_data.as_path(),
            self.training_output.as_path(),
            self.training_cache.as_path(),
        ]
    }
}

/// uid/gid every container runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl HostIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Docker `user` value, `uid:gid`.
    pub fn user_spec(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    /// Effective identity of the caller. Explicit overrides win.
    ///
    /// On Linux the ids come from `/proc/self/status`. Elsewhere they fall
    /// back to the owner of `reference`, a file this process just created;
    /// its group is the directory's group when that directory is setgid.
    #[cfg(unix)]
    pub fn resolve(
        reference: &fs::Metadata,
        uid_override: Option<u32>,
        gid_override: Option<u32>,
    ) -> Self {
        use std::os::unix::fs::MetadataExt;

        let (uid, gid) = effective_ids().unwrap_or_else(|| (reference.uid(), reference.gid()));
        Self {
            uid: uid_override.unwrap_or(uid),
            gid: gid_override.unwrap_or(gid),
        }
    }

    #[cfg(not(unix))]
    pub fn resolve(
        _reference: &fs::Metadata,
        uid_override: Option<u32>,
        gid_override: Option<u32>,
    ) -> Self {
        Self {
            uid: uid_override.unwrap_or(1000),
            gid: gid_override.unwrap_or(1000),
        }
    }
}

#[cfg(target_os = "linux")]
fn effective_ids() -> Option<(u32, u32)> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_effective_ids(&status)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn effective_ids() -> Option<(u32, u32)> {
    None
}

/// Reads the effective column of the `Uid:` and `Gid:` lines
/// (`real effective saved filesystem`).
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_effective_ids(status: &str) -> Option<(u32, u32)> {
    let effective = |key: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|ids| ids.split_whitespace().nth(1))
            .and_then(|id| id.parse().ok())
    };
    Some((effective("Uid:")?, effective("Gid:")?))
}

/// Exclusive claim on a dataset for the lifetime of a run.
///
/// Held as `<log_dir>/<dataset>.lock` containing the holder's pid; released
/// on drop. A lock whose holder is no longer alive is taken over.
#[derive(Debug)]
pub struct DatasetLock {
    path: PathBuf,
}

impl DatasetLock {
    /// Fails with `RunInProgress` when a live run holds the lock.
    pub fn acquire(log_dir: &Path, dataset: &str) -> Result<Self, PipelineError> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{dataset}.lock"));

        match Self::create(&path) {
            Ok(()) => return Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        match read_holder(&path) {
            Some(pid) if !process_alive(pid) => {
                tracing::warn!(
                    path = %path.display(),
                    pid,
                    "taking over dataset lock left by a run that is no longer alive"
                );
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                match Self::create(&path) {
                    Ok(()) => Ok(Self { path }),
                    // Another run won the takeover.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(PipelineError::RunInProgress {
                        dataset: dataset.to_string(),
                        lock: path,
                    }),
                    Err(e) => Err(e.into()),
                }
            }
            _ => Err(PipelineError::RunInProgress {
                dataset: dataset.to_string(),
                lock: path,
            }),
        }
    }

    fn create(path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid recorded in a lock file; `None` when unreadable or not yet written.
fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `pid` names a running process. Unknown means alive.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release dataset lock");
        }
    }
}

/// Everything a run reads, resolved once at start.
///
/// Immutable after construction except for the picker port, which is only
/// known once the interactive stage is about to start.
#[derive(Debug)]
pub struct RunContext {
    pub config: PipelineConfig,
    pub paths: DatasetPaths,
    pub identity: HostIdentity,
    pub started_at: DateTime<Local>,
    log: RunLog,
    port: Option<u16>,
    _lock: DatasetLock,
}

impl RunContext {
    /// Validates `config`, takes the dataset lock and opens the run log.
    ///
    /// Tool roots and the log directory are resolved against the current
    /// directory; container bind sources must be absolute host paths.
    pub fn new(mut config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        for root in [
            &mut config.segmentation_root,
            &mut config.reconstruction_root,
            &mut config.training_root,
            &mut config.log_dir,
        ] {
            *root = std::path::absolute(&*root)?;
        }

        let started_at = Local::now();
        let lock = DatasetLock::acquire(&config.log_dir, &config.dataset)?;
        let log = RunLog::create(&config.log_dir, &config.dataset, started_at)?;
        let identity = HostIdentity::resolve(&log.metadata()?, config.host_uid, config.host_gid);
        let paths = DatasetPaths::new(
            &config.dataset,
            &config.segmentation_root,
            &config.reconstruction_root,
            &config.training_root,
            &config.index_suffix,
        );

        Ok(Self {
            config,
            paths,
            identity,
            started_at,
            log,
            port: None,
            _lock: lock,
        })
    }

    pub fn dataset(&self) -> &str {
        &self.config.dataset
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Records the picker port once it has been allocated.
    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    /// Fails with `Precondition` naming the first missing tool directory.
    pub fn validate_preconditions(&self) -> Result<(), PipelineError> {
        let required = [
            &self.config.segmentation_root,
            &self.config.reconstruction_root,
            &self.config.training_root,
            &self.paths.frames,
        ];
        for path in required {
            if !path.is_dir() {
                return Err(PipelineError::Precondition { path: path.clone() });
            }
        }
        Ok(())
    }

    /// Container name for a stage, unique per dataset.
    ///
    /// Dataset names are case-sensitive directories, so the name keeps the
    /// dataset's case.
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.config.dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> PipelineConfig {
        PipelineConfig::new("bench01")
            .with_segmentation_root(temp.path().join("SAM2"))
            .with_reconstruction_root(temp.path().join("colmap"))
            .with_training_root(temp.path().join("training"))
            .with_log_dir(temp.path().join("logs"))
    }

    #[test]
    fn test_dataset_paths_layout() {
        let paths = DatasetPaths::new(
            "bench01",
            Path::new("/sam2"),
            Path::new("/colmap"),
            Path::new("/training"),
            "_indexed",
        );

        assert_eq!(paths.frames, Path::new("/sam2/data/in/bench01"));
        assert_eq!(paths.indexed_frames, Path::new("/sam2/data/in/bench01_indexed"));
        assert_eq!(paths.indexed_output, Path::new("/sam2/data/out/bench01_indexed"));
        assert_eq!(paths.masked_output, Path::new("/sam2/data/out/bench01_indexed_masked"));
        assert_eq!(paths.prompts(), Path::new("/sam2/data/out/bench01_indexed/prompts.json"));
        assert_eq!(paths.reconstruction_sparse, Path::new("/colmap/bench01/sparse"));
        assert_eq!(paths.training_output, Path::new("/training/output/bench01"));
        assert_eq!(paths.training_cache, Path::new("/training/cache"));
        assert_eq!(
            paths.sync_flags().done,
            Path::new("/sam2/data/out/bench01_indexed/__picker_done.flag")
        );
    }

    #[test]
    fn test_run_context_creates_log_and_lock() {
        let temp = TempDir::new().unwrap();
        let ctx = RunContext::new(config(&temp)).unwrap();

        assert!(ctx.log_path().exists());
        let name = ctx.log_path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("bench01_") && name.ends_with(".log"));
        assert!(temp.path().join("logs/bench01.lock").exists());
        assert_eq!(ctx.port(), None);

        drop(ctx);
        assert!(!temp.path().join("logs/bench01.lock").exists());
    }

    #[test]
    fn test_second_run_on_same_dataset_is_rejected() {
        let temp = TempDir::new().unwrap();
        let _first = RunContext::new(config(&temp)).unwrap();

        let err = RunContext::new(config(&temp)).unwrap_err();
        assert!(matches!(err, PipelineError::RunInProgress { ref dataset, .. } if dataset == "bench01"));
        assert_eq!(err.kind(), "RunInProgressError");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_lock_of_dead_process_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let lock = temp.path().join("logs/bench01.lock");
        fs::create_dir_all(lock.parent().unwrap()).unwrap();
        // Above any kernel pid_max.
        fs::write(&lock, "999999999\n").unwrap();

        let ctx = RunContext::new(config(&temp)).unwrap();
        assert_eq!(
            fs::read_to_string(&lock).unwrap().trim(),
            std::process::id().to_string()
        );

        drop(ctx);
        assert!(!lock.exists());
    }

    #[test]
    fn test_lock_of_live_or_unknown_holder_is_respected() {
        let temp = TempDir::new().unwrap();
        let lock = temp.path().join("logs/bench01.lock");
        fs::create_dir_all(lock.parent().unwrap()).unwrap();

        for contents in [format!("{}\n", std::process::id()), String::new()] {
            fs::write(&lock, contents).unwrap();
            let err = RunContext::new(config(&temp)).unwrap_err();
            assert!(matches!(err, PipelineError::RunInProgress { .. }));
            assert!(lock.exists());
        }
    }

    #[test]
    fn test_parse_effective_ids() {
        let status = "Name:\treconforge\nUid:\t1000\t1001\t1001\t1001\nGid:\t2000\t2002\t2002\t2002\nGroups:\t27\n";
        assert_eq!(parse_effective_ids(status), Some((1001, 2002)));
        assert_eq!(parse_effective_ids("Name:\tx\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_identity_uses_effective_ids() {
        use std::os::unix::fs::MetadataExt;

        let temp = TempDir::new().unwrap();
        let probe = temp.path().join("owned");
        fs::write(&probe, "").unwrap();
        let meta = fs::metadata(&probe).unwrap();
        let (uid, gid) = effective_ids().unwrap();

        let identity = HostIdentity::resolve(&meta, None, None);
        assert_eq!(identity.uid, meta.uid());
        assert_eq!(identity, HostIdentity::new(uid, gid));
    }

    #[test]
    fn test_empty_dataset_is_config_error() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(&temp);
        cfg.dataset = String::new();
        let err = RunContext::new(cfg).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(!temp.path().join("logs").exists());
    }

    #[test]
    fn test_missing_tool_root_is_precondition_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("SAM2/data/in/bench01")).unwrap();
        fs::create_dir_all(temp.path().join("training")).unwrap();

        let ctx = RunContext::new(config(&temp)).unwrap();
        match ctx.validate_preconditions() {
            Err(PipelineError::Precondition { path }) => {
                assert_eq!(path, temp.path().join("colmap"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        fs::create_dir_all(temp.path().join("colmap")).unwrap();
        ctx.validate_preconditions().unwrap();
    }

    #[test]
    fn test_identity_overrides() {
        let temp = TempDir::new().unwrap();
        let ctx = RunContext::new(config(&temp).with_host_identity(4242, 4343)).unwrap();
        assert_eq!(ctx.identity, HostIdentity::new(4242, 4343));
        assert_eq!(ctx.identity.user_spec(), "4242:4343");
    }

    #[test]
    fn test_container_name_keeps_case() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(&temp);
        cfg.dataset = "Bench01".to_string();
        let ctx = RunContext::new(cfg).unwrap();
        assert_eq!(ctx.container_name("colmap"), "colmap-Bench01");
    }
}

//! Directory handoffs between stages.
//!
//! Stages never share in-process values: each boundary is a directory whose
//! recognized files are mirrored into the next stage's input area. A mirror
//! copies only files matching the plan's include patterns, skips files whose
//! size and modification time already match, and (with `delete_extraneous`)
//! removes whatever the filtered source no longer contains. Running the same
//! plan twice leaves the destination untouched the second time.

mod filter;
pub mod plans;

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::pipeline::config::ConfigError;

pub use filter::NameFilter;
pub use plans::{reconstruction_handoff, segmentation_handoff, IMAGE_PATTERNS, SPARSE_PATTERNS};

/// What to do when a required handoff has no source directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffPolicy {
    /// Log a warning and let the next stage run on whatever it finds.
    BestEffort,
    /// Fail the run with `MissingArtifact`.
    Strict,
}

impl fmt::Display for HandoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffPolicy::BestEffort => write!(f, "best-effort"),
            HandoffPolicy::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for HandoffPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "best-effort" | "besteffort" | "warn" => Ok(HandoffPolicy::BestEffort),
            "strict" | "fail" => Ok(HandoffPolicy::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "handoff_policy".to_string(),
                message: format!("expected 'best-effort' or 'strict', got '{}'", other),
            }),
        }
    }
}

/// One source → destination handoff.
#[derive(Debug, Clone, Serialize)]
pub struct StagingPlan {
    /// Short name used in logs and summaries.
    pub label: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// File name patterns to mirror.
    pub include: Vec<String>,
    /// Directory name patterns whose subtrees are skipped.
    pub exclude_dirs: Vec<String>,
    /// Remove destination files absent from the filtered source.
    pub delete_extraneous: bool,
    /// Whether the handoff is structurally required by the next stage.
    pub required: bool,
    /// Appended to every destination file name (`000000.jpg` → `000000.jpg.png`).
    pub target_suffix: Option<String>,
}

impl StagingPlan {
    /// Creates a deletion-synchronized, optional plan.
    pub fn new(
        label: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        include: &[&str],
    ) -> Self {
        Self {
            label: label.into(),
            source: source.into(),
            destination: destination.into(),
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude_dirs: Vec::new(),
            delete_extraneous: true,
            required: false,
            target_suffix: None,
        }
    }

    /// Marks the plan as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Skips directories whose name matches `pattern`.
    pub fn excluding_dir(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_dirs.push(pattern.into());
        self
    }

    /// Renames every mirrored file by appending `suffix` to its name.
    pub fn with_target_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.target_suffix = Some(suffix.into());
        self
    }

    /// Destination path, relative to `destination`, of a source file.
    fn target_relative(&self, relative: &Path) -> PathBuf {
        match (&self.target_suffix, relative.file_name()) {
            (Some(suffix), Some(name)) => {
                let mut renamed = name.to_os_string();
                renamed.push(suffix);
                relative.with_file_name(renamed)
            }
            _ => relative.to_path_buf(),
        }
    }

    /// Sets whether extraneous destination files are removed.
    pub fn with_delete_extraneous(mut self, delete: bool) -> Self {
        self.delete_extraneous = delete;
        self
    }
}

/// Result of one mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MirrorReport {
    pub copied: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub source_missing: bool,
}

impl MirrorReport {
    /// Whether the mirror touched the destination.
    pub fn changed(&self) -> bool {
        self.copied > 0 || self.deleted > 0
    }
}

/// Executes staging plans and prepares directories.
#[derive(Debug, Clone)]
pub struct StagingPlanner {
    policy: HandoffPolicy,
}

impl Default for StagingPlanner {
    fn default() -> Self {
        Self::new(HandoffPolicy::BestEffort)
    }
}

impl StagingPlanner {
    pub fn new(policy: HandoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> HandoffPolicy {
        self.policy
    }

    /// Creates `path` if needed and grants rwx to owner and group.
    ///
    /// Creation failures are errors; permission failures are only logged,
    /// since the operator can fix them without rerunning the stage that
    /// produced the data.
    pub fn ensure_directory(&self, path: &Path) -> Result<(), PipelineError> {
        fs::create_dir_all(path)?;
        normalize_permissions(path);
        Ok(())
    }

    /// Mirrors the filtered source tree of `plan` into its destination.
    ///
    /// A missing source is a warning and a no-op; the report flags it so the
    /// caller can apply the handoff policy.
    pub fn mirror(&self, plan: &StagingPlan) -> Result<MirrorReport, PipelineError> {
        if !plan.source.is_dir() {
            tracing::warn!(
                plan = %plan.label,
                source = %plan.source.display(),
                "staging source missing, nothing to mirror"
            );
            return Ok(MirrorReport {
                source_missing: true,
                ..MirrorReport::default()
            });
        }

        let include = NameFilter::new(&plan.include)?;
        let exclude = NameFilter::new(&plan.exclude_dirs)?;
        self.ensure_directory(&plan.destination)?;

        let mut report = MirrorReport::default();
        let mut wanted: HashSet<PathBuf> = HashSet::new();

        let walker = WalkDir::new(&plan.source)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(e.file_type().is_dir() && exclude.matches(e.file_name())));

        for entry in walker {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() || !include.matches(entry.file_name()) {
                continue;
            }

            let relative = match entry.path().strip_prefix(&plan.source) {
                Ok(rel) => plan.target_relative(rel),
                Err(_) => continue,
            };
            let target = plan.destination.join(&relative);

            if is_up_to_date(entry.path(), &target) {
                report.unchanged += 1;
            } else {
                copy_file(entry.path(), &target)?;
                report.copied += 1;
            }
            wanted.insert(relative);
        }

        if plan.delete_extraneous {
            report.deleted = prune(&plan.source, &plan.destination, &wanted)?;
        }

        tracing::info!(
            plan = %plan.label,
            copied = report.copied,
            unchanged = report.unchanged,
            deleted = report.deleted,
            "mirrored"
        );
        Ok(report)
    }

    /// Mirrors every plan in order, applying the handoff policy to required
    /// plans whose source is missing.
    pub fn execute(&self, plans: &[StagingPlan]) -> Result<Vec<MirrorReport>, PipelineError> {
        let mut reports = Vec::with_capacity(plans.len());

        for plan in plans {
            let report = self.mirror(plan)?;
            if report.source_missing && plan.required {
                match self.policy {
                    HandoffPolicy::BestEffort => {
                        tracing::warn!(
                            plan = %plan.label,
                            source = %plan.source.display(),
                            "required handoff source missing, continuing (best-effort)"
                        );
                    }
                    HandoffPolicy::Strict => {
                        return Err(PipelineError::missing_artifact(
                            &plan.source,
                            format!("required handoff '{}' has no source directory", plan.label),
                        ));
                    }
                }
            }
            reports.push(report);
        }

        Ok(reports)
    }
}

/// Same size and same modification time counts as already staged.
fn is_up_to_date(source: &Path, target: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (fs::metadata(source), fs::symlink_metadata(target)) else {
        return false;
    };
    if !dst.is_file() || src.len() != dst.len() {
        return false;
    }
    match (src.modified(), dst.modified()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_file(source: &Path, target: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(_) => {}
    }

    fs::copy(source, target)?;
    let modified = fs::metadata(source)?.modified()?;
    File::open(target)?.set_modified(modified)?;
    Ok(())
}

/// Removes destination entries that the filtered source does not account for.
fn prune(source: &Path, destination: &Path, wanted: &HashSet<PathBuf>) -> Result<usize, PipelineError> {
    let mut deleted = 0;

    for entry in WalkDir::new(destination).min_depth(1).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = match entry.path().strip_prefix(destination) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };

        if entry.file_type().is_dir() {
            let still_in_source = source.join(&relative).is_dir();
            if !still_in_source && is_empty_dir(entry.path()) {
                fs::remove_dir(entry.path())?;
            }
        } else if !wanted.contains(&relative) {
            tracing::debug!(path = %entry.path().display(), "removing extraneous file");
            fs::remove_file(entry.path())?;
            deleted += 1;
        }
    }

    Ok(deleted)
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

#[cfg(unix)]
fn normalize_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read permissions");
            return;
        }
    };
    let mode = meta.permissions().mode();
    let wanted = mode | 0o770;
    if wanted != mode {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(wanted)) {
            tracing::warn!(path = %path.display(), error = %e, "failed to normalize permissions");
        }
    }
}

#[cfg(not(unix))]
fn normalize_permissions(_path: &Path) {}

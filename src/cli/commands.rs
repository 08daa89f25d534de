//! CLI definition and the run entry point for reconforge.
//!
//! One command: run the whole pipeline for one dataset. Every option falls
//! back to an environment variable, then to the defaults of
//! [`PipelineConfig`].

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::PipelineError;
use crate::execution::DockerStageRunner;
use crate::pipeline::{ConfigError, PipelineConfig, PipelineController, RunContext, RunSummary};
use crate::runlog::{RunLogger, RunStatus};
use crate::signal::{cancel_channel, CancelReceiver, PollingSignalWatch};
use crate::staging::HandoffPolicy;

/// Segmentation → structure-from-motion → surface training, one dataset at a time.
#[derive(Parser, Debug)]
#[command(name = "reconforge")]
#[command(about = "Run the interactive segmentation, reconstruction and training pipeline for one dataset")]
#[command(version)]
#[command(
    long_about = "reconforge runs the point picker, waits for the operator, then stages data through\nstructure-from-motion and surface training, each tool in its own container.\n\nExample usage:\n  reconforge bench01 --sam2-root ./SAM2 --colmap-root ./colmap --training-root ./2dgs"
)]
pub struct Cli {
    /// Dataset name (directory under <sam2-root>/data/in).
    #[arg(env = "DATASET_NAME")]
    pub dataset: Option<String>,

    /// Segmentation tool root.
    #[arg(long, env = "SAM2_ROOT")]
    pub sam2_root: Option<PathBuf>,

    /// Structure-from-motion working root.
    #[arg(long, env = "COLMAP_ROOT")]
    pub colmap_root: Option<PathBuf>,

    /// Surface training root.
    #[arg(long, env = "TRAINING_ROOT")]
    pub training_root: Option<PathBuf>,

    /// Directory for run logs and dataset locks.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Segmentation image (picker and predictor).
    #[arg(long, env = "SAM2_IMAGE")]
    pub sam2_image: Option<String>,

    /// Structure-from-motion image.
    #[arg(long, env = "COLMAP_IMAGE")]
    pub colmap_image: Option<String>,

    /// Surface training image.
    #[arg(long, env = "TRAINING_IMAGE")]
    pub training_image: Option<String>,

    /// Preferred picker port.
    #[arg(long, env = "PICKER_PORT")]
    pub picker_port: Option<u16>,

    /// Ports scanned above the preferred one.
    #[arg(long, env = "PICKER_PORT_RANGE")]
    pub picker_port_range: Option<u16>,

    /// Seconds between completion checks.
    #[arg(long, env = "POLL_INTERVAL_SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Give up on the picker after this many seconds.
    #[arg(long, env = "PICKER_TIMEOUT_SECS")]
    pub picker_timeout_secs: Option<u64>,

    /// Training iterations.
    #[arg(long, env = "TRAIN_ITERATIONS")]
    pub train_iterations: Option<u32>,

    /// Reuse masks from a previous run instead of propagating prompts.
    #[arg(long, env = "SKIP_SEGMENTATION")]
    pub skip_segmentation: bool,

    /// Missing required handoff sources: best-effort or strict.
    #[arg(long, env = "HANDOFF_POLICY")]
    pub handoff_policy: Option<HandoffPolicy>,

    /// Suffix of the indexed frame and mask directories.
    #[arg(long, env = "INDEX_SUFFIX")]
    pub index_suffix: Option<String>,

    /// Run containers as this uid.
    #[arg(long, env = "HOST_UID")]
    pub host_uid: Option<u32>,

    /// Run containers as this gid.
    #[arg(long, env = "HOST_GID")]
    pub host_gid: Option<u32>,

    /// Print the run summary as JSON after the status block.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

impl Cli {
    /// Resolves the pipeline configuration; flags and env override defaults.
    pub fn to_config(&self) -> Result<PipelineConfig, ConfigError> {
        let dataset = self
            .dataset
            .clone()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingValue("dataset (argument or DATASET_NAME)".to_string()))?;

        let mut config = PipelineConfig::new(dataset.trim());

        if let Some(path) = &self.sam2_root {
            config.segmentation_root = path.clone();
        }
        if let Some(path) = &self.colmap_root {
            config.reconstruction_root = path.clone();
        }
        if let Some(path) = &self.training_root {
            config.training_root = path.clone();
        }
        if let Some(path) = &self.log_dir {
            config.log_dir = path.clone();
        }
        if let Some(image) = &self.sam2_image {
            config.segmentation_image = image.clone();
        }
        if let Some(image) = &self.colmap_image {
            config.reconstruction_image = image.clone();
        }
        if let Some(image) = &self.training_image {
            config.training_image = image.clone();
        }
        if let Some(port) = self.picker_port {
            config.picker_port = port;
        }
        if let Some(range) = self.picker_port_range {
            config.picker_port_range = range;
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.picker_timeout_secs {
            config.picker_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(iterations) = self.train_iterations {
            config.train_iterations = iterations;
        }
        if self.skip_segmentation {
            config.run_segmentation = false;
        }
        if let Some(policy) = self.handoff_policy {
            config.handoff_policy = policy;
        }
        if let Some(suffix) = &self.index_suffix {
            config.index_suffix = suffix.clone();
        }
        config.host_uid = self.host_uid;
        config.host_gid = self.host_gid;

        config.validate()?;
        Ok(config)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the pipeline.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Runs the pipeline with parsed arguments.
///
/// Exit code 0 on success, 1 on any fatal error. The status block and log path
/// are printed in both cases.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut ctx = match cli.to_config().map_err(PipelineError::from).and_then(RunContext::new) {
        Ok(ctx) => ctx,
        Err(e) => {
            // No run log exists yet.
            eprintln!("error [{}]: {}", e.kind(), e);
            println!("STATUS: {}", RunStatus::Error);
            println!("LOG: (not created)");
            return Ok(ExitCode::FAILURE);
        }
    };

    let logger = RunLogger::new(ctx.log().clone()).with_filter(cli.log_level.clone());
    let watch = PollingSignalWatch::new(ctx.config.poll_interval).with_timeout(ctx.config.picker_timeout);

    let (cancel_tx, cancel_rx) = cancel_channel();
    let interrupt = spawn_interrupt_watch(cancel_tx);

    let mut summary: Option<RunSummary> = None;
    let result = logger
        .with_captured_output(run_pipeline(&mut ctx, watch, cancel_rx, &mut summary))
        .await;
    interrupt.abort();

    if let Err(e) = &result {
        eprintln!("error [{}]: {}", e.kind(), e);
    }
    if cli.json {
        if let Some(summary) = &summary {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
    }

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Flips the cancel channel on Ctrl-C or SIGTERM.
///
/// The SIGTERM handler is registered before this returns, so a terminate
/// arriving right after start still goes through cleanup.
fn spawn_interrupt_watch(cancel_tx: watch::Sender<bool>) -> JoinHandle<()> {
    #[cfg(unix)]
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C interrupts the run");
            None
        }
    };

    tokio::spawn(async move {
        #[cfg(unix)]
        let received = match terminate.as_mut() {
            Some(terminate) => tokio::select! {
                r = tokio::signal::ctrl_c() => r.ok().map(|()| "SIGINT"),
                _ = terminate.recv() => Some("SIGTERM"),
            },
            None => tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT"),
        };
        #[cfg(not(unix))]
        let received = tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT");

        if let Some(signal) = received {
            warn!(signal, "interrupt received, cleaning up");
            let _ = cancel_tx.send(true);
        }
    })
}

async fn run_pipeline(
    ctx: &mut RunContext,
    watch: PollingSignalWatch,
    cancel: CancelReceiver,
    summary: &mut Option<RunSummary>,
) -> Result<RunSummary, PipelineError> {
    let runner = DockerStageRunner::connect()?
        .with_identity(ctx.identity)
        .with_log(ctx.log().clone());
    let mut controller = PipelineController::new(Arc::new(runner), Box::new(watch), cancel);

    let outcome = controller.run(ctx).await;
    *summary = controller.summary().cloned();
    outcome
}

//! The pipeline state machine.
//!
//! ```text
//! Init → Validate → InteractiveStage → AwaitSignal → Decide → Segmentation
//!      → StageData1 → ReconstructionStage → StageData2 → TrainingStage → Done
//! ```
//!
//! `Error` is reachable from every state. Stages run strictly one after the
//! other and every boundary is a directory handoff. The interactive picker is
//! stopped on every exit path, including operator interrupts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::error::PipelineError;
use crate::execution::{Stage, StageRunner};
use crate::pipeline::context::RunContext;
use crate::pipeline::stages;
use crate::ports::PortAllocator;
use crate::signal::{cancelled, CancelReceiver, SignalOutcome, SignalWatcher};
use crate::staging::{self, MirrorReport, StagingPlan, StagingPlanner};

/// Controller states, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Init,
    Validate,
    InteractiveStage,
    AwaitSignal,
    Decide,
    Segmentation,
    StageData1,
    ReconstructionStage,
    StageData2,
    TrainingStage,
    Done,
    Error,
}

/// What the operator chose in the picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Reuse the prompts left by a previous run.
    UseExisting,
    /// Prompts were (re)created in this session.
    NewArtifact,
}

/// How one stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StageOutcome {
    Succeeded,
    Failed { exit_code: i64 },
    Errored { message: String },
    Cancelled,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandoffRecord {
    pub plan: String,
    #[serde(flatten)]
    pub report: MirrorReport,
}

/// Machine-readable account of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub started_at: DateTime<Local>,
    pub log: PathBuf,
    pub success: bool,
    pub port: Option<u16>,
    pub signal: Option<SignalOutcome>,
    pub decision: Option<Decision>,
    pub states: Vec<PipelineState>,
    pub stages: Vec<StageRecord>,
    pub handoffs: Vec<HandoffRecord>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl RunSummary {
    fn new(ctx: &RunContext) -> Self {
        Self {
            dataset: ctx.dataset().to_string(),
            started_at: ctx.started_at,
            log: ctx.log_path().to_path_buf(),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            dataset: String::new(),
            started_at: Local::now(),
            log: PathBuf::new(),
            success: false,
            port: None,
            signal: None,
            decision: None,
            states: Vec::new(),
            stages: Vec::new(),
            handoffs: Vec::new(),
            error_kind: None,
            error: None,
        }
    }

    /// Names of the stages that were launched, in order.
    pub fn launched_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.outcome != StageOutcome::Skipped)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Drives one run through the pipeline.
pub struct PipelineController {
    runner: Arc<dyn StageRunner>,
    watcher: Box<dyn SignalWatcher>,
    cancel: CancelReceiver,
    ports: PortAllocator,
    picker: Option<String>,
    summary: Option<RunSummary>,
}

impl PipelineController {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        watcher: Box<dyn SignalWatcher>,
        cancel: CancelReceiver,
    ) -> Self {
        Self {
            runner,
            watcher,
            cancel,
            ports: PortAllocator::new(),
            picker: None,
            summary: None,
        }
    }

    pub fn with_port_allocator(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    /// Summary of the last run, also available after a failure.
    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Runs the pipeline to `Done` or `Error`.
    ///
    /// The picker container is stopped whatever the outcome.
    pub async fn run(&mut self, ctx: &mut RunContext) -> Result<RunSummary, PipelineError> {
        self.summary = Some(RunSummary::new(ctx));
        self.picker = None;
        self.record_state(PipelineState::Init);

        let result = self.drive(ctx).await;

        if self.picker.is_some() {
            self.stop_picker().await;
            if let Err(e) = ctx.paths.sync_flags().reset() {
                tracing::warn!(error = %e, "failed to clear picker flags");
            }
        }

        match result {
            Ok(()) => {
                self.record_state(PipelineState::Done);
                tracing::info!(dataset = %ctx.dataset(), "pipeline complete");
                let summary = self.summary_mut();
                summary.success = true;
                Ok(summary.clone())
            }
            Err(e) => {
                self.record_state(PipelineState::Error);
                let summary = self.summary_mut();
                summary.error_kind = Some(e.kind().to_string());
                summary.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn drive(&mut self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let planner = StagingPlanner::new(ctx.config.handoff_policy);

        self.transition(PipelineState::Validate)?;
        ctx.validate_preconditions()?;
        self.runner.check_runtime().await?;
        for dir in ctx.paths.writable_dirs() {
            planner.ensure_directory(dir)?;
        }

        self.transition(PipelineState::InteractiveStage)?;
        let port = self
            .ports
            .allocate(ctx.config.picker_port, ctx.config.picker_port_range)?;
        ctx.set_port(port);
        self.summary_mut().port = Some(port);

        let flags = ctx.paths.sync_flags();
        flags.reset()?;
        let picker = stages::picker_stage(ctx, port);
        self.runner.run_detached(&picker).await?;
        self.picker = Some(picker.container.clone());
        ctx.log().announce(&format!(
            "Point picker for '{}' at http://127.0.0.1:{}/",
            ctx.dataset(),
            port
        ));

        self.transition(PipelineState::AwaitSignal)?;
        let prompts = ctx.paths.prompts();
        let outcome = self
            .watcher
            .wait_for_signal(&flags.done, &prompts, &mut self.cancel)
            .await?;
        self.summary_mut().signal = Some(outcome);

        self.transition(PipelineState::Decide)?;
        self.stop_picker().await;
        let use_existing = flags.consume()?;
        let decision = decide(use_existing, prompts.is_file(), &prompts)?;
        tracing::info!(?outcome, ?decision, "operator decision");
        self.summary_mut().decision = Some(decision);

        if ctx.config.run_segmentation {
            self.transition(PipelineState::Segmentation)?;
            self.run_attached(stages::segmentation_stage(ctx)).await?;
        } else {
            tracing::info!("segmentation propagation skipped, reusing existing masks");
            self.record_stage(stages::SEGMENTATION_STAGE, StageOutcome::Skipped, 0.0);
        }

        self.transition(PipelineState::StageData1)?;
        self.stage_data(&planner, &staging::segmentation_handoff(&ctx.paths))?;

        self.transition(PipelineState::ReconstructionStage)?;
        self.run_attached(stages::reconstruction_stage(ctx)).await?;

        self.transition(PipelineState::StageData2)?;
        self.stage_data(&planner, &staging::reconstruction_handoff(&ctx.paths))?;

        self.transition(PipelineState::TrainingStage)?;
        self.run_attached(stages::training_stage(ctx)).await?;

        Ok(())
    }

    /// Enters `state` unless the operator has interrupted the run.
    fn transition(&mut self, state: PipelineState) -> Result<(), PipelineError> {
        if *self.cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }
        self.record_state(state);
        Ok(())
    }

    fn record_state(&mut self, state: PipelineState) {
        tracing::info!(?state, "pipeline state");
        self.summary_mut().states.push(state);
    }

    fn record_stage(&mut self, name: &str, outcome: StageOutcome, elapsed_secs: f64) {
        self.summary_mut().stages.push(StageRecord {
            name: name.to_string(),
            outcome,
            elapsed_secs,
        });
    }

    fn summary_mut(&mut self) -> &mut RunSummary {
        self.summary.get_or_insert_with(RunSummary::empty)
    }

    /// Runs an attached stage; an interrupt stops its container.
    async fn run_attached(&mut self, stage: Stage) -> Result<(), PipelineError> {
        let runner = Arc::clone(&self.runner);
        let started = Instant::now();

        let result = tokio::select! {
            r = runner.run_attached(&stage) => r,
            _ = cancelled(&mut self.cancel) => Err(PipelineError::Cancelled),
        };

        let outcome = match &result {
            Ok(()) => StageOutcome::Succeeded,
            Err(PipelineError::StageFailed { exit_code, .. }) => StageOutcome::Failed {
                exit_code: *exit_code,
            },
            Err(PipelineError::Cancelled) => {
                tracing::warn!(stage = %stage.name, "interrupted, stopping stage container");
                runner.stop(&stage.container).await;
                StageOutcome::Cancelled
            }
            Err(e) => StageOutcome::Errored {
                message: e.to_string(),
            },
        };
        self.record_stage(&stage.name, outcome, started.elapsed().as_secs_f64());

        result
    }

    fn stage_data(&mut self, planner: &StagingPlanner, plans: &[StagingPlan]) -> Result<(), PipelineError> {
        let reports = planner.execute(plans)?;
        for (plan, report) in plans.iter().zip(reports) {
            self.summary_mut().handoffs.push(HandoffRecord {
                plan: plan.label.clone(),
                report,
            });
        }
        Ok(())
    }

    async fn stop_picker(&mut self) {
        if let Some(name) = self.picker.take() {
            tracing::info!(container = %name, "stopping picker");
            self.runner.stop(&name).await;
        }
    }
}

/// Maps the flags left by the picker to a decision.
///
/// Whatever ended the wait, the pipeline can only continue with a prompts
/// artifact on disk.
fn decide(use_existing: bool, artifact_present: bool, artifact: &Path) -> Result<Decision, PipelineError> {
    match (use_existing, artifact_present) {
        (true, true) => Ok(Decision::UseExisting),
        (false, true) => Ok(Decision::NewArtifact),
        (true, false) => Err(PipelineError::missing_artifact(
            artifact,
            "'use existing' was selected but there are no previous prompts",
        )),
        (false, false) => Err(PipelineError::missing_artifact(
            artifact,
            "the picker finished without saving prompts",
        )),
    }
}

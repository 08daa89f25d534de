//! End-to-end controller tests.
//!
//! A recording fake stands in for the container runtime and reproduces each
//! tool's filesystem effects, so the whole state machine, the staging
//! handoffs and the run log can be checked without Docker.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use reconforge::execution::{Stage, StageRunner};
use reconforge::pipeline::{
    DatasetPaths, Decision, PipelineConfig, PipelineController, PipelineState, RunContext,
    StageOutcome,
};
use reconforge::ports::PortAllocator;
use reconforge::runlog::RunLogger;
use reconforge::signal::{cancel_channel, CancelReceiver, PollingSignalWatch, SignalOutcome};
use reconforge::staging::HandoffPolicy;
use reconforge::PipelineError;

/// What the simulated operator does in the picker.
#[derive(Clone, Copy)]
enum Operator {
    /// Saves fresh prompts and confirms.
    SavesPrompts,
    /// Clicks "use existing".
    UsesExisting,
    /// Never answers.
    Idle,
    /// Ticks "use existing" but never confirms.
    Abandons,
}

struct FakeRunner {
    paths: DatasetPaths,
    operator: Operator,
    fail: Option<(&'static str, i64)>,
    hang: Option<&'static str>,
    runtime_down: bool,
    write_cutouts: bool,
    events: Mutex<Vec<String>>,
}

impl FakeRunner {
    fn new(paths: DatasetPaths, operator: Operator) -> Self {
        Self {
            paths,
            operator,
            fail: None,
            hang: None,
            runtime_down: false,
            write_cutouts: true,
            events: Mutex::new(Vec::new()),
        }
    }

    fn failing(mut self, stage: &'static str, exit_code: i64) -> Self {
        self.fail = Some((stage, exit_code));
        self
    }

    /// `stage` never finishes on its own.
    fn hanging(mut self, stage: &'static str) -> Self {
        self.hang = Some(stage);
        self
    }

    fn runtime_down(mut self) -> Self {
        self.runtime_down = true;
        self
    }

    fn without_cutouts(mut self) -> Self {
        self.write_cutouts = false;
        self
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn simulate(&self, stage: &Stage) {
        let p = &self.paths;
        match stage.name.as_str() {
            "interactive" => match self.operator {
                Operator::SavesPrompts => {
                    write(&p.prompts(), r#"{"frame":0,"pos":[[10,20]],"neg":[]}"#);
                    write(&p.sync_flags().done, "");
                }
                Operator::UsesExisting => {
                    write(&p.sync_flags().use_existing, "");
                    write(&p.sync_flags().done, "");
                }
                Operator::Abandons => write(&p.sync_flags().use_existing, ""),
                Operator::Idle => {}
            },
            "segmentation" => {
                for i in 0..3 {
                    write(&p.indexed_frames.join(format!("{i:06}.jpg")), "frame");
                    write(&p.indexed_output.join(format!("{i:06}.png")), "mask");
                    if self.write_cutouts {
                        write(&p.masked_output.join(format!("{i:06}.png")), "cutout");
                    }
                }
                write(&p.indexed_output.join("preview/000000.png"), "preview");
            }
            "reconstruction" => {
                let staged = count_files(&p.reconstruction_images);
                self.record(format!("reconstruction saw {staged} images"));
                for name in ["cameras.bin", "images.bin", "points3D.bin"] {
                    write(&p.reconstruction_sparse.join("0").join(name), "model");
                }
                write(&p.reconstruction_workspace.join("database.db"), "db");
            }
            "training" => {
                let staged = count_files(&p.training_data.join("sparse"));
                self.record(format!("training saw {staged} sparse files"));
                write(&p.training_output.join("train/ours_30000/fuse.ply"), "mesh");
            }
            other => panic!("unexpected stage {other}"),
        }
    }
}

#[async_trait]
impl StageRunner for FakeRunner {
    async fn check_runtime(&self) -> Result<(), PipelineError> {
        self.record("check_runtime".to_string());
        if self.runtime_down {
            return Err(PipelineError::Environment(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        Ok(())
    }

    async fn run_detached(&self, stage: &Stage) -> Result<(), PipelineError> {
        self.record(format!("detached:{}", stage.name));
        self.simulate(stage);
        Ok(())
    }

    async fn run_attached(&self, stage: &Stage) -> Result<(), PipelineError> {
        self.record(format!("attached:{}", stage.name));
        if self.hang == Some(stage.name.as_str()) {
            std::future::pending::<()>().await;
        }
        if let Some((name, exit_code)) = self.fail {
            if name == stage.name {
                return Err(PipelineError::StageFailed {
                    stage: stage.name.clone(),
                    exit_code,
                });
            }
        }
        self.simulate(stage);
        Ok(())
    }

    async fn stop(&self, container: &str) {
        self.record(format!("stop:{container}"));
    }
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn count_files(dir: &Path) -> usize {
    walk(dir).len()
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    /// Tool roots with two raw frames for `bench01`.
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(&root.join("SAM2/data/in/bench01/IMG_0001.JPG"), "raw");
        write(&root.join("SAM2/data/in/bench01/IMG_0002.JPG"), "raw");
        fs::create_dir_all(root.join("colmap")).unwrap();
        fs::create_dir_all(root.join("training")).unwrap();
        Self { temp }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig::new("bench01")
            .with_segmentation_root(self.root().join("SAM2"))
            .with_reconstruction_root(self.root().join("colmap"))
            .with_training_root(self.root().join("training"))
            .with_log_dir(self.root().join("logs"))
            .with_poll_interval(Duration::from_millis(10))
    }

    fn paths(&self) -> DatasetPaths {
        DatasetPaths::new(
            "bench01",
            &self.root().join("SAM2"),
            &self.root().join("colmap"),
            &self.root().join("training"),
            "_indexed",
        )
    }
}

fn controller(runner: Arc<FakeRunner>, cancel: CancelReceiver) -> PipelineController {
    controller_with_timeout(runner, cancel, Duration::from_secs(10))
}

fn controller_with_timeout(
    runner: Arc<FakeRunner>,
    cancel: CancelReceiver,
    picker_timeout: Duration,
) -> PipelineController {
    let watch = PollingSignalWatch::new(Duration::from_millis(10)).with_timeout(Some(picker_timeout));
    PipelineController::new(runner, Box::new(watch), cancel)
        .with_port_allocator(PortAllocator::new().with_host(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

#[tokio::test]
async fn test_end_to_end_new_prompts() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);

    let mut ctx = RunContext::new(fixture.config()).unwrap();
    let logger = RunLogger::new(ctx.log().clone());
    let mut console = Vec::new();

    let summary = logger
        .with_captured_output_to(controller.run(&mut ctx), &mut console)
        .await
        .unwrap();

    let port = summary.port.unwrap();
    let picker = format!("stop:sam2-picker-bench01-{port}");
    assert_eq!(
        runner.events(),
        vec![
            "check_runtime".to_string(),
            "detached:interactive".to_string(),
            picker,
            "attached:segmentation".to_string(),
            "attached:reconstruction".to_string(),
            "reconstruction saw 3 images".to_string(),
            "attached:training".to_string(),
            "training saw 3 sparse files".to_string(),
        ]
    );

    assert_eq!(
        summary.states,
        vec![
            PipelineState::Init,
            PipelineState::Validate,
            PipelineState::InteractiveStage,
            PipelineState::AwaitSignal,
            PipelineState::Decide,
            PipelineState::Segmentation,
            PipelineState::StageData1,
            PipelineState::ReconstructionStage,
            PipelineState::StageData2,
            PipelineState::TrainingStage,
            PipelineState::Done,
        ]
    );
    assert!(summary.success);
    assert_eq!(summary.signal, Some(SignalOutcome::Completed));
    assert_eq!(summary.decision, Some(Decision::NewArtifact));
    assert_eq!(
        summary.launched_stages(),
        vec!["segmentation", "reconstruction", "training"]
    );

    // Handoffs: masks without previews, training inputs complete.
    let paths = fixture.paths();
    assert_eq!(count_files(&paths.reconstruction_masks), 3);
    assert!(paths.reconstruction_masks.join("000000.png.png").is_file());
    assert!(!paths.reconstruction_masks.join("preview").exists());
    assert_eq!(count_files(&paths.training_data.join("images")), 3);
    assert_eq!(count_files(&paths.training_data.join("masked")), 3);
    assert!(!paths.training_data.join("sparse/database.db").exists());
    assert!(paths.training_output.join("train/ours_30000/fuse.ply").exists());

    // Flags consumed, prompts kept for the next run.
    assert!(!paths.sync_flags().done.exists());
    assert!(paths.prompts().exists());

    // Status block and run log.
    let console = String::from_utf8(console).unwrap();
    assert!(console.starts_with("STATUS: OK\nLOG: "));
    let log_path = ctx.log_path().to_path_buf();
    let name = log_path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("bench01_") && name.ends_with(".log"));
    let contents = fs::read_to_string(&log_path).unwrap();
    assert!(!contents.is_empty());
    assert!(contents.contains("Point picker for 'bench01'"));
    assert!(contents.contains("STATUS: OK"));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let fixture = Fixture::new();
    let paths = fixture.paths();

    for _ in 0..2 {
        let runner = Arc::new(FakeRunner::new(paths.clone(), Operator::SavesPrompts));
        let (_cancel_tx, cancel_rx) = cancel_channel();
        let mut ctx = RunContext::new(fixture.config()).unwrap();
        let summary = controller(runner, cancel_rx).run(&mut ctx).await.unwrap();
        assert!(summary.success);
    }

    let mut staged: Vec<PathBuf> = walk(&paths.training_data)
        .into_iter()
        .map(|p| p.strip_prefix(&paths.training_data).unwrap().to_path_buf())
        .collect();
    staged.sort();
    assert_eq!(staged.len(), 9);
    assert!(staged.contains(&PathBuf::from("sparse/0/cameras.bin")));
}

#[tokio::test]
async fn test_reconstruction_failure_stops_before_training() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts).failing("reconstruction", 3));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);

    let mut ctx = RunContext::new(fixture.config()).unwrap();
    let logger = RunLogger::new(ctx.log().clone());
    let mut console = Vec::new();

    let err = logger
        .with_captured_output_to(controller.run(&mut ctx), &mut console)
        .await
        .unwrap_err();

    match &err {
        PipelineError::StageFailed { stage, exit_code } => {
            assert_eq!(stage, "reconstruction");
            assert_eq!(*exit_code, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), "StageFailedError");

    let events = runner.events();
    assert!(events.contains(&"attached:reconstruction".to_string()));
    assert!(!events.iter().any(|e| e.contains("training")));

    let summary = controller.summary().unwrap();
    assert_eq!(summary.states.last(), Some(&PipelineState::Error));
    assert!(!summary.states.contains(&PipelineState::StageData2));
    assert_eq!(summary.error_kind.as_deref(), Some("StageFailedError"));
    assert!(!fixture.paths().training_data.join("sparse").exists());

    let console = String::from_utf8(console).unwrap();
    assert!(console.starts_with("STATUS: ERROR\nLOG: "));
    assert!(console.contains(&ctx.log_path().display().to_string()));
}

#[tokio::test]
async fn test_missing_tool_root_fails_before_any_container() {
    let fixture = Fixture::new();
    fs::remove_dir_all(fixture.root().join("training")).unwrap();

    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let err = controller(runner.clone(), cancel_rx)
        .run(&mut ctx)
        .await
        .unwrap_err();

    match err {
        PipelineError::Precondition { path } => assert_eq!(path, fixture.root().join("training")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(runner.events().is_empty());
}

#[tokio::test]
async fn test_use_existing_reuses_previous_prompts() {
    let fixture = Fixture::new();
    let paths = fixture.paths();
    write(&paths.prompts(), r#"{"frame":0,"pos":[[1,1]],"neg":[]}"#);

    let runner = Arc::new(FakeRunner::new(paths.clone(), Operator::UsesExisting));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let summary = controller(runner, cancel_rx).run(&mut ctx).await.unwrap();

    assert_eq!(summary.decision, Some(Decision::UseExisting));
    assert!(!paths.sync_flags().use_existing.exists());
}

#[tokio::test]
async fn test_use_existing_without_prompts_is_missing_artifact() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::UsesExisting));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let err = controller.run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    assert!(runner.events().iter().any(|e| e.starts_with("stop:sam2-picker-bench01-")));
    assert!(!runner.events().iter().any(|e| e.starts_with("attached:")));
}

#[tokio::test]
async fn test_missing_cutouts_best_effort_and_strict() {
    for (policy, should_succeed) in [(HandoffPolicy::BestEffort, true), (HandoffPolicy::Strict, false)] {
        let fixture = Fixture::new();
        let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts).without_cutouts());
        let (_cancel_tx, cancel_rx) = cancel_channel();
        let mut ctx = RunContext::new(fixture.config().with_handoff_policy(policy)).unwrap();

        let result = controller(runner.clone(), cancel_rx).run(&mut ctx).await;

        if should_succeed {
            let summary = result.unwrap();
            let masked = summary
                .handoffs
                .iter()
                .find(|h| h.plan == "masked-cutouts")
                .unwrap();
            assert!(masked.report.source_missing);
            assert!(runner.events().contains(&"attached:training".to_string()));
        } else {
            match result.unwrap_err() {
                PipelineError::MissingArtifact { path, .. } => {
                    assert_eq!(path, fixture.paths().masked_output);
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(!runner.events().contains(&"attached:training".to_string()));
        }
    }
}

#[tokio::test]
async fn test_skip_segmentation_reuses_existing_outputs() {
    let fixture = Fixture::new();
    let paths = fixture.paths();
    write(&paths.indexed_frames.join("000000.jpg"), "frame");
    write(&paths.indexed_output.join("000000.png"), "mask");
    write(&paths.masked_output.join("000000.png"), "cutout");

    let runner = Arc::new(FakeRunner::new(paths.clone(), Operator::SavesPrompts));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut ctx = RunContext::new(fixture.config().with_segmentation(false)).unwrap();

    let summary = controller(runner.clone(), cancel_rx).run(&mut ctx).await.unwrap();

    assert!(!summary.states.contains(&PipelineState::Segmentation));
    assert_eq!(summary.launched_stages(), vec!["reconstruction", "training"]);
    assert!(runner.events().contains(&"reconstruction saw 1 images".to_string()));
}

#[tokio::test]
async fn test_interrupt_while_waiting_cleans_up() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::Idle));
    let (cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = cancel_tx.send(true);
    });

    let err = controller.run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    let events = runner.events();
    assert_eq!(events.first().map(String::as_str), Some("check_runtime"));
    assert!(events.last().unwrap().starts_with("stop:sam2-picker-bench01-"));
    assert_eq!(
        controller.summary().unwrap().states.last(),
        Some(&PipelineState::Error)
    );
}

#[tokio::test]
async fn test_interrupt_during_stage_stops_its_container() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts).hanging("reconstruction"));
    let (cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let interrupter = runner.clone();
    tokio::spawn(async move {
        while !interrupter.events().contains(&"attached:reconstruction".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = cancel_tx.send(true);
    });

    let err = tokio::time::timeout(Duration::from_secs(10), controller.run(&mut ctx))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    let events = runner.events();
    assert_eq!(events.last().map(String::as_str), Some("stop:colmap-bench01"));
    assert!(!events.contains(&"attached:training".to_string()));

    let summary = controller.summary().unwrap();
    let last = summary.stages.last().unwrap();
    assert_eq!(last.name, "reconstruction");
    assert_eq!(last.outcome, StageOutcome::Cancelled);
    assert_eq!(summary.states.last(), Some(&PipelineState::Error));
    assert!(!summary.states.contains(&PipelineState::StageData2));
    assert_eq!(summary.error_kind.as_deref(), Some("Cancelled"));
}

#[tokio::test]
async fn test_unreachable_runtime_fails_before_picker() {
    let fixture = Fixture::new();
    let runner = Arc::new(FakeRunner::new(fixture.paths(), Operator::SavesPrompts).runtime_down());
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller(runner.clone(), cancel_rx);
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let err = controller.run(&mut ctx).await.unwrap_err();

    assert_eq!(err.kind(), "EnvironmentError");
    assert_eq!(runner.events(), vec!["check_runtime".to_string()]);
    let summary = controller.summary().unwrap();
    assert_eq!(
        summary.states,
        vec![PipelineState::Init, PipelineState::Validate, PipelineState::Error]
    );
    assert_eq!(summary.port, None);
}

#[tokio::test]
async fn test_picker_timeout_stops_picker_and_clears_flags() {
    let fixture = Fixture::new();
    let paths = fixture.paths();
    let runner = Arc::new(FakeRunner::new(paths.clone(), Operator::Abandons));
    let (_cancel_tx, cancel_rx) = cancel_channel();
    let mut controller = controller_with_timeout(runner.clone(), cancel_rx, Duration::from_millis(100));
    let mut ctx = RunContext::new(fixture.config()).unwrap();

    let err = controller.run(&mut ctx).await.unwrap_err();

    assert!(matches!(err, PipelineError::Timeout(_)));
    assert_eq!(err.kind(), "TimeoutError");
    let events = runner.events();
    assert!(events.last().unwrap().starts_with("stop:sam2-picker-bench01-"));
    assert!(!events.iter().any(|e| e.starts_with("attached:")));
    assert!(!paths.sync_flags().use_existing.exists());
    assert!(!paths.sync_flags().done.exists());

    let summary = controller.summary().unwrap();
    assert_eq!(summary.signal, None);
    assert!(!summary.states.contains(&PipelineState::Decide));
}

#[tokio::test]
async fn test_concurrent_run_on_same_dataset_is_rejected() {
    let fixture = Fixture::new();
    let _running = RunContext::new(fixture.config()).unwrap();

    let err = RunContext::new(fixture.config()).unwrap_err();
    assert!(matches!(err, PipelineError::RunInProgress { .. }));
}

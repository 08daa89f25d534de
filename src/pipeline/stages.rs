//! Stage declarations, built just-in-time from the run context.
//!
//! Mount points, environment and entry commands here are the contract with
//! the three tool images; everything else about those tools is opaque.

use crate::execution::{Stage, StageMode};
use crate::pipeline::context::RunContext;

/// Port the picker's web server listens on inside its container.
pub const PICKER_CONTAINER_PORT: u16 = 5000;

pub const INTERACTIVE_STAGE: &str = "interactive";
pub const SEGMENTATION_STAGE: &str = "segmentation";
pub const RECONSTRUCTION_STAGE: &str = "reconstruction";
pub const TRAINING_STAGE: &str = "training";

/// Picker container name; dataset and port keep concurrent pickers apart.
pub fn picker_container_name(dataset: &str, port: u16) -> String {
    format!("sam2-picker-{}-{}", dataset, port)
}

/// Detached point picker serving on `port`.
pub fn picker_stage(ctx: &RunContext, port: u16) -> Stage {
    let dataset = ctx.dataset();

    Stage::new(
        INTERACTIVE_STAGE,
        StageMode::Detached,
        &ctx.config.segmentation_image,
        picker_container_name(dataset, port),
    )
    .mount(&ctx.paths.segmentation_data, "/data")
    .env("DATASET_NAME", dataset)
    .env("INPUT", format!("/data/in/{dataset}"))
    .env("OUT", "/data/out")
    .env("INDEX_SUFFIX", &ctx.config.index_suffix)
    .env("PORT", PICKER_CONTAINER_PORT)
    .command(["python3", "app/point_picker_flask.py"])
    .gpu()
    .publish(port, PICKER_CONTAINER_PORT)
}

/// Propagates the picked prompts to every frame and writes masks and cutouts.
pub fn segmentation_stage(ctx: &RunContext) -> Stage {
    let dataset = ctx.dataset();

    Stage::new(
        SEGMENTATION_STAGE,
        StageMode::Attached,
        &ctx.config.segmentation_image,
        ctx.container_name("sam2-predict"),
    )
    .mount(&ctx.paths.segmentation_data, "/data")
    .env("DATASET_NAME", dataset)
    .env("INPUT", format!("/data/in/{dataset}"))
    .env("OUT", "/data/out")
    .env("INDEX_SUFFIX", &ctx.config.index_suffix)
    .env("QUIET", 0)
    .command(["python3", "app/video_predict.py"])
    .gpu()
}

/// Structure-from-motion over the staged images.
pub fn reconstruction_stage(ctx: &RunContext) -> Stage {
    Stage::new(
        RECONSTRUCTION_STAGE,
        StageMode::Attached,
        &ctx.config.reconstruction_image,
        ctx.container_name("colmap"),
    )
    .mount(&ctx.paths.reconstruction_workspace, "/workspace")
    .working_dir("/workspace")
    .command([
        "colmap",
        "automatic_reconstructor",
        "--workspace_path",
        "/workspace",
        "--image_path",
        "/workspace/images",
        "--mask_path",
        "/workspace/masks",
    ])
    .gpu()
}

/// Surface training followed by mesh extraction.
pub fn training_stage(ctx: &RunContext) -> Stage {
    let script = format!(
        "python train.py -s /data -m /output --iterations {iters} \
         && python render.py -s /data -m /output --skip_test --skip_train",
        iters = ctx.config.train_iterations
    );

    Stage::new(
        TRAINING_STAGE,
        StageMode::Attached,
        &ctx.config.training_image,
        ctx.container_name("2dgs"),
    )
    .mount(&ctx.paths.training_data, "/data")
    .mount(&ctx.paths.training_output, "/output")
    .mount(&ctx.paths.training_cache, "/cache")
    .env("XDG_CACHE_HOME", "/cache")
    .env("TORCH_HOME", "/cache/torch")
    .command(["bash", "-lc", script.as_str()])
    .gpu()
}

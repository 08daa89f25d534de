//! Handoff plans for the two stage boundaries.

use crate::pipeline::context::DatasetPaths;

use super::StagingPlan;

/// Frames and masks the segmentation and reconstruction tools read.
pub const IMAGE_PATTERNS: &[&str] = &["*.jpg", "*.jpeg", "*.png"];

/// Sparse model files the training stage consumes.
pub const SPARSE_PATTERNS: &[&str] = &["*.bin", "*.txt", "*.ply"];

/// Suffix structure-from-motion expects on a mask file.
pub const MASK_SUFFIX: &str = ".png";

/// Segmentation → reconstruction: indexed frames (required) and masks.
///
/// Masks share their frame's file name; structure-from-motion looks a mask up
/// as `<image name>.png`, so the mask plan appends that suffix.
pub fn segmentation_handoff(paths: &DatasetPaths) -> Vec<StagingPlan> {
    vec![
        StagingPlan::new(
            "indexed-frames",
            &paths.indexed_frames,
            &paths.reconstruction_images,
            IMAGE_PATTERNS,
        )
        .required(),
        StagingPlan::new(
            "masks",
            &paths.indexed_output,
            &paths.reconstruction_masks,
            IMAGE_PATTERNS,
        )
        .excluding_dir("preview")
        .with_target_suffix(MASK_SUFFIX),
    ]
}

/// Reconstruction → training: sparse model, registered images and cutouts.
pub fn reconstruction_handoff(paths: &DatasetPaths) -> Vec<StagingPlan> {
    vec![
        StagingPlan::new(
            "sparse-model",
            &paths.reconstruction_sparse,
            paths.training_data.join("sparse"),
            SPARSE_PATTERNS,
        )
        .required(),
        StagingPlan::new(
            "registered-images",
            &paths.reconstruction_images,
            paths.training_data.join("images"),
            IMAGE_PATTERNS,
        )
        .required(),
        StagingPlan::new(
            "masked-cutouts",
            &paths.masked_output,
            paths.training_data.join("masked"),
            IMAGE_PATTERNS,
        )
        .required(),
    ]
}

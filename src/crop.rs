//! Tight crops around the segmented object, shared by image, mask and trajectory.

use image::RgbImage;

use crate::types::{BBox, Mask, ObjectCrop, Point, Trajectory};

/// Pixels added around the mask bounding box
pub const DEFAULT_MARGIN: u32 = 100;

/// Result of cropping one frame
#[derive(Debug, Clone)]
pub struct CroppedFrame {
    pub masked_image: RgbImage,
    pub mask: Mask,
    pub trajectory: Trajectory,
    /// Region of the source frame that was kept
    pub bounds: BBox,
}

/// Crop bounds for `mask`: foreground box grown by `margin`, clamped to the
/// frame. An all-background mask keeps the whole frame.
pub fn crop_bounds(mask: &Mask, margin: u32) -> BBox {
    match mask.bbox() {
        Some(bbox) => bbox.expand(margin, mask.width, mask.height),
        None => BBox {
            x1: 0,
            y1: 0,
            x2: mask.width,
            y2: mask.height,
        },
    }
}

/// Crop a masked image, its mask and trajectory to the same region
pub fn crop_frame(
    masked_image: &RgbImage,
    mask: &Mask,
    trajectory: &[Point],
    margin: u32,
) -> CroppedFrame {
    let bounds = crop_bounds(mask, margin);
    let cropped_image = image::imageops::crop_imm(
        masked_image,
        bounds.x1,
        bounds.y1,
        bounds.width(),
        bounds.height(),
    )
    .to_image();
    let cropped_trajectory = trajectory
        .iter()
        .map(|&[x, y]| [x - bounds.x1 as f32, y - bounds.y1 as f32])
        .collect();

    CroppedFrame {
        masked_image: cropped_image,
        mask: mask.crop(bounds),
        trajectory: cropped_trajectory,
        bounds,
    }
}

/// Crop every frame independently; missing trajectories crop to empty ones
pub fn crop_frames(
    crops: &[ObjectCrop],
    trajectories: Option<&[Trajectory]>,
    margin: u32,
) -> Vec<CroppedFrame> {
    crops
        .iter()
        .enumerate()
        .map(|(idx, crop)| {
            let traj = trajectories
                .and_then(|t| t.get(idx))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            crop_frame(&crop.masked_image, &crop.mask, traj, margin)
        })
        .collect()
}

//! Shared type definitions for episode retrieval.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// A 2D image-space point `[x, y]`.
pub type Point = [f32; 2];

/// Ordered trajectory points; the first point is the initial contact point.
pub type Trajectory = Vec<Point>;

/// Pixel bounding box in format (x1, y1, x2, y2), end-exclusive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Grow by `margin` on every side, clamped to a `width` x `height` frame
    pub fn expand(&self, margin: u32, width: u32, height: u32) -> Self {
        Self {
            x1: self.x1.saturating_sub(margin),
            y1: self.y1.saturating_sub(margin),
            x2: self.x2.saturating_add(margin).min(width),
            y2: self.y2.saturating_add(margin).min(height),
        }
    }
}

/// Binary segmentation mask
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<bool>, // Flattened row-major format
}

impl Mask {
    /// Create a new mask
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        assert_eq!(
            data.len(),
            (width * height) as usize,
            "Mask data size must match width * height"
        );
        Self {
            width,
            height,
            data,
        }
    }

    /// All-foreground mask. Used as the "no object found" sentinel.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![true; (width * height) as usize])
    }

    /// All-background mask
    pub fn empty(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![false; (width * height) as usize])
    }

    /// Get mask value at (x, y)
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        self.data[(y * self.width + x) as usize]
    }

    /// True when every pixel is foreground
    pub fn is_full(&self) -> bool {
        self.data.iter().all(|&b| b)
    }

    /// True when no pixel is foreground
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&b| b)
    }

    /// Get bounding box from mask
    pub fn bbox(&self) -> Option<BBox> {
        let mut min_x = self.width;
        let mut max_x = 0;
        let mut min_y = self.height;
        let mut max_y = 0;
        let mut found = false;

        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    found = true;
                    min_x = min_x.min(x);
                    max_x = max_x.max(x);
                    min_y = min_y.min(y);
                    max_y = max_y.max(y);
                }
            }
        }

        if found {
            Some(BBox {
                x1: min_x,
                y1: min_y,
                x2: max_x + 1,
                y2: max_y + 1,
            })
        } else {
            None
        }
    }

    /// Copy out the region covered by `bbox`
    pub fn crop(&self, bbox: BBox) -> Self {
        let mut data = Vec::with_capacity((bbox.width() * bbox.height()) as usize);
        for y in bbox.y1..bbox.y2 {
            for x in bbox.x1..bbox.x2 {
                data.push(self.get(x, y));
            }
        }
        Self::new(bbox.width(), bbox.height(), data)
    }

    /// Get number of true pixels
    pub fn pixel_count(&self) -> usize {
        self.data.iter().filter(|&&b| b).count()
    }
}

/// A segmented object: the white-background masked image and its mask
#[derive(Debug, Clone)]
pub struct ObjectCrop {
    pub masked_image: RgbImage,
    pub mask: Mask,
}

/// The live observation after segmentation
#[derive(Debug, Clone)]
pub struct QueryObject {
    /// The raw observation
    pub image: RgbImage,
    pub masked_image: RgbImage,
    pub mask: Mask,
    /// Region of `image` covered by `masked_image` and `mask`
    pub bounds: BBox,
}

/// One ranked candidate drawn from an episode bundle
#[derive(Debug, Clone)]
pub struct Candidate {
    pub image: RgbImage,
    /// In the segmented (and cropped, when enabled) frame
    pub trajectory: Trajectory,
    pub masked_image: RgbImage,
    pub mask: Mask,
}

/// Query plus an ordered candidate list, threaded through the ranking stages
#[derive(Debug, Clone)]
pub struct RetrievalBundle {
    pub query: QueryObject,
    pub candidates: Vec<Candidate>,
}

impl RetrievalBundle {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Final answer of a retrieval call
#[derive(Debug, Clone)]
pub struct TopMatch {
    /// Task name chosen by the language stage
    pub task: String,
    pub query: QueryObject,
    pub candidate: Candidate,
}

/// Displacement from the first to the last trajectory point
pub fn end_start_direction(trajectory: &[Point]) -> Option<Point> {
    let first = trajectory.first()?;
    let last = trajectory.last()?;
    Some([last[0] - first[0], last[1] - first[1]])
}

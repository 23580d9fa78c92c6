//! Per-task episode bundles: cache file codec, in-process store and
//! memoized segmentation.

use fxhash::FxHashMap;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{Task, TaskCatalog};
use crate::crop::crop_frames;
use crate::error::{Result, RetrievalError};
use crate::models::ObjectSegmenter;
use crate::segmentation::{segment_frames, SegmentThresholds};
use crate::types::{Candidate, Mask, ObjectCrop, Point, Trajectory};

/// One recorded episode frame
#[derive(Debug, Clone)]
pub struct EpisodeRecord {
    pub image: RgbImage,
    /// In source-image coordinates until enrichment crops it
    pub trajectory: Trajectory,
    pub segmentation: Option<ObjectCrop>,
}

impl EpisodeRecord {
    pub fn new(image: RgbImage, trajectory: Trajectory) -> Self {
        Self {
            image,
            trajectory,
            segmentation: None,
        }
    }

    pub fn contact_point(&self) -> Option<Point> {
        self.trajectory.first().copied()
    }
}

/// How episode frames are segmented on first use
#[derive(Debug, Clone, Copy)]
pub struct EnrichOptions {
    pub thresholds: SegmentThresholds,
    /// Crop margin; `None` leaves frames uncropped
    pub crop_margin: Option<u32>,
}

/// All recorded frames for one task
#[derive(Debug, Clone)]
pub struct EpisodeBundle {
    pub task: Task,
    pub records: Vec<EpisodeRecord>,
    enriched: bool,
}

impl EpisodeBundle {
    pub fn new(task: Task, records: Vec<EpisodeRecord>) -> Self {
        Self {
            task,
            records,
            enriched: false,
        }
    }

    pub fn is_enriched(&self) -> bool {
        self.enriched
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Segment (and crop) every frame unless already done.
    ///
    /// Returns whether any work was performed. On error the bundle is left
    /// untouched.
    pub fn ensure_enriched(
        &mut self,
        segmenter: &dyn ObjectSegmenter,
        object_name: &str,
        options: EnrichOptions,
    ) -> Result<bool> {
        if self.enriched {
            return Ok(false);
        }

        info!(
            "Segmenting {} episode frame(s) for '{}'",
            self.records.len(),
            self.task
        );
        let frames = self
            .records
            .iter()
            .map(|r| (&r.image, r.contact_point()));
        let crops = segment_frames(segmenter, frames, object_name, options.thresholds)?;

        match options.crop_margin {
            Some(margin) => {
                let trajectories: Vec<Trajectory> = self
                    .records
                    .iter_mut()
                    .map(|r| std::mem::take(&mut r.trajectory))
                    .collect();
                let cropped = crop_frames(&crops, Some(&trajectories), margin);
                for (record, frame) in self.records.iter_mut().zip(cropped) {
                    record.trajectory = frame.trajectory;
                    record.segmentation = Some(ObjectCrop {
                        masked_image: frame.masked_image,
                        mask: frame.mask,
                    });
                }
            }
            None => {
                for (record, crop) in self.records.iter_mut().zip(crops) {
                    record.segmentation = Some(crop);
                }
            }
        }

        self.enriched = true;
        Ok(true)
    }

    /// Ranking candidates, one per record, in record order
    pub fn candidates(&self) -> Result<Vec<Candidate>> {
        self.records
            .iter()
            .enumerate()
            .map(|(idx, record)| {
                let seg = record.segmentation.as_ref().ok_or_else(|| {
                    RetrievalError::CorruptCache {
                        task: self.task.to_string(),
                        reason: format!("record {idx} has not been segmented"),
                    }
                })?;
                Ok(Candidate {
                    image: record.image.clone(),
                    trajectory: record.trajectory.clone(),
                    masked_image: seg.masked_image.clone(),
                    mask: seg.mask.clone(),
                })
            })
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredBundle {
            records: self.records.iter().map(StoredRecord::from_record).collect(),
            enriched: self.enriched,
        };
        Ok(bincode::serde::encode_to_vec(
            &stored,
            bincode::config::standard(),
        )?)
    }

    pub fn from_bytes(task: Task, bytes: &[u8]) -> Result<Self> {
        let (stored, _): (StoredBundle, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        stored.into_bundle(task)
    }
}

/// Write a bundle to `path` atomically (temp file + rename)
pub async fn save_bundle(path: &Path, bundle: &EpisodeBundle) -> Result<()> {
    let bytes = bundle.to_bytes()?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("pkl.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Loaded bundles, each behind its own lock so concurrent retrievals of the
/// same task serialize on enrichment.
#[derive(Default)]
pub struct EpisodeStore {
    loaded: std::sync::Mutex<FxHashMap<Task, Arc<Mutex<EpisodeBundle>>>>,
}

impl EpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle for `task`, reading its cache file on first access
    pub async fn get(&self, catalog: &TaskCatalog, task: &Task) -> Result<Arc<Mutex<EpisodeBundle>>> {
        if let Some(bundle) = self.cached(task) {
            return Ok(bundle);
        }

        let path = catalog.cache_path(task);
        if !tokio::fs::try_exists(&path).await? {
            return Err(RetrievalError::MissingCache {
                task: task.to_string(),
                path,
            });
        }

        let bytes = tokio::fs::read(&path).await?;
        let bundle = EpisodeBundle::from_bytes(task.clone(), &bytes)?;
        info!(
            "Loaded {} episode(s) for '{}' (enriched: {})",
            bundle.len(),
            task,
            bundle.is_enriched()
        );

        let mut loaded = self.lock_map();
        // A concurrent caller may have loaded the same task meanwhile.
        Ok(loaded
            .entry(task.clone())
            .or_insert_with(|| Arc::new(Mutex::new(bundle)))
            .clone())
    }

    /// Write the in-memory bundle for `task` back to its cache file
    pub async fn persist(&self, catalog: &TaskCatalog, task: &Task) -> Result<()> {
        let Some(bundle) = self.cached(task) else {
            return Err(RetrievalError::MissingCache {
                task: task.to_string(),
                path: catalog.cache_path(task),
            });
        };
        let bundle = bundle.lock().await;
        save_bundle(&catalog.cache_path(task), &bundle).await?;
        info!("Persisted episode bundle for '{}'", task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, task: &Task) -> Option<Arc<Mutex<EpisodeBundle>>> {
        self.lock_map().get(task).cloned()
    }

    fn lock_map(&self) -> std::sync::MutexGuard<'_, FxHashMap<Task, Arc<Mutex<EpisodeBundle>>>> {
        // The map is only touched by short, non-panicking critical sections.
        self.loaded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl StoredImage {
    fn from_image(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            pixels: image.as_raw().clone(),
        }
    }

    fn into_image(self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    image: StoredImage,
    trajectory: Trajectory,
    masked_image: Option<StoredImage>,
    mask: Option<Mask>,
}

impl StoredRecord {
    fn from_record(record: &EpisodeRecord) -> Self {
        Self {
            image: StoredImage::from_image(&record.image),
            trajectory: record.trajectory.clone(),
            masked_image: record
                .segmentation
                .as_ref()
                .map(|s| StoredImage::from_image(&s.masked_image)),
            mask: record.segmentation.as_ref().map(|s| s.mask.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredBundle {
    records: Vec<StoredRecord>,
    enriched: bool,
}

impl StoredBundle {
    fn into_bundle(self, task: Task) -> Result<EpisodeBundle> {
        let corrupt = |reason: String| RetrievalError::CorruptCache {
            task: task.to_string(),
            reason,
        };

        let mut records = Vec::with_capacity(self.records.len());
        for (idx, stored) in self.records.into_iter().enumerate() {
            let image = stored
                .image
                .into_image()
                .ok_or_else(|| corrupt(format!("record {idx}: image buffer size mismatch")))?;

            let segmentation = match (stored.masked_image, stored.mask) {
                (Some(masked), Some(mask)) => {
                    let masked_image = masked.into_image().ok_or_else(|| {
                        corrupt(format!("record {idx}: masked image buffer size mismatch"))
                    })?;
                    if mask.data.len() != (mask.width * mask.height) as usize
                        || masked_image.dimensions() != (mask.width, mask.height)
                    {
                        return Err(corrupt(format!(
                            "record {idx}: mask does not match masked image"
                        )));
                    }
                    Some(ObjectCrop { masked_image, mask })
                }
                (None, None) => None,
                _ => {
                    return Err(corrupt(format!(
                        "record {idx}: masked image and mask must be stored together"
                    )))
                }
            };

            if self.enriched && segmentation.is_none() {
                return Err(corrupt(format!(
                    "record {idx}: bundle is marked enriched but has no segmentation"
                )));
            }

            records.push(EpisodeRecord {
                image,
                trajectory: stored.trajectory,
                segmentation,
            });
        }

        Ok(EpisodeBundle {
            task,
            records,
            enriched: self.enriched,
        })
    }
}

//! Dense-correspondence distance between two masked feature maps.
//!
//! Every masked source cell is matched to its most similar masked target
//! cell, and that target cell is matched back into the source. The distance
//! is the mean displacement of this round trip in normalized source
//! coordinates: 0 when the correspondence is cycle-consistent everywhere,
//! growing as the object geometry disagrees.

use ndarray::{Array2, Axis};

use crate::models::FeatureMap;
use crate::types::Mask;

/// Cap on source cells sampled per comparison
const MAX_SOURCE_POINTS: usize = 1024;

pub fn imd_distance(src: &FeatureMap, tgt: &FeatureMap, src_mask: &Mask, tgt_mask: &Mask) -> f32 {
    if src.channels() != tgt.channels() || src.channels() == 0 {
        return f32::INFINITY;
    }

    let src_cells = subsample(masked_cells(src, src_mask), MAX_SOURCE_POINTS);
    let tgt_cells = masked_cells(tgt, tgt_mask);
    if src_cells.is_empty() || tgt_cells.is_empty() {
        return f32::INFINITY;
    }

    let src_feats = gather_normalized(src, &src_cells);
    let tgt_feats = gather_normalized(tgt, &tgt_cells);

    // [n_src, n_tgt] cosine similarities
    let sim = src_feats.dot(&tgt_feats.t());

    let forward: Vec<usize> = sim.axis_iter(Axis(0)).map(|row| argmax(row.iter())).collect();
    let backward: Vec<usize> = sim.axis_iter(Axis(1)).map(|col| argmax(col.iter())).collect();

    let (w, h) = (src.width() as f32, src.height() as f32);
    let total: f32 = src_cells
        .iter()
        .enumerate()
        .map(|(i, &(y, x))| {
            let (by, bx) = src_cells[backward[forward[i]]];
            let dx = (bx as f32 - x as f32) / w;
            let dy = (by as f32 - y as f32) / h;
            (dx * dx + dy * dy).sqrt()
        })
        .sum();

    total / src_cells.len() as f32
}

/// Feature cells whose centre falls on mask foreground; all cells when none do
fn masked_cells(map: &FeatureMap, mask: &Mask) -> Vec<(usize, usize)> {
    let (h, w) = (map.height(), map.width());
    let mut cells = Vec::new();
    for y in 0..h {
        let my = (((y as f32 + 0.5) * mask.height as f32 / h as f32) as u32)
            .min(mask.height.saturating_sub(1));
        for x in 0..w {
            let mx = (((x as f32 + 0.5) * mask.width as f32 / w as f32) as u32)
                .min(mask.width.saturating_sub(1));
            if mask.get(mx, my) {
                cells.push((y, x));
            }
        }
    }
    if cells.is_empty() {
        (0..h).flat_map(|y| (0..w).map(move |x| (y, x))).collect()
    } else {
        cells
    }
}

fn subsample(cells: Vec<(usize, usize)>, limit: usize) -> Vec<(usize, usize)> {
    if cells.len() <= limit {
        return cells;
    }
    let stride = cells.len().div_ceil(limit);
    cells.into_iter().step_by(stride).collect()
}

/// Rows of unit-length feature vectors, one per cell
fn gather_normalized(map: &FeatureMap, cells: &[(usize, usize)]) -> Array2<f32> {
    let c = map.channels();
    let mut out = Array2::<f32>::zeros((cells.len(), c));
    for (row, &(y, x)) in cells.iter().enumerate() {
        let mut norm = 0.0f32;
        for k in 0..c {
            let v = map.data[[k, y, x]];
            out[[row, k]] = v;
            norm += v * v;
        }
        let norm = norm.sqrt();
        if norm > 0.0 {
            out.row_mut(row).mapv_inplace(|v| v / norm);
        }
    }
    out
}

fn argmax<'a>(values: impl Iterator<Item = &'a f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

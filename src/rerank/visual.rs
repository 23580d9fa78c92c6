//! Semantic filtering with CLIP: joint text/visual similarity, near-duplicate
//! suppression and a cap on how many candidates reach geometric ranking.

use std::sync::Arc;
use tracing::{debug, info};

use super::take_in_order;
use crate::config::MAX_IMD_RANKING_NUM;
use crate::error::Result;
use crate::models::Embedder;
use crate::types::RetrievalBundle;

#[derive(Debug, Clone, Copy)]
pub struct VisualFilterParams {
    /// Most candidates kept
    pub max_ranking: usize,
    /// Embedding similarity at or above which a candidate counts as a duplicate
    pub dedup_threshold: f32,
    /// Joint score a non-first candidate must exceed
    pub min_joint: f32,
}

impl Default for VisualFilterParams {
    fn default() -> Self {
        Self {
            max_ranking: MAX_IMD_RANKING_NUM,
            dedup_threshold: 0.8,
            min_joint: 0.1,
        }
    }
}

pub struct VisualReranker {
    embedder: Arc<dyn Embedder>,
    params: VisualFilterParams,
}

impl VisualReranker {
    pub fn new(embedder: Arc<dyn Embedder>, params: VisualFilterParams) -> Self {
        Self { embedder, params }
    }

    /// Candidates sorted best-first by joint similarity, deduplicated and capped
    pub fn rerank_and_filter(
        &self,
        bundle: RetrievalBundle,
        object_prompt: &str,
    ) -> Result<RetrievalBundle> {
        let RetrievalBundle { query, candidates } = bundle;
        if candidates.is_empty() {
            return Ok(RetrievalBundle { query, candidates });
        }

        let text_feature = self.embedder.embed_text(object_prompt)?;
        let query_feature = self.embedder.embed_image(&query.masked_image)?;
        let features = candidates
            .iter()
            .map(|c| self.embedder.embed_image(&c.masked_image))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let joint: Vec<f32> = features
            .iter()
            .map(|f| {
                let visual = self.embedder.similarity(&query_feature, f);
                let text = self.embedder.similarity(&text_feature, f);
                visual * text
            })
            .collect();

        let order = sort_by_joint(&joint);
        let no_object: Vec<bool> = candidates.iter().map(|c| c.mask.is_full()).collect();
        let kept = select_candidates(&order, &joint, &no_object, self.params, |a, b| {
            self.embedder.similarity(&features[a], &features[b])
        });

        info!(
            "Visual filtering kept {} of {} candidate(s)",
            kept.len(),
            candidates.len()
        );
        if let Some(&top) = kept.first() {
            debug!("Top joint similarity {:.4}", joint[top]);
        }

        Ok(RetrievalBundle {
            query,
            candidates: take_in_order(candidates, &kept),
        })
    }
}

/// Indices ordered by descending joint score; ties keep input order
pub fn sort_by_joint(joint: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..joint.len()).collect();
    order.sort_by(|&a, &b| joint[b].total_cmp(&joint[a]));
    order
}

/// Walk `order`, skipping "no object" candidates. The first survivor is
/// always kept; later ones must be distinct from the candidate just before
/// them in `order` and clear the joint floor. `pair_similarity(a, b)` compares
/// candidates `a` and `b` by embedding.
pub fn select_candidates(
    order: &[usize],
    joint: &[f32],
    no_object: &[bool],
    params: VisualFilterParams,
    pair_similarity: impl Fn(usize, usize) -> f32,
) -> Vec<usize> {
    let mut kept = Vec::new();
    for (pos, &curr) in order.iter().enumerate() {
        if no_object[curr] {
            continue;
        }
        // At position 0 the partner is candidate 0 rather than a predecessor,
        // so the leading candidate may be compared with itself. Possibly
        // unintended; the first survivor is kept regardless.
        let prev = if pos > 0 { order[pos - 1] } else { 0 };
        let distinct = pair_similarity(curr, prev) < params.dedup_threshold;

        if kept.is_empty() || (distinct && joint[curr] > params.min_joint) {
            kept.push(curr);
            if kept.len() >= params.max_ranking {
                break;
            }
        }
    }
    kept
}

//! Geometric re-ranking by dense feature correspondence.

use std::sync::Arc;
use tracing::{debug, info};

use super::take_in_order;
use crate::error::Result;
use crate::models::FeatureExtractor;
use crate::types::RetrievalBundle;

pub struct GeometricRanker {
    featurizer: Arc<dyn FeatureExtractor>,
}

impl GeometricRanker {
    pub fn new(featurizer: Arc<dyn FeatureExtractor>) -> Self {
        Self { featurizer }
    }

    /// Correspondence distance from the query to every candidate
    pub fn distances(&self, bundle: &RetrievalBundle, object_prompt: &str) -> Result<Vec<f32>> {
        if bundle.is_empty() {
            return Ok(Vec::new());
        }

        let src_ft = self
            .featurizer
            .extract(&bundle.query.masked_image, object_prompt)?;
        let src_mask = &bundle.query.mask;

        let mut distances = Vec::with_capacity(bundle.len());
        for (idx, candidate) in bundle.candidates.iter().enumerate() {
            let tgt_ft = self.featurizer.extract(&candidate.masked_image, object_prompt)?;
            let d = self
                .featurizer
                .distance(&src_ft, &tgt_ft, src_mask, &candidate.mask);
            debug!("Candidate {} geometric distance {:.4}", idx, d);
            distances.push(d);
        }
        Ok(distances)
    }

    /// The `k` candidates with the smallest distance, closest first
    pub fn geometric_topk(
        &self,
        bundle: RetrievalBundle,
        object_prompt: &str,
        k: usize,
    ) -> Result<RetrievalBundle> {
        let distances = self.distances(&bundle, object_prompt)?;
        let order = rank_by_distance(&distances, k);
        info!(
            "Geometric ranking kept {} of {} candidate(s)",
            order.len(),
            distances.len()
        );

        let RetrievalBundle { query, candidates } = bundle;
        Ok(RetrievalBundle {
            query,
            candidates: take_in_order(candidates, &order),
        })
    }
}

/// First `min(k, n)` indices by ascending distance; ties keep input order
pub fn rank_by_distance(distances: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..distances.len()).collect();
    order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));
    order.truncate(k);
    order
}

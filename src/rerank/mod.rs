//! Candidate re-ranking: CLIP joint similarity filtering, then dense
//! geometric top-k.

pub mod geometric;
pub mod visual;

pub use geometric::GeometricRanker;
pub use visual::{VisualFilterParams, VisualReranker};

use crate::types::Candidate;

/// Move the candidates named by `order` out of `candidates`, in that order.
/// Indices are expected to be unique.
pub(crate) fn take_in_order(candidates: Vec<Candidate>, order: &[usize]) -> Vec<Candidate> {
    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|&idx| slots.get_mut(idx).and_then(Option::take))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mask;
    use image::RgbImage;

    fn tagged(tag: f32) -> Candidate {
        Candidate {
            image: RgbImage::new(1, 1),
            trajectory: vec![[tag, tag]],
            masked_image: RgbImage::new(1, 1),
            mask: Mask::full(1, 1),
        }
    }

    #[test]
    fn test_take_in_order() {
        let picked = take_in_order(vec![tagged(0.0), tagged(1.0), tagged(2.0)], &[2, 0]);
        let tags: Vec<f32> = picked.iter().map(|c| c.trajectory[0][0]).collect();
        assert_eq!(tags, vec![2.0, 0.0]);
    }

    #[test]
    fn test_take_in_order_ignores_bad_and_repeated_indices() {
        let picked = take_in_order(vec![tagged(0.0), tagged(1.0)], &[1, 1, 7]);
        assert_eq!(picked.len(), 1);
    }
}

//! Latent-length sampling.

use burn::prelude::*;
use burn::tensor::Distribution;
use serde::{Deserialize, Serialize};

/// Bounds for latent sequence lengths: a ratio band relative to the
/// source length plus absolute clamps. Training and evaluation carry
/// separate bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthBounds {
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub min_length: i64,
    pub max_length: i64,
}

impl Default for LengthBounds {
    fn default() -> Self {
        LengthBounds {
            min_ratio: 0.3,
            max_ratio: 0.5,
            min_length: 2,
            max_length: 30,
        }
    }
}

/// Per-sample latent lengths: a uniform ratio in the band, applied to the
/// source length, truncated, then clamped to the absolute bounds.
pub fn sample_lengths<B: Backend>(
    src_lengths: &Tensor<B, 1, Int>,
    bounds: &LengthBounds,
) -> Tensor<B, 1, Int> {
    let ratios = Tensor::<B, 1>::random(
        src_lengths.dims(),
        Distribution::Uniform(bounds.min_ratio, bounds.max_ratio),
        &src_lengths.device(),
    );
    (src_lengths.clone().float() * ratios)
        .int()
        .clamp(bounds.min_length, bounds.max_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{int_tensor, to_host_i64};
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn sampled_lengths_respect_all_bounds() {
        let device = Default::default();
        let bounds = LengthBounds {
            min_ratio: 0.4,
            max_ratio: 0.6,
            min_length: 2,
            max_length: 8,
        };
        let src = int_tensor::<B>(&[20, 10, 3, 100], &device);

        for _ in 0..50 {
            let latent = to_host_i64(sample_lengths(&src, &bounds));
            for (&l, &s) in latent.iter().zip(&[20i64, 10, 3, 100]) {
                assert!(l >= bounds.min_length, "{l} below floor");
                assert!(l <= bounds.max_length, "{l} above ceiling");
                let unclamped_max = (s as f64 * bounds.max_ratio) as i64;
                assert!(l <= unclamped_max.clamp(bounds.min_length, bounds.max_length));
            }
        }
    }

    #[test]
    fn longer_sources_never_get_shorter_floors() {
        // with a near-degenerate band the mapping is deterministic and monotone
        let device = Default::default();
        let bounds = LengthBounds {
            min_ratio: 0.5,
            max_ratio: 0.51,
            min_length: 1,
            max_length: 100,
        };
        let src = int_tensor::<B>(&[4, 8, 16], &device);
        let latent = to_host_i64(sample_lengths(&src, &bounds));
        assert!(latent[0] <= latent[1] && latent[1] <= latent[2]);
        assert_eq!(latent, vec![2, 4, 8]);
    }
}

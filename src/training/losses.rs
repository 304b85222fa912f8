//! Loss terms: reconstruction, prior, topic, length.

use burn::prelude::*;
use burn::tensor::activation::{log_softmax, softmax};
use serde::{Deserialize, Serialize};

use crate::ops::{masked_mean, sequence_mask, weighted_mean};

/// Token cross-entropy, summed over valid tokens and divided by the
/// number of valid tokens in the batch (positions equal to `pad` are
/// excluded from both).
pub fn reconstruction_loss<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    pad: i64,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 2);
    let gathered = log_probs.gather(2, targets.clone().unsqueeze_dim::<3>(2));
    let nll = -gathered.squeeze_dim::<2>(2); // [batch, steps]
    let mask = targets.not_equal_elem(pad).float();
    (nll * mask.clone()).sum() / (mask.sum() + 1e-13)
}

/// KL(oracle ‖ model) per latent step, averaged over valid steps. The
/// oracle supplies the target distribution; its logits must already be
/// detached.
pub fn prior_loss<B: Backend>(
    model_logits: Tensor<B, 3>,
    oracle_logits: Tensor<B, 3>,
    mask: Tensor<B, 2, Bool>,
) -> Tensor<B, 1> {
    let log_p = log_softmax(model_logits, 2);
    let q = softmax(oracle_logits.clone(), 2);
    let log_q = log_softmax(oracle_logits, 2);
    let kl = (q * (log_q - log_p)).sum_dim(2).squeeze_dim::<2>(2);
    let m = mask.float();
    (kl * m.clone()).sum() / (m.sum() + 1e-13)
}

/// Cross-entropy forcing `<eos>` from position `length - 1` through the
/// end of the latent buffer; earlier positions are `pad` targets and
/// ignored. Labelling the whole tail pushes probability mass onto the
/// terminator everywhere past the budget, not just at the boundary.
pub fn eos_length_loss<B: Backend>(
    logits: Tensor<B, 3>,
    lengths: Tensor<B, 1, Int>,
    eos: i64,
    pad: i64,
) -> Tensor<B, 1> {
    let [batch, steps, _] = logits.dims();
    let device = logits.device();
    let before_tail = sequence_mask(lengths.sub_scalar(1), steps);
    let targets = Tensor::<B, 2, Int>::full([batch, steps], eos, &device)
        .mask_where(before_tail, Tensor::full([batch, steps], pad, &device));
    reconstruction_loss(logits, targets, pad)
}

/// How pooled topic vectors are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
    Euclidean,
    /// Negative scaled dot product.
    Dot,
}

/// Distance between masked-pooled source and latent topic vectors.
/// Optional source-side weights (IDF) replace the uniform mean; the
/// latent side always pools uniformly.
pub fn topic_loss<B: Backend>(
    src_vectors: Tensor<B, 3>,
    latent_vectors: Tensor<B, 3>,
    src_mask: Tensor<B, 2, Bool>,
    latent_mask: Tensor<B, 2, Bool>,
    src_weights: Option<Tensor<B, 2>>,
    distance: Distance,
) -> Tensor<B, 1> {
    let a = match src_weights {
        Some(w) => weighted_mean(src_vectors, src_mask, w),
        None => masked_mean(src_vectors, src_mask),
    };
    let b = masked_mean(latent_vectors, latent_mask);
    pooled_distance(a, b, distance)
}

fn pooled_distance<B: Backend>(
    a: Tensor<B, 2>,
    b: Tensor<B, 2>,
    distance: Distance,
) -> Tensor<B, 1> {
    match distance {
        Distance::Cosine => {
            let dot = (a.clone() * b.clone()).sum_dim(1);
            let norm_a = (a.clone() * a).sum_dim(1).sqrt();
            let norm_b = (b.clone() * b).sum_dim(1).sqrt();
            let cosine = dot / (norm_a * norm_b + 1e-13);
            (-cosine + 1.0).mean()
        }
        Distance::Euclidean => {
            let diff = a - b;
            (diff.clone() * diff).sum_dim(1).sqrt().mean()
        }
        Distance::Dot => {
            let d = a.dims()[1] as f64;
            (-((a * b).sum_dim(1)) / d).mean()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::vocab::{EOS, PAD};
    use crate::ops::{int_tensor, scalar_f32};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn logits(data: Vec<f32>, shape: [usize; 3]) -> Tensor<B, 3> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    fn ids(data: Vec<i64>, shape: [usize; 2]) -> Tensor<B, 2, Int> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn reconstruction_ignores_pad_positions() {
        // vocab 3, two steps; second step is padding
        let l = logits(vec![5.0, 0.0, 0.0, 0.0, 0.0, 5.0], [1, 2, 3]);
        let with_pad = scalar_f32(reconstruction_loss(
            l.clone(),
            ids(vec![0, 0], [1, 2]),
            PAD,
        ));
        assert_eq!(with_pad, 0.0);

        let real = scalar_f32(reconstruction_loss(l, ids(vec![1, 2], [1, 2]), PAD));
        assert!(real > 0.0);
    }

    #[test]
    fn reconstruction_is_batch_permutation_invariant() {
        let device = Default::default();
        let a = Tensor::<B, 3>::random([3, 4, 6], Distribution::Default, &device);
        let t = ids(vec![1, 2, 3, 0, 2, 2, 1, 0, 3, 3, 3, 3], [3, 4]);

        let forward = scalar_f32(reconstruction_loss(a.clone(), t.clone(), PAD));

        let perm = int_tensor::<B>(&[2, 0, 1], &device);
        let shuffled = scalar_f32(reconstruction_loss(
            a.select(0, perm.clone()),
            t.select(0, perm),
            PAD,
        ));
        assert!((forward - shuffled).abs() < 1e-5);
    }

    #[test]
    fn prior_loss_is_zero_for_identical_distributions() {
        let device = Default::default();
        let l = Tensor::<B, 3>::random([2, 3, 5], Distribution::Default, &device);
        let mask = sequence_mask(int_tensor::<B>(&[3, 2], &device), 3);
        let kl = scalar_f32(prior_loss(l.clone(), l, mask));
        assert!(kl.abs() < 1e-6);
    }

    #[test]
    fn prior_loss_targets_the_oracle_distribution() {
        // model uniform over 2 tokens, oracle at [3/4, 1/4]
        let model = logits(vec![0.0, 0.0], [1, 1, 2]);
        let oracle = logits(vec![(3.0f32).ln(), 0.0], [1, 1, 2]);
        let mask = sequence_mask(int_tensor::<B>(&[1], &Default::default()), 1);

        let kl = scalar_f32(prior_loss(model, oracle, mask));
        // KL(q ‖ p) = 0.75 ln(0.75/0.5) + 0.25 ln(0.25/0.5)
        let expected = 0.75 * (0.75f32 / 0.5).ln() + 0.25 * (0.25f32 / 0.5).ln();
        let reversed = 0.5 * (0.5f32 / 0.75).ln() + 0.5 * (0.5f32 / 0.25).ln();
        assert!((kl - expected).abs() < 1e-5, "{kl} vs {expected}");
        assert!((kl - reversed).abs() > 1e-3);
    }

    #[test]
    fn eos_loss_prefers_eos_at_the_boundary() {
        // vocab 4, 3 steps, length 2 → eos wanted at step 1
        let good = logits(
            vec![0.0; 4]
                .into_iter()
                .chain(vec![0.0, 0.0, 8.0, 0.0])
                .chain(vec![0.0; 4])
                .collect(),
            [1, 3, 4],
        );
        let bad = logits(
            vec![0.0, 0.0, 8.0, 0.0]
                .into_iter()
                .chain(vec![0.0; 4])
                .chain(vec![0.0; 4])
                .collect(),
            [1, 3, 4],
        );
        let lengths = int_tensor::<B>(&[2], &Default::default());
        let good_loss = scalar_f32(eos_length_loss(good, lengths.clone(), EOS, PAD));
        let bad_loss = scalar_f32(eos_length_loss(bad, lengths, EOS, PAD));
        assert!(good_loss < bad_loss);
    }

    #[test]
    fn eos_loss_labels_the_whole_tail() {
        // length 2 over 3 steps: positions 1 and 2 both want eos
        let full_tail = logits(
            vec![0.0; 4]
                .into_iter()
                .chain(vec![0.0, 0.0, 8.0, 0.0])
                .chain(vec![0.0, 0.0, 8.0, 0.0])
                .collect(),
            [1, 3, 4],
        );
        let boundary_only = logits(
            vec![0.0; 4]
                .into_iter()
                .chain(vec![0.0, 0.0, 8.0, 0.0])
                .chain(vec![8.0, 0.0, 0.0, 0.0])
                .collect(),
            [1, 3, 4],
        );
        let lengths = int_tensor::<B>(&[2], &Default::default());
        let tail = scalar_f32(eos_length_loss(full_tail, lengths.clone(), EOS, PAD));
        let boundary = scalar_f32(eos_length_loss(boundary_only, lengths, EOS, PAD));
        assert!(tail < boundary);
    }

    #[test]
    fn cosine_distance_vanishes_for_identical_vectors() {
        let device = Default::default();
        let v = Tensor::<B, 3>::random([2, 3, 4], Distribution::Default, &device);
        let mask = sequence_mask(int_tensor::<B>(&[3, 3], &device), 3);
        let loss = scalar_f32(topic_loss(
            v.clone(),
            v,
            mask.clone(),
            mask,
            None,
            Distance::Cosine,
        ));
        assert!(loss.abs() < 1e-5);
    }
}

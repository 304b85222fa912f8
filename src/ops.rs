//! Masking, pooling and discretization primitives shared across the model.
//!
//! Everything here is length-aware: padded positions never contribute to
//! attention weights, pooled vectors or sampled distributions.

use std::cell::Cell;

use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::{Distribution, IndexingUpdateOp};

// ─── Masks ────────────────────────────────────────────────────────

/// Boolean validity mask from per-sample lengths.
///
/// - `lengths`: [batch] — valid token counts
///
/// Returns: [batch, max_len] — `true` at positions `< lengths[i]`
pub fn sequence_mask<B: Backend>(lengths: Tensor<B, 1, Int>, max_len: usize) -> Tensor<B, 2, Bool> {
    let batch = lengths.dims()[0];
    let device = lengths.device();
    let steps = Tensor::<B, 1, Int>::arange(0..max_len as i64, &device)
        .reshape([1, max_len])
        .expand([batch, max_len]);
    let bounds = lengths.reshape([batch, 1]).expand([batch, max_len]);
    steps.lower(bounds)
}

/// Softmax over the last dimension restricted to unmasked positions.
///
/// Computed as ordinary softmax, zeroing of masked entries, then
/// renormalization. For rows with at least one valid position this equals
/// a softmax with `-inf` at masked entries.
///
/// - `scores`: [batch, len], `mask`: [batch, len]
pub fn masked_softmax<B: Backend>(scores: Tensor<B, 2>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
    let probs = softmax(scores, 1) * mask.float();
    let norm = probs.clone().sum_dim(1) + 1e-13;
    probs / norm
}

/// Mean over valid positions: [batch, len, d] + mask [batch, len] → [batch, d].
pub fn masked_mean<B: Backend>(vectors: Tensor<B, 3>, mask: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
    let m = mask.float().unsqueeze_dim::<3>(2); // [batch, len, 1]
    let summed = (vectors * m.clone()).sum_dim(1).squeeze_dim::<2>(1);
    let counts = m.sum_dim(1).squeeze_dim::<2>(1) + 1e-13; // [batch, 1]
    summed / counts
}

/// Weighted mean over valid positions with per-position weights
/// (e.g. IDF scores). Weights at masked positions are discarded and the
/// remainder renormalized per sample.
///
/// - `vectors`: [batch, len, d], `mask`: [batch, len], `weights`: [batch, len]
pub fn weighted_mean<B: Backend>(
    vectors: Tensor<B, 3>,
    mask: Tensor<B, 2, Bool>,
    weights: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let w = weights * mask.float();
    let w = w.clone() / (w.sum_dim(1) + 1e-13); // [batch, len]
    (vectors * w.unsqueeze_dim::<3>(2))
        .sum_dim(1)
        .squeeze_dim::<2>(1)
}

// ─── Discretization ───────────────────────────────────────────────

/// Softmax temperature: one global value, or one value per sample
/// (a learned, differentiable [batch, 1] tensor).
#[derive(Debug, Clone)]
pub enum Temperature<B: Backend> {
    Fixed(f64),
    PerSample(Tensor<B, 2>),
}

impl<B: Backend> Temperature<B> {
    fn scale(&self, logits: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Temperature::Fixed(tau) => logits / *tau,
            Temperature::PerSample(tau) => logits / tau.clone(), // [b, v] / [b, 1]
        }
    }
}

/// Temperature softmax over 2-D logits, optionally discretized with the
/// straight-through estimator.
///
/// With `hard`, the forward value is the one-hot argmax while the gradient
/// is that of the soft distribution (`y_hard - detach(y_soft) + y_soft`).
pub fn straight_softmax<B: Backend>(
    logits: Tensor<B, 2>,
    tau: &Temperature<B>,
    hard: bool,
) -> Tensor<B, 2> {
    let y_soft = softmax(tau.scale(logits), 1);
    if hard {
        harden(y_soft)
    } else {
        y_soft
    }
}

/// Gumbel-softmax: perturbs logits with Gumbel noise before the
/// temperature softmax, so that hard samples follow the categorical
/// distribution instead of always taking the mode.
pub fn gumbel_softmax<B: Backend>(
    logits: Tensor<B, 2>,
    tau: &Temperature<B>,
    hard: bool,
) -> Tensor<B, 2> {
    let eps = 1e-20;
    let uniform = Tensor::<B, 2>::random(
        logits.dims(),
        Distribution::Uniform(0.0, 1.0),
        &logits.device(),
    );
    let gumbel = -(-((uniform + eps).log())).log();
    straight_softmax(logits + gumbel, tau, hard)
}

fn harden<B: Backend>(y_soft: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, _vocab] = y_soft.dims();
    let device = y_soft.device();
    let top = y_soft.clone().argmax(1); // [batch, 1]
    let y_hard = y_soft
        .zeros_like()
        .scatter(1, top, Tensor::ones([batch, 1], &device), IndexingUpdateOp::Add);
    y_hard - y_soft.clone().detach() + y_soft
}

/// Expected embedding under per-step distributions.
///
/// - `dists`: [batch, steps, vocab], `table`: [vocab, d]
///
/// Returns: [batch, steps, d]
pub fn expectation<B: Backend>(dists: Tensor<B, 3>, table: Tensor<B, 2>) -> Tensor<B, 3> {
    let [batch, steps, vocab] = dists.dims();
    let d = table.dims()[1];
    dists
        .reshape([batch * steps, vocab])
        .matmul(table)
        .reshape([batch, steps, d])
}

// ─── Length features ──────────────────────────────────────────────

/// Remaining-token countdown per step.
///
/// Row `i` holds `len_i - 1, len_i - 2, ...` so the tick reaches zero
/// exactly at the position where `<eos>` is wanted.
///
/// Returns: [batch, max_len] float
pub fn length_countdown<B: Backend>(lengths: Tensor<B, 1, Int>, max_len: usize) -> Tensor<B, 2> {
    let batch = lengths.dims()[0];
    let device = lengths.device();
    let steps = Tensor::<B, 1, Int>::arange(0..max_len as i64, &device)
        .reshape([1, max_len])
        .expand([batch, max_len]);
    let start = lengths
        .sub_scalar(1)
        .reshape([batch, 1])
        .expand([batch, max_len]);
    (start - steps).float()
}

/// Word dropout: zeroes whole token embeddings with probability `dropout`.
/// Active only while gradients are being tracked, like `nn::Dropout`.
pub fn drop_tokens<B: Backend>(embeddings: Tensor<B, 3>, dropout: f64) -> Tensor<B, 3> {
    if dropout <= 0.0 || !B::ad_enabled() {
        return embeddings;
    }
    let [batch, len, _] = embeddings.dims();
    let keep = Tensor::<B, 2>::random(
        [batch, len],
        Distribution::Bernoulli(1.0 - dropout),
        &embeddings.device(),
    );
    embeddings * keep.unsqueeze_dim::<3>(2)
}

// ─── Batch reordering ─────────────────────────────────────────────

/// Permutation pair for descending-length processing.
///
/// `perm` reorders a batch dimension to descending length; `inverse`
/// undoes it: `x.select(0, perm).select(0, inverse) == x`.
#[derive(Debug, Clone)]
pub struct LengthSort<B: Backend> {
    pub perm: Tensor<B, 1, Int>,
    pub inverse: Tensor<B, 1, Int>,
    pub sorted_lengths: Vec<i64>,
}

/// Compute the descending-by-length permutation on the host.
///
/// The sort is stable so equal lengths keep their batch order.
pub fn sort_by_length<B: Backend>(lengths: &Tensor<B, 1, Int>) -> LengthSort<B> {
    let device = lengths.device();
    let host = to_host_i64(lengths.clone());
    let mut order: Vec<usize> = (0..host.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(host[i]));

    let mut inverse = vec![0i64; host.len()];
    for (rank, &i) in order.iter().enumerate() {
        inverse[i] = rank as i64;
    }
    let sorted_lengths: Vec<i64> = order.iter().map(|&i| host[i]).collect();
    let perm: Vec<i64> = order.iter().map(|&i| i as i64).collect();

    LengthSort {
        perm: int_tensor(&perm, &device),
        inverse: int_tensor(&inverse, &device),
        sorted_lengths,
    }
}

/// Apply a batch-dimension permutation.
pub fn permute_batch<B: Backend, const D: usize, K>(
    tensor: Tensor<B, D, K>,
    perm: &Tensor<B, 1, Int>,
) -> Tensor<B, D, K>
where
    K: burn::tensor::TensorKind<B> + burn::tensor::BasicOps<B>,
{
    tensor.select(0, perm.clone())
}

// ─── Host helpers ─────────────────────────────────────────────────

/// Build a 1-D int tensor from host values.
pub fn int_tensor<B: Backend>(values: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
}

/// Read an int tensor back to the host as `i64`, whatever the backend's
/// native int element is. The single readback funnel for the crate.
pub fn to_host_i64<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap()
}

/// Read a float tensor back to the host as `f32`.
pub fn to_host_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .unwrap()
}

/// Scalar readback of a 1-element float tensor.
pub fn scalar_f32<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> f32 {
    to_host_f32(tensor)[0]
}

// ─── Host-side randomness ─────────────────────────────────────────

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0xDEAD_BEEF_CAFE_1337) | 1
    );
}

/// Reseed the thread-local PRNG (tests, reproducible runs).
pub fn seed_host_rng(seed: u64) {
    RNG_STATE.with(|s| s.set(seed | 1));
}

/// Uniform draw in [0, 1) from a thread-local xorshift64 PRNG.
pub fn host_uniform() -> f64 {
    RNG_STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        (x >> 11) as f64 / (1u64 << 53) as f64
    })
}

/// Biased coin flip, used for scheduled sampling.
pub fn coin_flip(prob: f64) -> bool {
    if prob <= 0.0 {
        return false;
    }
    if prob >= 1.0 {
        return true;
    }
    host_uniform() < prob
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = NdArray;
    type AB = Autodiff<NdArray>;

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    #[test]
    fn sequence_mask_marks_valid_prefix() {
        let lengths = int_tensor::<B>(&[3, 1], &device());
        let mask = sequence_mask(lengths, 4);
        let host: Vec<bool> = mask.into_data().to_vec::<bool>().unwrap();
        assert_eq!(
            host,
            vec![true, true, true, false, true, false, false, false]
        );
    }

    #[test]
    fn masked_softmax_rows_sum_to_one_over_valid() {
        let scores = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 0.5, 0.5, 0.5], [2, 3]),
            &device(),
        );
        let mask = sequence_mask(int_tensor::<B>(&[2, 3], &device()), 3);
        let probs = masked_softmax(scores, mask);
        let host = to_host_f32(probs);
        // masked position carries no mass
        assert!(host[2].abs() < 1e-6);
        let row0: f32 = host[0] + host[1];
        let row1: f32 = host[3] + host[4] + host[5];
        assert!((row0 - 1.0).abs() < 1e-5);
        assert!((row1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn masked_mean_ignores_padding() {
        let vectors = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 100.0, 100.0], [1, 2, 2]),
            &device(),
        );
        let mask = sequence_mask(int_tensor::<B>(&[1], &device()), 2);
        let pooled = to_host_f32(masked_mean(vectors, mask));
        assert_eq!(pooled, vec![1.0, 2.0]);
    }

    #[test]
    fn weighted_mean_renormalizes_weights() {
        let vectors = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 3.0, 100.0], [1, 3, 1]),
            &device(),
        );
        let mask = sequence_mask(int_tensor::<B>(&[2], &device()), 3);
        let weights = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 3.0, 50.0], [1, 3]),
            &device(),
        );
        let pooled = to_host_f32(weighted_mean(vectors, mask, weights));
        // (1*1 + 3*3) / 4, the padded position discarded entirely
        assert!((pooled[0] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn straight_through_is_one_hot_forward() {
        let logits = Tensor::<B, 2>::from_data(
            TensorData::new(vec![0.1f32, 2.0, -1.0, 3.0, 0.0, 0.0], [2, 3]),
            &device(),
        );
        let y = straight_softmax(logits, &Temperature::Fixed(1.0), true);
        let host = to_host_f32(y);
        assert!((host[1] - 1.0).abs() < 1e-6);
        assert!((host[3] - 1.0).abs() < 1e-6);
        let row0: f32 = host[0..3].iter().sum();
        assert!((row0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn straight_through_gradient_matches_soft() {
        let data = TensorData::new(vec![0.3f32, 1.2, -0.7], [1, 3]);
        let weight = Tensor::<AB, 2>::from_data(
            TensorData::new(vec![0.5f32, -1.0, 2.0], [1, 3]),
            &device(),
        );

        let soft_logits = Tensor::<AB, 2>::from_data(data.clone(), &device()).require_grad();
        let soft = straight_softmax(soft_logits.clone(), &Temperature::Fixed(1.0), false);
        let grads = (soft * weight.clone()).sum().backward();
        let g_soft = to_host_f32(soft_logits.grad(&grads).unwrap());

        let hard_logits = Tensor::<AB, 2>::from_data(data, &device()).require_grad();
        let hard = straight_softmax(hard_logits.clone(), &Temperature::Fixed(1.0), true);
        let grads = (hard * weight).sum().backward();
        let g_hard = to_host_f32(hard_logits.grad(&grads).unwrap());

        for (a, b) in g_soft.iter().zip(&g_hard) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn expectation_of_one_hot_selects_rows() {
        let table = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0], [3, 2]),
            &device(),
        );
        let dists = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.0f32, 0.0, 1.0, 1.0, 0.0, 0.0], [1, 2, 3]),
            &device(),
        );
        let out = to_host_f32(expectation(dists, table));
        assert_eq!(out, vec![3.0, 30.0, 1.0, 10.0]);
    }

    #[test]
    fn expectation_is_linear_in_the_distribution() {
        let table = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0], [3, 2]),
            &device(),
        );
        // 0.25 * row0 + 0.75 * row2
        let dists = Tensor::<B, 3>::from_data(
            TensorData::new(vec![0.25f32, 0.0, 0.75], [1, 1, 3]),
            &device(),
        );
        let out = to_host_f32(expectation(dists, table));
        assert!((out[0] - (0.25 * 1.0 + 0.75 * 3.0)).abs() < 1e-6);
        assert!((out[1] - (0.25 * 10.0 + 0.75 * 30.0)).abs() < 1e-6);
    }

    #[test]
    fn countdown_hits_zero_at_last_valid_step() {
        let ticks = length_countdown(int_tensor::<B>(&[3, 2], &device()), 4);
        let host = to_host_f32(ticks);
        assert_eq!(host, vec![2.0, 1.0, 0.0, -1.0, 1.0, 0.0, -1.0, -2.0]);
    }

    #[test]
    fn sort_then_restore_is_identity() {
        let lengths = int_tensor::<B>(&[2, 5, 3], &device());
        let sort = sort_by_length(&lengths);
        assert_eq!(sort.sorted_lengths, vec![5, 3, 2]);

        let x = Tensor::<B, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 2.0, 2.0, 3.0, 3.0], [3, 2]),
            &device(),
        );
        let roundtrip = permute_batch(permute_batch(x.clone(), &sort.perm), &sort.inverse);
        assert_eq!(to_host_f32(roundtrip), to_host_f32(x));
    }

    #[test]
    fn coin_flip_extremes() {
        seed_host_rng(7);
        assert!(!coin_flip(0.0));
        assert!(coin_flip(1.0));
        let heads = (0..1000).filter(|_| coin_flip(0.5)).count();
        assert!(heads > 300 && heads < 700);
    }

    #[test]
    fn drop_tokens_zero_rate_is_identity() {
        let embs = Tensor::<B, 3>::ones([2, 3, 4], &device());
        let kept = drop_tokens(embs.clone(), 0.0);
        assert_eq!(to_host_f32(kept), to_host_f32(embs));
    }
}

//! Single-query attention over encoder outputs.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::ops::masked_softmax;

/// How attention energies are scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionKind {
    /// `q · k` (requires matching dimensions).
    Dot,
    /// `(W q) · k`.
    General,
    /// `v · tanh(W [q; k])`.
    Concat,
    /// `v · tanh(W_q q + W_k k)`.
    Additive,
}

#[derive(Config, Debug)]
pub struct AttentionConfig {
    /// Query (decoder state) dimension.
    pub d_query: usize,
    /// Key (encoder output) dimension.
    pub d_keys: usize,
    #[config(default = "AttentionKind::General")]
    pub kind: AttentionKind,
}

/// Attention scoring + masked pooling for one decoder step.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    w_general: Option<Linear<B>>,
    w_query: Option<Linear<B>>,
    w_key: Option<Linear<B>>,
    v: Option<Linear<B>>,
    kind: Ignored<AttentionKind>,
}

impl AttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Attention<B> {
        let (w_general, w_query, w_key, v) = match self.kind {
            AttentionKind::Dot => (None, None, None, None),
            AttentionKind::General => (
                Some(LinearConfig::new(self.d_query, self.d_keys).init(device)),
                None,
                None,
                None,
            ),
            AttentionKind::Concat => (
                None,
                Some(LinearConfig::new(self.d_query + self.d_keys, self.d_keys).init(device)),
                None,
                Some(LinearConfig::new(self.d_keys, 1).with_bias(false).init(device)),
            ),
            AttentionKind::Additive => (
                None,
                Some(LinearConfig::new(self.d_query, self.d_keys).init(device)),
                Some(LinearConfig::new(self.d_keys, self.d_keys).init(device)),
                Some(LinearConfig::new(self.d_keys, 1).with_bias(false).init(device)),
            ),
        };
        Attention {
            w_general,
            w_query,
            w_key,
            v,
            kind: Ignored(self.kind),
        }
    }
}

impl<B: Backend> Attention<B> {
    /// One attention read.
    ///
    /// - `query`: [batch, d_query] — current decoder state
    /// - `keys`: [batch, len, d_keys] — encoder outputs
    /// - `mask`: [batch, len] — valid encoder positions
    ///
    /// Returns `(context, weights)`: [batch, d_keys], [batch, len].
    pub fn forward(
        &self,
        query: Tensor<B, 2>,
        keys: Tensor<B, 3>,
        mask: Tensor<B, 2, Bool>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, len, d_keys] = keys.dims();

        let scores: Tensor<B, 2> = match *self.kind {
            AttentionKind::Dot => dot_scores(query, keys.clone()),
            AttentionKind::General => {
                let projected = match &self.w_general {
                    Some(w) => w.forward(query),
                    None => query,
                };
                dot_scores(projected, keys.clone())
            }
            AttentionKind::Concat => {
                let d_query = query.dims()[1];
                let expanded = query.unsqueeze_dim::<3>(1).expand([batch, len, d_query]);
                let joined = Tensor::cat(vec![expanded, keys.clone()], 2);
                let hidden = match &self.w_query {
                    Some(w) => w.forward(joined).tanh(),
                    None => joined,
                };
                score_vector(&self.v, hidden)
            }
            AttentionKind::Additive => {
                let q = match &self.w_query {
                    Some(w) => w.forward(query),
                    None => query,
                };
                let k = match &self.w_key {
                    Some(w) => w.forward(keys.clone()),
                    None => keys.clone(),
                };
                let hidden = (q.unsqueeze_dim::<3>(1).expand([batch, len, d_keys]) + k).tanh();
                score_vector(&self.v, hidden)
            }
        };

        let weights = masked_softmax(scores, mask);
        let context = (keys * weights.clone().unsqueeze_dim::<3>(2))
            .sum_dim(1)
            .squeeze_dim::<2>(1);
        (context, weights)
    }
}

/// `q · k_t` for every position: [batch, d] × [batch, len, d] → [batch, len].
fn dot_scores<B: Backend>(query: Tensor<B, 2>, keys: Tensor<B, 3>) -> Tensor<B, 2> {
    (keys * query.unsqueeze_dim::<3>(1))
        .sum_dim(2)
        .squeeze_dim::<2>(2)
}

fn score_vector<B: Backend>(v: &Option<Linear<B>>, hidden: Tensor<B, 3>) -> Tensor<B, 2> {
    match v {
        Some(v) => v.forward(hidden).squeeze_dim::<2>(2),
        None => hidden.sum_dim(2).squeeze_dim::<2>(2),
    }
}

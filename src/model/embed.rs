//! Embedding layer with training-time regularization and an expectation
//! path for soft (distribution-valued) inputs.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

use crate::ops::expectation;

#[derive(Config, Debug)]
pub struct EmbedConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Embedding dimension.
    pub d_embedding: usize,
    /// Dropout on embedded vectors.
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Stddev of additive gaussian noise (training only).
    #[config(default = 0.0)]
    pub noise: f64,
}

/// Token embedding with dropout and gaussian noise. The raw table is
/// exposed for expectation lookups and weight-tied output projections.
#[derive(Module, Debug)]
pub struct Embed<B: Backend> {
    table: Embedding<B>,
    dropout: Dropout,
    noise: f64,
}

impl EmbedConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Embed<B> {
        Embed {
            table: EmbeddingConfig::new(self.vocab_size, self.d_embedding).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            noise: self.noise,
        }
    }
}

impl<B: Backend> Embed<B> {
    /// Embed token ids with regularization: [batch, len] → [batch, len, d].
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.regularize(self.table.forward(tokens))
    }

    /// Expected embedding of per-step distributions, with the same
    /// regularization: [batch, len, vocab] → [batch, len, d].
    pub fn forward_expectation(&self, dists: Tensor<B, 3>) -> Tensor<B, 3> {
        self.regularize(expectation(dists, self.weight()))
    }

    /// Plain table lookup: no noise, no dropout. Used for pooling-side
    /// readings of the table (e.g. topic vectors).
    pub fn lookup(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.table.forward(tokens)
    }

    /// The embedding matrix: [vocab, d].
    pub fn weight(&self) -> Tensor<B, 2> {
        self.table.weight.val()
    }

    pub fn d_embedding(&self) -> usize {
        self.table.weight.dims()[1]
    }

    pub fn vocab_size(&self) -> usize {
        self.table.weight.dims()[0]
    }

    fn regularize(&self, embedded: Tensor<B, 3>) -> Tensor<B, 3> {
        let embedded = if self.noise > 0.0 && B::ad_enabled() {
            let noise = Tensor::random(
                embedded.dims(),
                Distribution::Normal(0.0, self.noise),
                &embedded.device(),
            );
            embedded + noise
        } else {
            embedded
        };
        self.dropout.forward(embedded)
    }
}

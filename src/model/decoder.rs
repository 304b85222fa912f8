//! Stepwise attentive decoder.
//!
//! Runs one token at a time so each step can choose its own input:
//! the gold token (teacher forcing), the embedded argmax of the previous
//! step, or the expected embedding of a relaxed distribution over the
//! previous step's logits. The latter keeps the whole path differentiable
//! and is what turns this decoder into a compressor.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{
    Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig, Lstm, LstmConfig,
    LstmState,
};
use burn::prelude::*;
use burn::tensor::activation::softplus;

use crate::model::attention::{Attention, AttentionConfig, AttentionKind};
use crate::model::embed::Embed;
use crate::model::encoder::{clone_state, EncoderState};
use crate::ops::{coin_flip, drop_tokens, gumbel_softmax, length_countdown, straight_softmax, Temperature};

// ─── Configuration ────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct AttDecoderConfig {
    /// Embedding dimension of the shared input embedding.
    pub d_embedding: usize,
    /// LSTM hidden size.
    pub d_hidden: usize,
    /// Encoder output dimension (attention keys).
    pub d_keys: usize,
    #[config(default = 1)]
    pub layers: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Word dropout on input embeddings.
    #[config(default = 0.0)]
    pub word_dropout: f64,
    #[config(default = "AttentionKind::General")]
    pub attention: AttentionKind,
    /// Feed the previous attention context back as an input.
    #[config(default = true)]
    pub input_feeding: bool,
    /// tanh on the combined output.
    #[config(default = true)]
    pub out_non_linearity: bool,
    #[config(default = false)]
    pub layer_norm: bool,
    /// Append [scaled countdown tick, target/source ratio] input features.
    #[config(default = false)]
    pub length_control: bool,
    /// Predict a per-step softmax temperature from the decoder output.
    #[config(default = false)]
    pub learn_tau: bool,
    /// Lower bound parameter: tau = 1 / (softplus(w·o) + tau_0).
    #[config(default = 0.5)]
    pub tau_0: f64,
}

/// Where step logits come from: a dedicated linear, or the transpose of
/// an embedding table when outputs are tied to embeddings.
#[derive(Debug)]
pub enum OutputProjection<'a, B: Backend> {
    Linear(&'a Linear<B>),
    TiedEmbedding(&'a Embed<B>),
}

impl<'a, B: Backend> OutputProjection<'a, B> {
    fn apply(&self, hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            OutputProjection::Linear(linear) => linear.forward(hidden),
            OutputProjection::TiedEmbedding(embed) => hidden.matmul(embed.weight().transpose()),
        }
    }

    fn d_vocab(&self) -> usize {
        match self {
            OutputProjection::Linear(linear) => linear.weight.dims()[1],
            OutputProjection::TiedEmbedding(embed) => embed.vocab_size(),
        }
    }
}

/// Per-call sampling behavior.
#[derive(Debug, Clone)]
pub struct SamplingOptions<B: Backend> {
    /// Probability of feeding the model its own previous output instead
    /// of the gold token (a per-step coin flip).
    pub sampling_prob: f64,
    /// Discretize relaxed distributions with the straight-through trick.
    pub hard: bool,
    /// Perturb logits with Gumbel noise before relaxation.
    pub gumbel: bool,
    /// Base softmax temperature (overridden per step when learned).
    pub tau: Temperature<B>,
    /// Feed the embedded argmax token instead of an expectation
    /// (generation mode).
    pub argmax_inputs: bool,
}

impl<B: Backend> SamplingOptions<B> {
    /// Full teacher forcing.
    pub fn teacher_forced() -> Self {
        SamplingOptions {
            sampling_prob: 0.0,
            hard: false,
            gumbel: false,
            tau: Temperature::Fixed(1.0),
            argmax_inputs: false,
        }
    }

    /// Greedy free-running generation.
    pub fn greedy() -> Self {
        SamplingOptions {
            sampling_prob: 1.0,
            hard: false,
            gumbel: false,
            tau: Temperature::Fixed(1.0),
            argmax_inputs: true,
        }
    }
}

/// Everything one decoding pass needs.
pub struct DecoderInput<'a, B: Backend> {
    /// [batch, steps] — teacher-forcing tokens; column 0 seeds the pass.
    pub gold_tokens: Tensor<B, 2, Int>,
    /// [batch, src_len, d_keys]
    pub enc_outputs: Tensor<B, 3>,
    /// [batch, src_len]
    pub enc_mask: Tensor<B, 2, Bool>,
    pub init_state: EncoderState<B>,
    pub embed: &'a Embed<B>,
    pub projection: OutputProjection<'a, B>,
    pub sampling: SamplingOptions<B>,
    /// Desired output lengths, for the countdown tick.
    pub desired_lengths: Option<Tensor<B, 1, Int>>,
    /// Source lengths, for the length-ratio feature.
    pub source_lengths: Option<Tensor<B, 1, Int>>,
    /// Keep the relaxed step distributions (compression mode).
    pub collect_dists: bool,
}

/// Step-indexed result buffers, sized up front.
pub struct DecoderOutput<B: Backend> {
    /// [batch, steps, vocab]
    pub logits: Tensor<B, 3>,
    /// [batch, steps, d_hidden] — pre-projection outputs
    pub outputs: Tensor<B, 3>,
    /// [batch, steps - 1, vocab] — relaxed distributions; the final step
    /// contributes logits only (its distribution never feeds an input).
    pub dists: Option<Tensor<B, 3>>,
    /// [batch, steps, src_len]
    pub attentions: Tensor<B, 3>,
    /// [batch, steps] — per-step temperatures, when learned
    pub taus: Option<Tensor<B, 2>>,
    pub state: EncoderState<B>,
}

// ─── Module ───────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct AttDecoder<B: Backend> {
    cells: Vec<Lstm<B>>,
    attention: Attention<B>,
    w_context: Linear<B>,
    norm: Option<LayerNorm<B>>,
    tick_scale: Option<Linear<B>>,
    tau_head: Option<Linear<B>>,
    dropout: Dropout,
    word_dropout: f64,
    input_feeding: bool,
    out_non_linearity: bool,
    tau_0: f64,
    d_hidden: usize,
    d_keys: usize,
}

impl AttDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> AttDecoder<B> {
        let extra = if self.input_feeding { self.d_keys } else { 0 }
            + if self.length_control { 2 } else { 0 };
        let layer_input = |i: usize| {
            if i == 0 {
                self.d_embedding + extra
            } else {
                self.d_hidden
            }
        };

        AttDecoder {
            cells: (0..self.layers)
                .map(|i| LstmConfig::new(layer_input(i), self.d_hidden, true).init(device))
                .collect(),
            attention: AttentionConfig::new(self.d_hidden, self.d_keys)
                .with_kind(self.attention)
                .init(device),
            w_context: LinearConfig::new(self.d_hidden + self.d_keys, self.d_hidden).init(device),
            norm: self
                .layer_norm
                .then(|| LayerNormConfig::new(self.d_hidden).init(device)),
            tick_scale: self
                .length_control
                .then(|| LinearConfig::new(1, 1).with_bias(false).init(device)),
            tau_head: self
                .learn_tau
                .then(|| LinearConfig::new(self.d_hidden, 1).with_bias(false).init(device)),
            dropout: DropoutConfig::new(self.dropout).init(),
            word_dropout: self.word_dropout,
            input_feeding: self.input_feeding,
            out_non_linearity: self.out_non_linearity,
            tau_0: self.tau_0,
            d_hidden: self.d_hidden,
            d_keys: self.d_keys,
        }
    }
}

impl<B: Backend> AttDecoder<B> {
    /// Decode `gold_tokens.dims()[1]` steps.
    pub fn forward(&self, input: DecoderInput<'_, B>) -> DecoderOutput<B> {
        let [batch, steps] = input.gold_tokens.dims();
        let src_len = input.enc_outputs.dims()[1];
        let vocab = input.projection.d_vocab();
        let device = input.enc_outputs.device();

        let mut logits_buf = Tensor::zeros([batch, steps, vocab], &device);
        let mut outputs_buf = Tensor::zeros([batch, steps, self.d_hidden], &device);
        let mut attn_buf = Tensor::zeros([batch, steps, src_len], &device);
        let mut dists_buf = input
            .collect_dists
            .then(|| Tensor::zeros([batch, steps.saturating_sub(1), vocab], &device));
        let mut taus_buf = self
            .tau_head
            .as_ref()
            .map(|_| Tensor::zeros([batch, steps], &device));

        // [batch, steps, 2] length-control features, or None
        let step_features = self.length_features(&input, steps);

        let mut states: Vec<LstmState<B, 2>> = (0..self.cells.len())
            .map(|i| {
                input.init_state.get(i).map(clone_state).unwrap_or_else(|| {
                    LstmState::new(
                        Tensor::zeros([batch, self.d_hidden], &device),
                        Tensor::zeros([batch, self.d_hidden], &device),
                    )
                })
            })
            .collect();

        let mut context = Tensor::<B, 2>::zeros([batch, self.d_keys], &device);
        let mut step_tau = input.sampling.tau.clone();
        let mut prev_logits: Option<Tensor<B, 2>> = None;

        for t in 0..steps {
            // ── input selection ──
            let embedded = match (&prev_logits, t) {
                (_, 0) => input
                    .embed
                    .forward(input.gold_tokens.clone().slice([0..batch, 0..1])),
                (Some(prev), _) if input.collect_dists => {
                    let dist = self.relax(prev.clone(), &step_tau, &input.sampling);
                    if let Some(buf) = dists_buf.take() {
                        dists_buf = Some(buf.slice_assign(
                            [0..batch, t - 1..t, 0..vocab],
                            dist.clone().unsqueeze_dim::<3>(1),
                        ));
                    }
                    input.embed.forward_expectation(dist.unsqueeze_dim::<3>(1))
                }
                (Some(prev), _) if coin_flip(input.sampling.sampling_prob) => {
                    if input.sampling.argmax_inputs {
                        input.embed.forward(prev.clone().argmax(1))
                    } else {
                        let dist = straight_softmax(prev.clone(), &step_tau, false);
                        input.embed.forward_expectation(dist.unsqueeze_dim::<3>(1))
                    }
                }
                _ => input
                    .embed
                    .forward(input.gold_tokens.clone().slice([0..batch, t..t + 1])),
            };
            // never drop the step-0 seed token
            let embedded = if t > 0 {
                drop_tokens(embedded, self.word_dropout)
            } else {
                embedded
            };

            // ── assemble the step input ──
            let mut x = embedded;
            if self.input_feeding {
                x = Tensor::cat(vec![x, context.clone().unsqueeze_dim::<3>(1)], 2);
            }
            if let Some(features) = &step_features {
                let f_t = features.clone().slice([0..batch, t..t + 1, 0..2]);
                x = Tensor::cat(vec![x, f_t], 2);
            }

            // ── recurrent advance ──
            let mut h = x;
            for (i, cell) in self.cells.iter().enumerate() {
                let (out, next) = cell.forward(h, Some(clone_state(&states[i])));
                states[i] = next;
                h = out;
            }
            let h = self.dropout.forward(h);
            let query = h.squeeze_dim::<2>(1); // [batch, d_hidden]

            // ── attention + combination ──
            let (ctx, weights) = self.attention.forward(
                query.clone(),
                input.enc_outputs.clone(),
                input.enc_mask.clone(),
            );
            context = ctx;

            let combined = self
                .w_context
                .forward(Tensor::cat(vec![query, context.clone()], 1));
            let combined = if self.out_non_linearity {
                combined.tanh()
            } else {
                combined
            };
            let combined = match &self.norm {
                Some(norm) => norm.forward(combined),
                None => combined,
            };

            let logits_t = input.projection.apply(combined.clone());

            logits_buf = logits_buf.slice_assign(
                [0..batch, t..t + 1, 0..vocab],
                logits_t.clone().unsqueeze_dim::<3>(1),
            );
            outputs_buf = outputs_buf.slice_assign(
                [0..batch, t..t + 1, 0..self.d_hidden],
                combined.clone().unsqueeze_dim::<3>(1),
            );
            attn_buf = attn_buf.slice_assign(
                [0..batch, t..t + 1, 0..src_len],
                weights.unsqueeze_dim::<3>(1),
            );

            // ── temperature for the next step ──
            if let Some(head) = &self.tau_head {
                let tau_t = (softplus(head.forward(combined), 1.0) + self.tau_0).recip();
                if let Some(buf) = taus_buf.take() {
                    taus_buf = Some(buf.slice_assign([0..batch, t..t + 1], tau_t.clone()));
                }
                step_tau = Temperature::PerSample(tau_t);
            }

            prev_logits = Some(logits_t);
        }

        DecoderOutput {
            logits: logits_buf,
            outputs: outputs_buf,
            dists: dists_buf,
            attentions: attn_buf,
            taus: taus_buf,
            state: states,
        }
    }

    fn relax(
        &self,
        logits: Tensor<B, 2>,
        tau: &Temperature<B>,
        sampling: &SamplingOptions<B>,
    ) -> Tensor<B, 2> {
        if sampling.gumbel {
            gumbel_softmax(logits, tau, sampling.hard)
        } else {
            straight_softmax(logits, tau, sampling.hard)
        }
    }

    fn length_features(
        &self,
        input: &DecoderInput<'_, B>,
        steps: usize,
    ) -> Option<Tensor<B, 3>> {
        let scale = self.tick_scale.as_ref()?;
        let desired = input.desired_lengths.as_ref()?;
        let source = input.source_lengths.as_ref()?;
        let batch = desired.dims()[0];

        let ticks = length_countdown(desired.clone(), steps).unsqueeze_dim::<3>(2);
        let scaled = scale.forward(ticks); // [batch, steps, 1]
        let ratio = (desired.clone().float() / source.clone().float())
            .reshape([batch, 1, 1])
            .expand([batch, steps, 1]);
        Some(Tensor::cat(vec![scaled, ratio], 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::embed::EmbedConfig;
    use crate::ops::{int_tensor, sequence_mask, to_host_f32};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn run(
        config: AttDecoderConfig,
        sampling: SamplingOptions<B>,
        collect_dists: bool,
    ) -> DecoderOutput<B> {
        let device = Default::default();
        let decoder: AttDecoder<B> = config.init(&device);
        let embed = EmbedConfig::new(10, 4).init(&device);
        let out_proj = LinearConfig::new(6, 10).init(&device);

        let out = decoder.forward(DecoderInput {
            gold_tokens: Tensor::zeros([2, 4], &device),
            enc_outputs: Tensor::random([2, 5, 8], Distribution::Default, &device),
            enc_mask: sequence_mask(int_tensor::<B>(&[5, 3], &device), 5),
            init_state: Vec::new(),
            embed: &embed,
            projection: OutputProjection::Linear(&out_proj),
            sampling,
            desired_lengths: Some(int_tensor::<B>(&[4, 2], &device)),
            source_lengths: Some(int_tensor::<B>(&[5, 3], &device)),
            collect_dists,
        });
        out
    }

    fn base_config() -> AttDecoderConfig {
        AttDecoderConfig::new(4, 6, 8)
    }

    #[test]
    fn buffers_have_contract_shapes() {
        let out = run(base_config(), SamplingOptions::teacher_forced(), false);
        assert_eq!(out.logits.dims(), [2, 4, 10]);
        assert_eq!(out.outputs.dims(), [2, 4, 6]);
        assert_eq!(out.attentions.dims(), [2, 4, 5]);
        assert!(out.dists.is_none());
        assert!(out.taus.is_none());
    }

    #[test]
    fn collected_dists_exclude_final_step_and_normalize() {
        let mut sampling = SamplingOptions::teacher_forced();
        sampling.sampling_prob = 1.0;
        let out = run(base_config(), sampling, true);
        let dists = out.dists.unwrap();
        assert_eq!(dists.dims(), [2, 3, 10]);
        let host = to_host_f32(dists);
        for row in host.chunks(10) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "row sums to {sum}");
        }
    }

    #[test]
    fn hard_dists_are_one_hot() {
        let sampling = SamplingOptions {
            sampling_prob: 1.0,
            hard: true,
            gumbel: true,
            tau: Temperature::Fixed(1.0),
            argmax_inputs: false,
        };
        let out = run(base_config(), sampling, true);
        let host = to_host_f32(out.dists.unwrap());
        for row in host.chunks(10) {
            let ones = row.iter().filter(|v| (**v - 1.0).abs() < 1e-5).count();
            assert_eq!(ones, 1);
        }
    }

    #[test]
    fn learned_tau_stays_in_range() {
        let config = base_config().with_learn_tau(true).with_tau_0(0.5);
        let out = run(config, SamplingOptions::teacher_forced(), false);
        let taus = to_host_f32(out.taus.unwrap());
        for tau in taus {
            assert!(tau > 0.0 && tau < 2.0 + 1e-5, "tau {tau} out of range");
        }
    }

    #[test]
    fn word_dropout_never_zeroes_the_seed_token() {
        type Ad = burn::backend::Autodiff<NdArray>;
        let device = Default::default();
        let decoder: AttDecoder<Ad> = base_config().with_word_dropout(1.0).init(&device);
        let mut intact = decoder.clone();
        intact.word_dropout = 0.0;

        let embed = EmbedConfig::new(10, 4).init(&device);
        let out_proj = LinearConfig::new(6, 10).init(&device);
        let enc_outputs = Tensor::<Ad, 3>::random([2, 5, 8], Distribution::Default, &device);

        let forward = |d: &AttDecoder<Ad>| {
            d.forward(DecoderInput {
                gold_tokens: Tensor::zeros([2, 4], &device),
                enc_outputs: enc_outputs.clone(),
                enc_mask: sequence_mask(int_tensor::<Ad>(&[5, 3], &device), 5),
                init_state: Vec::new(),
                embed: &embed,
                projection: OutputProjection::Linear(&out_proj),
                sampling: SamplingOptions::teacher_forced(),
                desired_lengths: None,
                source_lengths: None,
                collect_dists: false,
            })
        };

        // the first step reads the seed token untouched, so its logits must
        // match a decoder with word dropout off
        let dropped = to_host_f32(forward(&decoder).logits.slice([0..2, 0..1, 0..10]));
        let kept = to_host_f32(forward(&intact).logits.slice([0..2, 0..1, 0..10]));
        for (a, b) in dropped.iter().zip(&kept) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn length_control_changes_input_width_but_not_output() {
        let config = base_config().with_length_control(true);
        let out = run(config, SamplingOptions::teacher_forced(), false);
        assert_eq!(out.logits.dims(), [2, 4, 10]);
    }
}

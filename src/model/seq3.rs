//! The compression autoencoder: encode → compress → re-encode → reconstruct.
//!
//! The middle of the pipeline is a sequence of relaxed distributions over
//! the vocabulary. Re-encoding starts from a zero state, so everything the
//! reconstruction sees must flow through those distributions.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use tracing::warn;

use crate::data::batch::Seq3Batch;
use crate::data::vocab::SOS;
use crate::error::ModelError;
use crate::model::attention::AttentionKind;
use crate::model::bridge::{Bridge, BridgeConfig};
use crate::model::decoder::{
    AttDecoder, AttDecoderConfig, DecoderInput, DecoderOutput, OutputProjection, SamplingOptions,
};
use crate::model::embed::{Embed, EmbedConfig};
use crate::model::encoder::{RecurrentEncoder, RecurrentEncoderConfig};
use crate::ops::{drop_tokens, sequence_mask, to_host_i64, Temperature};

// ─── Configuration ────────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct Seq3Config {
    pub vocab_size: usize,
    #[config(default = 256)]
    pub d_embedding: usize,
    #[config(default = 512)]
    pub d_hidden: usize,
    #[config(default = 1)]
    pub layers: usize,
    /// Bidirectional encoders (decoders are always left-to-right).
    #[config(default = true)]
    pub bidirectional: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub embedding_dropout: f64,
    #[config(default = 0.0)]
    pub embedding_noise: f64,
    /// Word dropout on encoder inputs.
    #[config(default = 0.0)]
    pub enc_token_dropout: f64,
    /// Word dropout on decoder inputs.
    #[config(default = 0.0)]
    pub dec_token_dropout: f64,
    #[config(default = "AttentionKind::General")]
    pub attention: AttentionKind,
    #[config(default = true)]
    pub input_feeding: bool,
    #[config(default = true)]
    pub out_non_linearity: bool,
    #[config(default = false)]
    pub layer_norm: bool,
    /// Countdown/ratio features on decoders and bridges.
    #[config(default = true)]
    pub length_control: bool,
    /// Learned per-step temperature in the compressor.
    #[config(default = false)]
    pub learn_tau: bool,
    #[config(default = 0.5)]
    pub tau_0: f64,
    #[config(default = false)]
    pub bridge_non_linearity: bool,
    /// One embedding table for all four components.
    #[config(default = true)]
    pub tie_embeddings: bool,
    /// Reconstruction decoder reuses the compressor's output layer.
    #[config(default = false)]
    pub tie_decoder_outputs: bool,
    /// Output layers read the embedding table (needs d_hidden == d_embedding;
    /// downgraded with a warning otherwise).
    #[config(default = false)]
    pub tie_embedding_outputs: bool,
    /// One encoder for source and latent sequences.
    #[config(default = false)]
    pub tie_encoders: bool,
    /// One decoder for compression and reconstruction.
    #[config(default = false)]
    pub tie_decoders: bool,
}

/// Per-forward sampling knobs (annealed by the trainer).
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Relaxation temperature for the latent distributions.
    pub tau: f64,
    /// Straight-through discretization of the latent.
    pub hard: bool,
    /// Gumbel noise on the latent logits.
    pub gumbel: bool,
    /// Scheduled-sampling probability on the reconstruction side.
    pub sampling_prob: f64,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        ForwardOptions {
            tau: 1.0,
            hard: true,
            gumbel: true,
            sampling_prob: 0.0,
        }
    }
}

/// Everything one autoencoding pass produces.
pub struct Seq3Output<B: Backend> {
    /// Compression pass: logits [batch, latent_max, vocab],
    /// dists [batch, latent_max - 1, vocab].
    pub cmp: DecoderOutput<B>,
    /// Reconstruction pass: logits [batch, src_max + 1, vocab].
    pub rec: DecoderOutput<B>,
    /// Expectation embeddings fed to the second encoder.
    pub latent_embeddings: Tensor<B, 3>,
    /// Valid latent steps: `latent_lengths - 1`.
    pub cmp_lengths: Tensor<B, 1, Int>,
    pub latent_lengths: Tensor<B, 1, Int>,
}

/// Greedy compression output.
#[derive(Debug, Clone)]
pub struct Generated<B: Backend> {
    pub logits: Tensor<B, 3>,
    /// Argmax token ids, trimmed to each sample's latent length.
    pub tokens: Vec<Vec<i64>>,
}

// ─── Module ───────────────────────────────────────────────────────

/// A `None` in any of the `Option` slots means "share the primary
/// instance" — tying is fixed at construction and visible in the
/// structure itself.
#[derive(Module, Debug)]
pub struct Seq3<B: Backend> {
    embed: Embed<B>,
    embed_cmp_enc: Option<Embed<B>>,
    embed_rec_dec: Option<Embed<B>>,
    inp_encoder: RecurrentEncoder<B>,
    cmp_encoder: Option<RecurrentEncoder<B>>,
    compressor: AttDecoder<B>,
    decompressor: Option<AttDecoder<B>>,
    src_bridge: Bridge<B>,
    trg_bridge: Option<Bridge<B>>,
    w_cmp: Option<Linear<B>>,
    w_rec: Option<Linear<B>>,
    /// Frozen per-id weights for topic pooling.
    idf: Option<Tensor<B, 1>>,
    enc_token_dropout: f64,
    length_control: bool,
}

impl Seq3Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Seq3<B>, ModelError> {
        if self.vocab_size == 0 {
            return Err(ModelError::ZeroDimension("vocab_size"));
        }
        if self.d_embedding == 0 || self.d_hidden == 0 {
            return Err(ModelError::ZeroDimension("d_embedding/d_hidden"));
        }
        if self.layers == 0 {
            return Err(ModelError::ZeroDimension("layers"));
        }

        let embed_config = EmbedConfig::new(self.vocab_size, self.d_embedding)
            .with_dropout(self.embedding_dropout)
            .with_noise(self.embedding_noise);
        let encoder_config = RecurrentEncoderConfig::new(self.d_embedding, self.d_hidden)
            .with_layers(self.layers)
            .with_bidirectional(self.bidirectional)
            .with_dropout(self.dropout);
        let d_keys = encoder_config.d_output();
        let decoder_config = AttDecoderConfig::new(self.d_embedding, self.d_hidden, d_keys)
            .with_layers(self.layers)
            .with_dropout(self.dropout)
            .with_word_dropout(self.dec_token_dropout)
            .with_attention(self.attention)
            .with_input_feeding(self.input_feeding)
            .with_out_non_linearity(self.out_non_linearity)
            .with_layer_norm(self.layer_norm)
            .with_length_control(self.length_control)
            .with_tau_0(self.tau_0);
        let bridge_config = BridgeConfig::new(d_keys, self.d_hidden)
            .with_non_linearity(self.bridge_non_linearity)
            .with_length_features(self.length_control);

        let mut tie_embedding_outputs = self.tie_embedding_outputs;
        if tie_embedding_outputs && self.d_hidden != self.d_embedding {
            warn!(
                d_hidden = self.d_hidden,
                d_embedding = self.d_embedding,
                "cannot tie output layers to the embedding table; keeping separate output layers"
            );
            tie_embedding_outputs = false;
        }

        let (w_cmp, w_rec) = if tie_embedding_outputs {
            (None, None)
        } else {
            let w_cmp = LinearConfig::new(self.d_hidden, self.vocab_size).init(device);
            let w_rec = (!self.tie_decoder_outputs)
                .then(|| LinearConfig::new(self.d_hidden, self.vocab_size).init(device));
            (Some(w_cmp), w_rec)
        };

        Ok(Seq3 {
            embed: embed_config.init(device),
            embed_cmp_enc: (!self.tie_embeddings).then(|| embed_config.init(device)),
            embed_rec_dec: (!self.tie_embeddings).then(|| embed_config.init(device)),
            inp_encoder: encoder_config.init(device),
            cmp_encoder: (!self.tie_encoders).then(|| encoder_config.init(device)),
            compressor: decoder_config
                .clone()
                .with_learn_tau(self.learn_tau)
                .init(device),
            decompressor: (!self.tie_decoders).then(|| decoder_config.init(device)),
            src_bridge: bridge_config.init(device),
            trg_bridge: (!(self.tie_encoders && self.tie_decoders))
                .then(|| bridge_config.init(device)),
            w_cmp,
            w_rec,
            idf: None,
            enc_token_dropout: self.enc_token_dropout,
            length_control: self.length_control,
        })
    }
}

impl<B: Backend> Seq3<B> {
    /// Attach frozen IDF weights (one per vocabulary id).
    pub fn with_idf(mut self, idf: Tensor<B, 1>) -> Self {
        self.idf = Some(idf.detach());
        self
    }

    pub fn embedding(&self) -> &Embed<B> {
        &self.embed
    }

    pub fn idf(&self) -> Option<&Tensor<B, 1>> {
        self.idf.as_ref()
    }

    fn cmp_enc_embed(&self) -> &Embed<B> {
        self.embed_cmp_enc.as_ref().unwrap_or(&self.embed)
    }

    fn rec_dec_embed(&self) -> &Embed<B> {
        self.embed_rec_dec.as_ref().unwrap_or(&self.embed)
    }

    fn cmp_encoder(&self) -> &RecurrentEncoder<B> {
        self.cmp_encoder.as_ref().unwrap_or(&self.inp_encoder)
    }

    fn decompressor(&self) -> &AttDecoder<B> {
        self.decompressor.as_ref().unwrap_or(&self.compressor)
    }

    fn trg_bridge(&self) -> &Bridge<B> {
        self.trg_bridge.as_ref().unwrap_or(&self.src_bridge)
    }

    fn cmp_projection(&self) -> OutputProjection<'_, B> {
        match &self.w_cmp {
            Some(w) => OutputProjection::Linear(w),
            None => OutputProjection::TiedEmbedding(&self.embed),
        }
    }

    fn rec_projection(&self) -> OutputProjection<'_, B> {
        match (&self.w_rec, &self.w_cmp) {
            (Some(w), _) => OutputProjection::Linear(w),
            (None, Some(w)) => OutputProjection::Linear(w),
            (None, None) => OutputProjection::TiedEmbedding(self.rec_dec_embed()),
        }
    }

    /// `<sos>` followed by zeros: the compressor gets no gold inputs.
    fn fake_inputs(&self, batch: usize, steps: usize, device: &B::Device) -> Tensor<B, 2, Int> {
        Tensor::zeros([batch, steps], device)
            .slice_assign([0..batch, 0..1], Tensor::full([batch, 1], SOS, device))
    }

    fn bridge_lengths<'a>(
        &self,
        source: &'a Tensor<B, 1, Int>,
        target: &'a Tensor<B, 1, Int>,
    ) -> Option<(&'a Tensor<B, 1, Int>, &'a Tensor<B, 1, Int>)> {
        self.length_control.then_some((source, target))
    }

    /// Full autoencoding pass.
    ///
    /// `latent_lengths` must be at least 2 per sample (one content step
    /// plus the eos step the distributions exclude).
    pub fn forward(
        &self,
        batch: &Seq3Batch<B>,
        latent_lengths: Tensor<B, 1, Int>,
        options: &ForwardOptions,
    ) -> Seq3Output<B> {
        let device = batch.inp_src.device();
        let batch_size = batch.batch_size();
        let src_max = batch.max_src_len();
        let latent_max = max_length(&latent_lengths);

        // encode the source
        let src_embedded = drop_tokens(self.embed.forward(batch.inp_src.clone()), self.enc_token_dropout);
        let enc1 = self
            .inp_encoder
            .forward(src_embedded, None, Some(&batch.src_lengths));
        let init1 = self.src_bridge.forward(
            &enc1.state,
            self.bridge_lengths(&batch.src_lengths, &latent_lengths),
        );

        // compress: free-running, relaxed latent
        let cmp = self.compressor.forward(DecoderInput {
            gold_tokens: self.fake_inputs(batch_size, latent_max, &device),
            enc_outputs: enc1.outputs,
            enc_mask: sequence_mask(batch.src_lengths.clone(), src_max),
            init_state: init1,
            embed: &self.embed,
            projection: self.cmp_projection(),
            sampling: SamplingOptions {
                sampling_prob: 1.0,
                hard: options.hard,
                gumbel: options.gumbel,
                tau: Temperature::Fixed(options.tau),
                argmax_inputs: false,
            },
            desired_lengths: Some(latent_lengths.clone()),
            source_lengths: Some(batch.src_lengths.clone()),
            collect_dists: true,
        });

        let cmp_lengths = latent_lengths.clone().sub_scalar(1);
        let dists = cmp.dists.clone().unwrap_or_else(|| {
            Tensor::zeros(
                [batch_size, latent_max.saturating_sub(1), self.embed.vocab_size()],
                &device,
            )
        });

        // re-encode the latent from scratch: the information bottleneck
        let latent_embeddings = self.cmp_enc_embed().forward_expectation(dists);
        let enc2 = self
            .cmp_encoder()
            .forward(latent_embeddings.clone(), None, Some(&cmp_lengths));
        let init2 = self.trg_bridge().forward(
            &enc2.state,
            self.bridge_lengths(&cmp_lengths, &batch.trg_lengths),
        );

        // reconstruct with teacher forcing + scheduled sampling
        let rec = self.decompressor().forward(DecoderInput {
            gold_tokens: batch.inp_trg.clone(),
            enc_outputs: enc2.outputs,
            enc_mask: sequence_mask(cmp_lengths.clone(), latent_max.saturating_sub(1)),
            init_state: init2,
            embed: self.rec_dec_embed(),
            projection: self.rec_projection(),
            sampling: SamplingOptions {
                sampling_prob: options.sampling_prob,
                hard: false,
                gumbel: false,
                tau: Temperature::Fixed(options.tau),
                argmax_inputs: false,
            },
            desired_lengths: Some(batch.trg_lengths.clone()),
            source_lengths: Some(cmp_lengths.clone()),
            collect_dists: false,
        });

        Seq3Output {
            cmp,
            rec,
            latent_embeddings,
            cmp_lengths,
            latent_lengths,
        }
    }

    /// Greedy compression: encode, bridge, then argmax decoding.
    pub fn generate(&self, batch: &Seq3Batch<B>, latent_lengths: Tensor<B, 1, Int>) -> Generated<B> {
        let device = batch.inp_src.device();
        let batch_size = batch.batch_size();
        let src_max = batch.max_src_len();
        let latent_max = max_length(&latent_lengths);

        let src_embedded = self.embed.forward(batch.inp_src.clone());
        let enc1 = self
            .inp_encoder
            .forward(src_embedded, None, Some(&batch.src_lengths));
        let init1 = self.src_bridge.forward(
            &enc1.state,
            self.bridge_lengths(&batch.src_lengths, &latent_lengths),
        );

        let cmp = self.compressor.forward(DecoderInput {
            gold_tokens: self.fake_inputs(batch_size, latent_max, &device),
            enc_outputs: enc1.outputs,
            enc_mask: sequence_mask(batch.src_lengths.clone(), src_max),
            init_state: init1,
            embed: &self.embed,
            projection: self.cmp_projection(),
            sampling: SamplingOptions::greedy(),
            desired_lengths: Some(latent_lengths.clone()),
            source_lengths: Some(batch.src_lengths.clone()),
            collect_dists: false,
        });

        let ids = to_host_i64(cmp.logits.clone().argmax(2).squeeze_dim::<2>(2));
        let lengths = to_host_i64(latent_lengths);
        let tokens = ids
            .chunks(latent_max.max(1))
            .zip(&lengths)
            .map(|(row, &len)| row[..(len as usize).min(row.len())].to_vec())
            .collect();

        Generated {
            logits: cmp.logits,
            tokens,
        }
    }
}

fn max_length<B: Backend>(lengths: &Tensor<B, 1, Int>) -> usize {
    to_host_i64(lengths.clone())
        .into_iter()
        .max()
        .unwrap_or(0) as usize
}

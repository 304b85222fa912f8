//! Training loop for the compression autoencoder.
//!
//! The loss computation is split out behind the [`Objective`] trait so the
//! loop itself only deals with stepping the optimizer and bookkeeping. The
//! standard objective combines reconstruction, oracle-prior, topic, and
//! length terms, each with its own annealing [`Schedule`].

use std::collections::HashMap;

use burn::grad_clipping::GradientClippingConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use tracing::{debug, info};

use crate::data::vocab::{EOS, PAD, SOS};
use crate::data::{devectorize, Seq3Batch, Vocab};
use crate::error::TrainError;
use crate::model::{ForwardOptions, LanguageModel, Seq3};
use crate::ops::{scalar_f32, sequence_mask, to_host_i64};
use crate::training::eval::{RougeScores, Scorer};
use crate::training::lengths::{sample_lengths, LengthBounds};
use crate::training::losses::{
    eos_length_loss, prior_loss, reconstruction_loss, topic_loss, Distance,
};
use crate::training::schedule::Schedule;

// ─── Step context ────────────────────────────────────────────────────────────

/// Everything an objective needs to know about the current step besides the
/// batch itself: annealed forward options and the latent length bounds.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub step: usize,
    pub options: ForwardOptions,
    pub bounds: LengthBounds,
}

/// The combined loss plus per-term scalar values for logging.
pub struct StepOutput<B: Backend> {
    /// Weighted sum of all active terms. Keeps the autodiff graph alive.
    pub total: Tensor<B, 1>,
    /// `(term name, unweighted value)` pairs in computation order.
    pub parts: Vec<(&'static str, f64)>,
}

/// A loss function over one batch. Implementations must not mutate the model.
pub trait Objective<B: Backend> {
    fn process_batch(
        &self,
        model: &Seq3<B>,
        batch: &Seq3Batch<B>,
        ctx: &StepContext,
    ) -> Result<StepOutput<B>, TrainError>;
}

// ─── Standard objective ──────────────────────────────────────────────────────

/// The full multi-term compression objective.
///
/// Terms are computed in a fixed order (reconstruction, prior, topic, length)
/// and each normalizes by its own valid-token count before weighting. Terms
/// whose schedule evaluates to zero are skipped entirely, except for
/// reconstruction which always anchors the total.
pub struct Seq3Objective<B: Backend> {
    /// Frozen language model scoring the latent sequence. Its logits are
    /// detached so no gradient ever reaches its parameters.
    pub oracle: Option<LanguageModel<B>>,
    pub reconstruction_weight: Schedule,
    pub prior_weight: Schedule,
    pub topic_weight: Schedule,
    pub length_weight: Schedule,
    pub distance: Distance,
}

impl<B: Backend> Seq3Objective<B> {
    /// Reconstruction-only objective; enable other terms via the pub fields.
    pub fn new() -> Self {
        Self {
            oracle: None,
            reconstruction_weight: Schedule::Constant(1.0),
            prior_weight: Schedule::Constant(0.0),
            topic_weight: Schedule::Constant(0.0),
            length_weight: Schedule::Constant(0.0),
            distance: Distance::Cosine,
        }
    }

    pub fn with_oracle(mut self, oracle: LanguageModel<B>, weight: Schedule) -> Self {
        self.oracle = Some(oracle);
        self.prior_weight = weight;
        self
    }
}

impl<B: Backend> Default for Seq3Objective<B> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_finite(
    term: &'static str,
    step: usize,
    loss: &Tensor<impl Backend, 1>,
) -> Result<f64, TrainError> {
    let value = scalar_f32(loss.clone()) as f64;
    if !value.is_finite() {
        return Err(TrainError::NonFiniteLoss { term, step });
    }
    Ok(value)
}

impl<B: Backend> Objective<B> for Seq3Objective<B> {
    fn process_batch(
        &self,
        model: &Seq3<B>,
        batch: &Seq3Batch<B>,
        ctx: &StepContext,
    ) -> Result<StepOutput<B>, TrainError> {
        let latent_lengths = sample_lengths(&batch.src_lengths, &ctx.bounds);
        let output = model.forward(batch, latent_lengths, &ctx.options);

        let [b, latent_max, _] = output.cmp.logits.dims();
        let cmp_steps = latent_max.saturating_sub(1);
        let latent_mask = sequence_mask(output.cmp_lengths.clone(), cmp_steps);

        let mut parts: Vec<(&'static str, f64)> = Vec::with_capacity(4);

        // Reconstruction anchors the total even at weight zero so the graph
        // is never empty.
        let w_rec = self.reconstruction_weight.value_at(ctx.step);
        let rec = reconstruction_loss(output.rec.logits.clone(), batch.out_trg.clone(), PAD);
        parts.push(("reconstruction", check_finite("reconstruction", ctx.step, &rec)?));
        let mut total = rec * w_rec;

        // Prior: KL from the frozen oracle's next-token predictions to the
        // compressor's logits over every budgeted latent position. The oracle
        // reads `<sos>` followed by the hardened latent tokens, so its logits
        // line up with the compressor's step by step.
        let w_prior = self.prior_weight.value_at(ctx.step);
        if w_prior > 0.0 && cmp_steps > 0 {
            if let (Some(oracle), Some(dists)) = (&self.oracle, &output.cmp.dists) {
                let latent_tokens: Tensor<B, 2, Int> = dists.clone().argmax(2).squeeze_dim(2);
                let sos = Tensor::<B, 2, Int>::full([b, 1], SOS, &latent_tokens.device());
                let oracle_inputs = Tensor::cat(vec![sos, latent_tokens], 1);
                let (oracle_logits, _) =
                    oracle.forward(oracle_inputs, None, Some(&output.latent_lengths));
                let full_mask = sequence_mask(output.latent_lengths.clone(), latent_max);
                let prior = prior_loss(
                    output.cmp.logits.clone(),
                    oracle_logits.detach(),
                    full_mask,
                );
                parts.push(("prior", check_finite("prior", ctx.step, &prior)?));
                total = total + prior * w_prior;
            }
        }

        // Topic: distance between pooled source embeddings and pooled latent
        // expectation embeddings. IDF weights apply to the source side only;
        // the latent side pools uniformly.
        let w_topic = self.topic_weight.value_at(ctx.step);
        if w_topic > 0.0 && cmp_steps > 0 {
            let src_max = batch.max_src_len();
            let src_mask = sequence_mask(batch.src_lengths.clone(), src_max);
            let src_vectors = model.embedding().lookup(batch.inp_src.clone());
            let latent_vectors = output.latent_embeddings.clone();
            let src_weights = model.idf().map(|idf| {
                let flat: Tensor<B, 1, Int> = batch.inp_src.clone().reshape([b * src_max]);
                idf.clone().select(0, flat).reshape([b, src_max])
            });
            let topic = topic_loss(
                src_vectors,
                latent_vectors,
                src_mask,
                latent_mask,
                src_weights,
                self.distance,
            );
            parts.push(("topic", check_finite("topic", ctx.step, &topic)?));
            total = total + topic * w_topic;
        }

        // Length: push the compressor to emit its terminator at the sampled
        // budget.
        let w_len = self.length_weight.value_at(ctx.step);
        if w_len > 0.0 {
            let len = eos_length_loss(
                output.cmp.logits.clone(),
                output.latent_lengths.clone(),
                EOS,
                PAD,
            );
            parts.push(("length", check_finite("length", ctx.step, &len)?));
            total = total + len * w_len;
        }

        Ok(StepOutput { total, parts })
    }
}

// ─── Trainer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub learning_rate: f64,
    pub grad_clip: f64,
    pub weight_decay: f64,
    /// Gumbel-softmax temperature over training steps.
    pub tau: Schedule,
    /// Scheduled-sampling probability for the reconstruction decoder.
    pub sampling_prob: Schedule,
    pub hard: bool,
    pub gumbel: bool,
    pub train_bounds: LengthBounds,
    pub eval_bounds: LengthBounds,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            grad_clip: 5.0,
            weight_decay: 0.0,
            tau: Schedule::Geometric {
                start: 1.0,
                end: 0.5,
                steps: 10_000,
            },
            sampling_prob: Schedule::Constant(0.0),
            hard: true,
            gumbel: true,
            train_bounds: LengthBounds::default(),
            eval_bounds: LengthBounds::default(),
        }
    }
}

/// Create an AdamW optimizer with gradient clipping.
pub fn create_optimizer<B: AutodiffBackend>(
    config: &TrainerConfig,
) -> impl Optimizer<Seq3<B>, B> {
    AdamWConfig::new()
        .with_weight_decay(config.weight_decay as f32)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(config.grad_clip as f32)))
        .init()
}

/// Per-epoch running means of each loss term.
#[derive(Debug, Default, Clone)]
pub struct EpochStats {
    sums: HashMap<&'static str, f64>,
    batches: usize,
}

impl EpochStats {
    fn accumulate(&mut self, parts: &[(&'static str, f64)]) {
        for (name, value) in parts {
            *self.sums.entry(name).or_insert(0.0) += value;
        }
        self.batches += 1;
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        if self.batches == 0 {
            return None;
        }
        self.sums.get(name).map(|sum| sum / self.batches as f64)
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn summary(&self) -> String {
        let mut names: Vec<_> = self.sums.keys().collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.mean(name).map(|m| format!("{name}={m:.4}")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Evaluation output: corpus-level scores plus the decoded text pairs.
pub struct EvalReport {
    pub rouge: RougeScores,
    pub references: Vec<Vec<String>>,
    pub hypotheses: Vec<Vec<String>>,
}

pub struct Trainer<B, O, J>
where
    B: AutodiffBackend,
    O: Optimizer<Seq3<B>, B>,
    J: Objective<B>,
{
    model: Seq3<B>,
    optimizer: O,
    objective: J,
    config: TrainerConfig,
    step: usize,
    epoch: usize,
}

impl<B, O, J> Trainer<B, O, J>
where
    B: AutodiffBackend,
    O: Optimizer<Seq3<B>, B>,
    J: Objective<B>,
{
    pub fn new(model: Seq3<B>, optimizer: O, objective: J, config: TrainerConfig) -> Self {
        Self {
            model,
            optimizer,
            objective,
            config,
            step: 0,
            epoch: 0,
        }
    }

    pub fn model(&self) -> &Seq3<B> {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn epoch_count(&self) -> usize {
        self.epoch
    }

    /// Restore the step/epoch counters when resuming from a checkpoint.
    pub fn restore_progress(&mut self, epoch: usize, step: usize) {
        self.epoch = epoch;
        self.step = step;
    }

    pub fn into_model(self) -> Seq3<B> {
        self.model
    }

    fn context(&self) -> StepContext {
        StepContext {
            step: self.step,
            options: ForwardOptions {
                tau: self.config.tau.value_at(self.step),
                hard: self.config.hard,
                gumbel: self.config.gumbel,
                sampling_prob: self.config.sampling_prob.value_at(self.step),
            },
            bounds: self.config.train_bounds,
        }
    }

    /// One optimizer step over one batch. Returns the per-term loss values.
    pub fn train_step(
        &mut self,
        batch: &Seq3Batch<B>,
    ) -> Result<Vec<(&'static str, f64)>, TrainError> {
        let ctx = self.context();
        let output = self.objective.process_batch(&self.model, batch, &ctx)?;
        let grads = output.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);
        self.step += 1;
        Ok(output.parts)
    }

    pub fn train_epoch(
        &mut self,
        batches: impl IntoIterator<Item = Seq3Batch<B>>,
    ) -> Result<EpochStats, TrainError> {
        let mut stats = EpochStats::default();
        for batch in batches {
            let parts = self.train_step(&batch)?;
            stats.accumulate(&parts);
            if self.step % 100 == 0 {
                debug!(step = self.step, "{}", stats.summary());
            }
        }
        self.epoch += 1;
        info!(
            epoch = self.epoch,
            step = self.step,
            batches = stats.batches(),
            "{}",
            stats.summary()
        );
        Ok(stats)
    }

    /// Generate compressions for every batch and score them against the
    /// sources. All batches contribute to a single corpus-level score.
    pub fn eval_epoch(
        &self,
        batches: impl IntoIterator<Item = Seq3Batch<B>>,
        vocab: &Vocab,
        scorer: &dyn Scorer,
    ) -> EvalReport {
        let mut references = Vec::new();
        let mut hypotheses = Vec::new();
        for batch in batches {
            let latent_lengths = sample_lengths(&batch.src_lengths, &self.config.eval_bounds);
            let generated = self.model.generate(&batch, latent_lengths);
            let src_max = batch.max_src_len();
            let src_ids = to_host_i64(batch.inp_src.clone());
            let src_lengths = to_host_i64(batch.src_lengths.clone());
            for (i, row) in src_ids.chunks(src_max).enumerate() {
                let n = src_lengths[i] as usize;
                references.push(devectorize(vocab, &row[..n], &batch.oov_maps[i]));
                hypotheses.push(devectorize(vocab, &generated.tokens[i], &batch.oov_maps[i]));
            }
        }
        let rouge = scorer.score(&references, &hypotheses);
        EvalReport {
            rouge,
            references,
            hypotheses,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::collate;
    use crate::model::{LanguageModelConfig, Seq3Config};
    use crate::ops::seed_host_rng;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    fn tiny_setup() -> (Seq3<B>, Vocab, Vec<Seq3Batch<B>>) {
        seed_host_rng(7);
        let words = ["bank", "river", "stone", "bridge", "water", "tree"];
        let sentences: Vec<Vec<String>> = (0..8)
            .map(|i| {
                (0..5)
                    .map(|j| words[(i * 3 + j * 5) % words.len()].to_string())
                    .collect()
            })
            .collect();
        let flat: Vec<&str> = sentences.iter().flatten().map(String::as_str).collect();
        let vocab = Vocab::build(flat, Some(50), 2);
        let device = Default::default();
        let batches: Vec<Seq3Batch<B>> = sentences
            .chunks(4)
            .map(|chunk| collate(&vocab, chunk, &device).unwrap())
            .collect();
        let model = Seq3Config::new(vocab.size())
            .with_d_embedding(16)
            .with_d_hidden(24)
            .with_bidirectional(true)
            .with_length_control(false)
            .init(&device)
            .unwrap();
        (model, vocab, batches)
    }

    #[test]
    fn objective_reports_all_active_terms() {
        let (model, _vocab, batches) = tiny_setup();
        let mut objective = Seq3Objective::<B>::new();
        objective.topic_weight = Schedule::Constant(1.0);
        objective.length_weight = Schedule::Constant(1.0);
        let ctx = StepContext {
            step: 0,
            options: ForwardOptions::default(),
            bounds: LengthBounds {
                min_ratio: 0.4,
                max_ratio: 0.6,
                min_length: 2,
                max_length: 4,
            },
        };
        let output = objective
            .process_batch(&model, &batches[0], &ctx)
            .unwrap();
        let names: Vec<_> = output.parts.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["reconstruction", "topic", "length"]);
        assert!(output.parts.iter().all(|(_, v)| v.is_finite()));
        assert!(output.parts[0].1 > 0.0, "reconstruction CE must be positive");
    }

    #[test]
    fn oracle_enables_the_prior_term() {
        let (model, vocab, batches) = tiny_setup();
        let device = Default::default();
        let oracle = LanguageModelConfig::new(vocab.size())
            .with_d_embedding(16)
            .with_d_hidden(24)
            .init::<B>(&device)
            .unwrap();
        let objective = Seq3Objective::new().with_oracle(oracle, Schedule::Constant(1.0));
        let ctx = StepContext {
            step: 0,
            options: ForwardOptions::default(),
            bounds: LengthBounds {
                min_ratio: 0.4,
                max_ratio: 0.6,
                min_length: 2,
                max_length: 4,
            },
        };
        let output = objective
            .process_batch(&model, &batches[0], &ctx)
            .unwrap();
        let prior = output
            .parts
            .iter()
            .find(|(n, _)| *n == "prior")
            .expect("prior term missing");
        assert!(prior.1.is_finite() && prior.1 >= 0.0);
    }

    #[test]
    fn copy_task_loss_decreases() {
        let (model, _vocab, batches) = tiny_setup();
        let config = TrainerConfig {
            learning_rate: 2e-3,
            tau: Schedule::Constant(1.0),
            sampling_prob: Schedule::Constant(0.0),
            hard: false,
            gumbel: false,
            train_bounds: LengthBounds {
                min_ratio: 0.5,
                max_ratio: 0.9,
                min_length: 2,
                max_length: 4,
            },
            ..Default::default()
        };
        let optimizer = create_optimizer::<B>(&config);
        let mut trainer = Trainer::new(model, optimizer, Seq3Objective::new(), config);

        let mut losses = Vec::new();
        for _ in 0..50 {
            for batch in &batches {
                let parts = trainer.train_step(batch).unwrap();
                losses.push(parts[0].1);
            }
        }
        let head: f64 = losses[..10].iter().sum::<f64>() / 10.0;
        let tail: f64 = losses[losses.len() - 10..].iter().sum::<f64>() / 10.0;
        assert!(
            tail < head,
            "reconstruction loss did not decrease: {head} -> {tail}"
        );
    }

    #[test]
    fn eval_scores_every_batch() {
        let (model, vocab, batches) = tiny_setup();
        let config = TrainerConfig::default();
        let optimizer = create_optimizer::<B>(&config);
        let trainer = Trainer::new(model, optimizer, Seq3Objective::new(), config);
        let report = trainer.eval_epoch(
            batches.clone(),
            &vocab,
            &crate::training::eval::NgramF1Scorer,
        );
        assert_eq!(report.references.len(), 8);
        assert_eq!(report.hypotheses.len(), 8);
        assert!(report.rouge.rouge_1 >= 0.0 && report.rouge.rouge_1 <= 1.0);
    }
}

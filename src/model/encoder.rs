//! Variable-length recurrent encoding.
//!
//! Burn's `Lstm` runs whole sequences, so padded samples would smear
//! padding into the final state. The stack here drives the cells one
//! step at a time and freezes each sample's state once its length is
//! exhausted, for both directions.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig, Lstm, LstmConfig, LstmState};
use burn::prelude::*;

use crate::error::ModelError;
use crate::model::embed::{Embed, EmbedConfig};
use crate::ops::{drop_tokens, length_countdown, permute_batch, sequence_mask, sort_by_length};

// ─── Recurrent encoder ────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct RecurrentEncoderConfig {
    /// Input feature dimension.
    pub d_input: usize,
    /// Hidden size per direction.
    pub d_hidden: usize,
    #[config(default = 1)]
    pub layers: usize,
    #[config(default = false)]
    pub bidirectional: bool,
    /// Dropout between stacked layers.
    #[config(default = 0.0)]
    pub dropout: f64,
    /// Append a learned-scale remaining-length tick to the inputs.
    #[config(default = false)]
    pub countdown: bool,
}

/// Final encoder state, one entry per stacked layer.
///
/// Hidden and cell are [batch, d_hidden × dirs] (forward ‖ reverse).
pub type EncoderState<B> = Vec<LstmState<B, 2>>;

/// `LstmState` carries no `Clone`; copies go through the tensors.
pub fn clone_state<B: Backend>(state: &LstmState<B, 2>) -> LstmState<B, 2> {
    LstmState::new(state.cell.clone(), state.hidden.clone())
}

pub struct EncoderOutput<B: Backend> {
    /// [batch, len, d_hidden × dirs]; zero at padded positions.
    pub outputs: Tensor<B, 3>,
    pub state: EncoderState<B>,
}

/// Multi-layer, optionally bidirectional LSTM over padded batches.
#[derive(Module, Debug)]
pub struct RecurrentEncoder<B: Backend> {
    forward_cells: Vec<Lstm<B>>,
    backward_cells: Vec<Lstm<B>>,
    dropout: Dropout,
    tick_scale: Option<Linear<B>>,
    d_hidden: usize,
}

impl RecurrentEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RecurrentEncoder<B> {
        let dirs = if self.bidirectional { 2 } else { 1 };
        let extra = if self.countdown { 1 } else { 0 };
        let layer_input = |i: usize| {
            if i == 0 {
                self.d_input + extra
            } else {
                self.d_hidden * dirs
            }
        };

        let forward_cells = (0..self.layers)
            .map(|i| LstmConfig::new(layer_input(i), self.d_hidden, true).init(device))
            .collect();
        let backward_cells = if self.bidirectional {
            (0..self.layers)
                .map(|i| LstmConfig::new(layer_input(i), self.d_hidden, true).init(device))
                .collect()
        } else {
            Vec::new()
        };

        RecurrentEncoder {
            forward_cells,
            backward_cells,
            dropout: DropoutConfig::new(self.dropout).init(),
            tick_scale: self
                .countdown
                .then(|| LinearConfig::new(1, 1).with_bias(false).init(device)),
            d_hidden: self.d_hidden,
        }
    }

    /// Dimension of `outputs` and of each final-state entry.
    pub fn d_output(&self) -> usize {
        self.d_hidden * if self.bidirectional { 2 } else { 1 }
    }
}

impl<B: Backend> RecurrentEncoder<B> {
    /// Encode already-embedded inputs.
    ///
    /// - `input`: [batch, len, d_input]
    /// - `init_state`: per-layer initial state, or zeros
    /// - `lengths`: valid token counts; `None` treats every position as valid
    ///
    /// When lengths are given the batch is run in descending-length order
    /// and restored before returning, so callers never see the permutation.
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        init_state: Option<EncoderState<B>>,
        lengths: Option<&Tensor<B, 1, Int>>,
    ) -> EncoderOutput<B> {
        match lengths {
            None => self.run_stack(input, init_state, None),
            Some(lengths) => {
                let sort = sort_by_length(lengths);
                let input = permute_batch(input, &sort.perm);
                let init_state = init_state.map(|state| permute_state(state, &sort.perm));
                let sorted_lengths = permute_batch(lengths.clone(), &sort.perm);

                let out = self.run_stack(input, init_state, Some(&sorted_lengths));

                EncoderOutput {
                    outputs: permute_batch(out.outputs, &sort.inverse),
                    state: permute_state(out.state, &sort.inverse),
                }
            }
        }
    }

    fn run_stack(
        &self,
        input: Tensor<B, 3>,
        init_state: Option<EncoderState<B>>,
        lengths: Option<&Tensor<B, 1, Int>>,
    ) -> EncoderOutput<B> {
        let [batch, steps, _] = input.dims();
        let mask = lengths.map(|l| sequence_mask(l.clone(), steps));
        let bidirectional = !self.backward_cells.is_empty();

        let mut layer_input = match (&self.tick_scale, lengths) {
            (Some(scale), Some(lengths)) => {
                let ticks = length_countdown(lengths.clone(), steps).unsqueeze_dim::<3>(2);
                Tensor::cat(vec![input, scale.forward(ticks)], 2)
            }
            (Some(_), None) => {
                let zeros = Tensor::zeros([batch, steps, 1], &input.device());
                Tensor::cat(vec![input, zeros], 2)
            }
            (None, _) => input,
        };

        let mut state = Vec::with_capacity(self.forward_cells.len());
        let init_state = init_state.unwrap_or_default();

        for (layer, cell) in self.forward_cells.iter().enumerate() {
            let init = init_state.get(layer);
            let (fwd_init, bwd_init) = split_init(init, self.d_hidden, bidirectional, batch);

            let (fwd_out, fwd_state) =
                run_direction(cell, &layer_input, fwd_init, mask.as_ref(), false, self.d_hidden);

            let (outputs, layer_state) = if bidirectional {
                let (bwd_out, bwd_state) = run_direction(
                    &self.backward_cells[layer],
                    &layer_input,
                    bwd_init,
                    mask.as_ref(),
                    true,
                    self.d_hidden,
                );
                (
                    Tensor::cat(vec![fwd_out, bwd_out], 2),
                    LstmState::new(
                        Tensor::cat(vec![fwd_state.cell, bwd_state.cell], 1),
                        Tensor::cat(vec![fwd_state.hidden, bwd_state.hidden], 1),
                    ),
                )
            } else {
                (fwd_out, fwd_state)
            };

            state.push(layer_state);
            layer_input = if layer + 1 < self.forward_cells.len() {
                self.dropout.forward(outputs)
            } else {
                outputs
            };
        }

        EncoderOutput {
            outputs: layer_input,
            state,
        }
    }
}

/// Drive one LSTM cell over the time axis, freezing each sample's state
/// at its last valid step. Reverse direction walks the padded sequence
/// from the end; frozen updates skip the padding tail.
fn run_direction<B: Backend>(
    cell: &Lstm<B>,
    input: &Tensor<B, 3>,
    init: Option<LstmState<B, 2>>,
    mask: Option<&Tensor<B, 2, Bool>>,
    reverse: bool,
    d_hidden: usize,
) -> (Tensor<B, 3>, LstmState<B, 2>) {
    let [batch, steps, d_input] = input.dims();
    let device = input.device();

    let mut state = init.unwrap_or_else(|| {
        LstmState::new(
            Tensor::zeros([batch, d_hidden], &device),
            Tensor::zeros([batch, d_hidden], &device),
        )
    });
    let mut outputs = Tensor::zeros([batch, steps, d_hidden], &device);

    let order: Vec<usize> = if reverse {
        (0..steps).rev().collect()
    } else {
        (0..steps).collect()
    };

    for t in order {
        let x_t = input.clone().slice([0..batch, t..t + 1, 0..d_input]);
        let (out_t, next) = cell.forward(x_t, Some(clone_state(&state)));

        match mask {
            Some(mask) => {
                let valid = mask.clone().slice([0..batch, t..t + 1]); // [batch, 1]
                let valid_state = valid.clone().expand([batch, d_hidden]);
                state = LstmState::new(
                    state.cell.mask_where(valid_state.clone(), next.cell),
                    state.hidden.mask_where(valid_state, next.hidden),
                );
                let out_t = out_t * valid.float().unsqueeze_dim::<3>(2);
                outputs = outputs.slice_assign([0..batch, t..t + 1, 0..d_hidden], out_t);
            }
            None => {
                state = next;
                outputs = outputs.slice_assign([0..batch, t..t + 1, 0..d_hidden], out_t);
            }
        }
    }

    (outputs, state)
}

/// Split a per-layer init state into forward/backward halves.
fn split_init<B: Backend>(
    init: Option<&LstmState<B, 2>>,
    d_hidden: usize,
    bidirectional: bool,
    batch: usize,
) -> (Option<LstmState<B, 2>>, Option<LstmState<B, 2>>) {
    match init {
        None => (None, None),
        Some(state) if !bidirectional => (Some(clone_state(state)), None),
        Some(state) => {
            let half = |t: &Tensor<B, 2>, i: usize| {
                t.clone().slice([0..batch, i * d_hidden..(i + 1) * d_hidden])
            };
            (
                Some(LstmState::new(
                    half(&state.cell, 0),
                    half(&state.hidden, 0),
                )),
                Some(LstmState::new(
                    half(&state.cell, 1),
                    half(&state.hidden, 1),
                )),
            )
        }
    }
}

fn permute_state<B: Backend>(state: EncoderState<B>, perm: &Tensor<B, 1, Int>) -> EncoderState<B> {
    state
        .into_iter()
        .map(|s| {
            LstmState::new(
                permute_batch(s.cell, perm),
                permute_batch(s.hidden, perm),
            )
        })
        .collect()
}

// ─── Language model ───────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct LanguageModelConfig {
    pub vocab_size: usize,
    #[config(default = 256)]
    pub d_embedding: usize,
    #[config(default = 512)]
    pub d_hidden: usize,
    #[config(default = 1)]
    pub layers: usize,
    /// Rejected at init: next-token decoding cannot look ahead.
    #[config(default = false)]
    pub bidirectional: bool,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 0.0)]
    pub word_dropout: f64,
    /// Share the output projection with the embedding table.
    #[config(default = true)]
    pub tie_weights: bool,
}

/// Left-to-right word LM. Doubles as the frozen prior ("oracle") that
/// scores latent sequences during training.
#[derive(Module, Debug)]
pub struct LanguageModel<B: Backend> {
    embed: Embed<B>,
    encoder: RecurrentEncoder<B>,
    down: Option<Linear<B>>,
    out: Option<Linear<B>>,
    word_dropout: f64,
}

impl LanguageModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<LanguageModel<B>, ModelError> {
        if self.bidirectional {
            return Err(ModelError::BidirectionalDecoder);
        }
        if self.vocab_size == 0 {
            return Err(ModelError::ZeroDimension("vocab_size"));
        }
        if self.d_embedding == 0 || self.d_hidden == 0 {
            return Err(ModelError::ZeroDimension("d_embedding/d_hidden"));
        }

        let embed = EmbedConfig::new(self.vocab_size, self.d_embedding).init(device);
        let encoder = RecurrentEncoderConfig::new(self.d_embedding, self.d_hidden)
            .with_layers(self.layers)
            .with_dropout(self.dropout)
            .init(device);

        let (down, out) = if self.tie_weights {
            let down = (self.d_hidden != self.d_embedding)
                .then(|| LinearConfig::new(self.d_hidden, self.d_embedding).init(device));
            (down, None)
        } else {
            (
                None,
                Some(LinearConfig::new(self.d_hidden, self.vocab_size).init(device)),
            )
        };

        Ok(LanguageModel {
            embed,
            encoder,
            down,
            out,
            word_dropout: self.word_dropout,
        })
    }
}

impl<B: Backend> LanguageModel<B> {
    /// Next-token logits for every position.
    ///
    /// - `tokens`: [batch, len]
    ///
    /// Returns `(logits, state)`: [batch, len, vocab] plus the final
    /// recurrent state (for incremental decoding).
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        init_state: Option<EncoderState<B>>,
        lengths: Option<&Tensor<B, 1, Int>>,
    ) -> (Tensor<B, 3>, EncoderState<B>) {
        let embedded = drop_tokens(self.embed.forward(tokens), self.word_dropout);
        let encoded = self.encoder.forward(embedded, init_state, lengths);

        let hidden = match &self.down {
            Some(down) => down.forward(encoded.outputs),
            None => encoded.outputs,
        };
        let logits = match &self.out {
            Some(out) => out.forward(hidden),
            None => hidden.matmul(self.embed.weight().transpose().unsqueeze::<3>()),
        };
        (logits, encoded.state)
    }
}

//! Encoder→decoder state adaptation.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig, LstmState};
use burn::prelude::*;

use crate::model::encoder::EncoderState;

#[derive(Config, Debug)]
pub struct BridgeConfig {
    /// Encoder final-state dimension (hidden × dirs).
    pub d_encoder: usize,
    /// Decoder hidden size.
    pub d_decoder: usize,
    /// tanh on the mapped states.
    #[config(default = false)]
    pub non_linearity: bool,
    /// Append [target/source ratio, scaled target length] to the input.
    #[config(default = false)]
    pub length_features: bool,
}

/// Maps each layer's final encoder state into a decoder initial state.
/// Hidden and cell get their own projections; when requested, two length
/// features let the decoder plan for the asked-for output length.
#[derive(Module, Debug)]
pub struct Bridge<B: Backend> {
    hidden: Linear<B>,
    cell: Linear<B>,
    len_scale: Option<Linear<B>>,
    non_linearity: bool,
}

impl BridgeConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Bridge<B> {
        let d_in = self.d_encoder + if self.length_features { 2 } else { 0 };
        Bridge {
            hidden: LinearConfig::new(d_in, self.d_decoder).init(device),
            cell: LinearConfig::new(d_in, self.d_decoder).init(device),
            len_scale: self
                .length_features
                .then(|| LinearConfig::new(1, 1).with_bias(false).init(device)),
            non_linearity: self.non_linearity,
        }
    }
}

impl<B: Backend> Bridge<B> {
    /// Adapt every layer of the encoder state.
    ///
    /// `lengths` is `(source, target)` per-sample token counts; required
    /// when the bridge was built with length features.
    pub fn forward(
        &self,
        state: &EncoderState<B>,
        lengths: Option<(&Tensor<B, 1, Int>, &Tensor<B, 1, Int>)>,
    ) -> EncoderState<B> {
        let features = match (&self.len_scale, lengths) {
            (Some(scale), Some((source, target))) => {
                let batch = source.dims()[0];
                let ratio = (target.clone().float() / source.clone().float()).reshape([batch, 1]);
                let absolute = scale.forward(target.clone().float().reshape([batch, 1]));
                Some(Tensor::cat(vec![ratio, absolute], 1)) // [batch, 2]
            }
            _ => None,
        };

        state
            .iter()
            .map(|layer| {
                let with_features = |t: &Tensor<B, 2>| match &features {
                    Some(f) => Tensor::cat(vec![t.clone(), f.clone()], 1),
                    None => t.clone(),
                };
                let mut hidden = self.hidden.forward(with_features(&layer.hidden));
                let mut cell = self.cell.forward(with_features(&layer.cell));
                if self.non_linearity {
                    hidden = hidden.tanh();
                    cell = cell.tanh();
                }
                LstmState::new(cell, hidden)
            })
            .collect()
    }
}

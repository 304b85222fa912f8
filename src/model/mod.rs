//! Model components: embedding, attention, recurrent stacks and the
//! compression autoencoder that wires them together.

pub mod attention;
pub mod bridge;
pub mod decoder;
pub mod embed;
pub mod encoder;
pub mod seq3;

pub use attention::{Attention, AttentionConfig, AttentionKind};
pub use bridge::{Bridge, BridgeConfig};
pub use decoder::{
    AttDecoder, AttDecoderConfig, DecoderInput, DecoderOutput, OutputProjection, SamplingOptions,
};
pub use embed::{Embed, EmbedConfig};
pub use encoder::{
    EncoderOutput, EncoderState, LanguageModel, LanguageModelConfig, RecurrentEncoder,
    RecurrentEncoderConfig,
};
pub use seq3::{ForwardOptions, Generated, Seq3, Seq3Config, Seq3Output};

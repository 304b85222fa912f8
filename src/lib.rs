pub mod checkpoint;
pub mod data;
pub mod error;
pub mod model;
pub mod ops;
pub mod training;

pub use error::{CheckpointError, ModelError, TrainError};
pub use model::{ForwardOptions, Seq3, Seq3Config, Seq3Output};

//! Error types for model construction, training and persistence.

use std::fmt;

/// Construction-time configuration rejection.
///
/// Raised by `init` methods when a configuration cannot produce a valid
/// model (e.g. a bidirectional decoder). Never raised mid-training.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// A decode-mode recurrent stack was asked to run bidirectionally.
    BidirectionalDecoder,
    /// A dimension field that must be positive was zero.
    ZeroDimension(&'static str),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::BidirectionalDecoder => {
                write!(f, "decode-mode recurrent stacks must be unidirectional")
            }
            ModelError::ZeroDimension(name) => {
                write!(f, "dimension `{name}` must be positive")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Runtime failure inside a training or evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainError {
    /// A loss term came back NaN or infinite.
    NonFiniteLoss { term: &'static str, step: usize },
    /// A batch violated the data contract (e.g. a zero length).
    BadBatch(String),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::NonFiniteLoss { term, step } => {
                write!(f, "non-finite `{term}` loss at step {step}")
            }
            TrainError::BadBatch(msg) => write!(f, "malformed batch: {msg}"),
        }
    }
}

impl std::error::Error for TrainError {}

/// Persistence failure while saving or restoring a checkpoint.
#[derive(Debug)]
pub enum CheckpointError {
    Io(std::io::Error),
    /// A burn recorder failed to encode or decode a record.
    Record(String),
    /// A JSON sidecar failed to parse.
    Sidecar(String),
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(f, "checkpoint io: {e}"),
            CheckpointError::Record(msg) => write!(f, "checkpoint record: {msg}"),
            CheckpointError::Sidecar(msg) => write!(f, "checkpoint sidecar: {msg}"),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

//! Checkpoint bundles for the compression autoencoder.
//!
//! Uses burn's native record format (NamedMpk) for model and optimizer
//! weights, with JSON sidecars for everything needed to rebuild the model
//! without the training process: the model config, the vocabulary, and the
//! epoch/step counters.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::optim::Optimizer;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};

use crate::data::Vocab;
use crate::error::CheckpointError;
use crate::model::{Seq3, Seq3Config};

const MODEL_STEM: &str = "model";
const OPTIMIZER_STEM: &str = "optimizer";
const CONFIG_FILE: &str = "config.json";
const VOCAB_FILE: &str = "vocab.json";
const STATE_FILE: &str = "state.json";

/// Training progress stored alongside the weights.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrainState {
    pub epoch: usize,
    pub step: usize,
}

fn write_sidecar<T: Serialize>(path: PathBuf, value: &T) -> Result<(), CheckpointError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CheckpointError::Sidecar(format!("encode {}: {e}", path.display())))?;
    std::fs::write(path, json)?;
    Ok(())
}

fn read_sidecar<T: for<'de> Deserialize<'de>>(path: PathBuf) -> Result<T, CheckpointError> {
    let json = std::fs::read_to_string(&path)?;
    serde_json::from_str(&json)
        .map_err(|e| CheckpointError::Sidecar(format!("decode {}: {e}", path.display())))
}

/// Save the full bundle: weights plus the JSON sidecars.
///
/// The model lands at `{dir}/model.mpk`; burn appends the extension.
pub fn save_bundle<B: Backend>(
    dir: &Path,
    model: &Seq3<B>,
    config: &Seq3Config,
    vocab: &Vocab,
    state: TrainState,
) -> Result<(), CheckpointError> {
    std::fs::create_dir_all(dir)?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(dir.join(MODEL_STEM), &recorder)
        .map_err(|e| CheckpointError::Record(format!("save model: {e}")))?;

    write_sidecar(dir.join(CONFIG_FILE), config)?;
    write_sidecar(dir.join(VOCAB_FILE), vocab)?;
    write_sidecar(dir.join(STATE_FILE), &state)?;
    Ok(())
}

/// Load a bundle saved by [`save_bundle`], rebuilding the model from its
/// config sidecar before restoring the weights.
pub fn load_bundle<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(Seq3<B>, Seq3Config, Vocab, TrainState), CheckpointError> {
    let config: Seq3Config = read_sidecar(dir.join(CONFIG_FILE))?;
    let vocab: Vocab = read_sidecar(dir.join(VOCAB_FILE))?;
    let state: TrainState = read_sidecar(dir.join(STATE_FILE))?;

    let model = config
        .init::<B>(device)
        .map_err(|e| CheckpointError::Record(format!("rebuild model: {e}")))?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let model = model
        .load_file(dir.join(MODEL_STEM), &recorder, device)
        .map_err(|e| CheckpointError::Record(format!("load model: {e}")))?;

    Ok((model, config, vocab, state))
}

/// Whether `dir` holds a complete bundle.
pub fn bundle_exists(dir: &Path) -> bool {
    dir.join(format!("{MODEL_STEM}.mpk")).exists() && dir.join(CONFIG_FILE).exists()
}

/// Save the optimizer state next to the model so training can resume with
/// intact moment estimates.
pub fn save_optimizer<B, O>(dir: &Path, optimizer: &O) -> Result<(), CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<Seq3<B>, B>,
{
    std::fs::create_dir_all(dir)?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(optimizer.to_record(), dir.join(OPTIMIZER_STEM))
        .map_err(|e| CheckpointError::Record(format!("save optimizer: {e}")))?;
    Ok(())
}

/// Restore optimizer state saved by [`save_optimizer`]. Returns the
/// optimizer unchanged when no record exists.
pub fn load_optimizer<B, O>(
    dir: &Path,
    optimizer: O,
    device: &B::Device,
) -> Result<O, CheckpointError>
where
    B: AutodiffBackend,
    O: Optimizer<Seq3<B>, B>,
{
    let path = dir.join(OPTIMIZER_STEM);
    if !path.with_extension("mpk").exists() {
        return Ok(optimizer);
    }
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(path, device)
        .map_err(|e| CheckpointError::Record(format!("load optimizer: {e}")))?;
    Ok(optimizer.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Tensor;

    type B = NdArray;

    fn tiny_vocab() -> Vocab {
        Vocab::build(["tide", "moon", "tide"], None, 1)
    }

    #[test]
    fn bundle_roundtrip_restores_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let vocab = tiny_vocab();
        let config = Seq3Config::new(vocab.size())
            .with_d_embedding(8)
            .with_d_hidden(12);
        let model = config.init::<B>(&device).unwrap();
        let state = TrainState { epoch: 3, step: 128 };

        save_bundle(dir.path(), &model, &config, &vocab, state).unwrap();
        assert!(bundle_exists(dir.path()));

        let (loaded, loaded_config, loaded_vocab, loaded_state) =
            load_bundle::<B>(dir.path(), &device).unwrap();

        assert_eq!(loaded_config.d_hidden, 12);
        assert_eq!(loaded_vocab.size(), vocab.size());
        assert_eq!(loaded_state.epoch, 3);
        assert_eq!(loaded_state.step, 128);

        let before = model.embedding().weight();
        let after = loaded.embedding().weight();
        let diff: Tensor<B, 2> = before - after;
        assert!(crate::ops::scalar_f32(diff.abs().mean()) < 1e-6);
    }

    #[test]
    fn missing_bundle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let result = load_bundle::<B>(dir.path(), &device);
        assert!(matches!(result, Err(CheckpointError::Io(_))));
    }
}

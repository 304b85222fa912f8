//! Batch construction: vectorization with OOV slots and padded id tensors.

use std::collections::HashMap;

use burn::prelude::*;

use crate::data::vocab::{Vocab, EOS, PAD, SOS};
use crate::error::TrainError;
use crate::ops::int_tensor;

/// Per-sample map from OOV slot id back to the surface word it stood for.
pub type OovMap = HashMap<i64, String>;

/// Map a tokenized sentence to ids, assigning unseen words to the
/// vocabulary's OOV slots on a first-come basis. Once the slots are
/// exhausted, further unseen words become `<unk>`.
pub fn vectorize(vocab: &Vocab, tokens: &[String]) -> (Vec<i64>, OovMap) {
    let mut oov_map = OovMap::new();
    let mut assigned: HashMap<&str, i64> = HashMap::new();
    let ids = tokens
        .iter()
        .map(|word| match vocab.lookup(word) {
            Some(id) if !vocab.is_oov(id) => id,
            _ => {
                if let Some(&id) = assigned.get(word.as_str()) {
                    id
                } else if let Some(id) = vocab.oov_id(assigned.len()) {
                    assigned.insert(word, id);
                    oov_map.insert(id, word.clone());
                    id
                } else {
                    vocab.encode(word) // <unk>
                }
            }
        })
        .collect();
    (ids, oov_map)
}

/// Map generated ids back to words: stops at `<eos>`, skips `<pad>` and
/// `<sos>`, and restores OOV slots through the sample's map.
pub fn devectorize(vocab: &Vocab, ids: &[i64], oov_map: &OovMap) -> Vec<String> {
    let mut words = Vec::new();
    for &id in ids {
        if id == EOS {
            break;
        }
        if id == PAD || id == SOS {
            continue;
        }
        if let Some(word) = oov_map.get(&id) {
            words.push(word.clone());
        } else if let Some(word) = vocab.decode(id) {
            words.push(word.to_string());
        }
    }
    words
}

/// One training batch for the autoencoder.
///
/// `inp_src`/`out_src` drive the encoding side, `inp_trg`/`out_trg` the
/// teacher-forced reconstruction side:
/// - `inp_src` = tokens, `out_src` = tokens[1..] + eos — [batch, s_max]
/// - `inp_trg` = sos + tokens, `out_trg` = tokens + eos — [batch, s_max + 1]
/// - `src_lengths[i]` = token count, `trg_lengths[i]` = token count + 1
#[derive(Debug, Clone)]
pub struct Seq3Batch<B: Backend> {
    pub inp_src: Tensor<B, 2, Int>,
    pub out_src: Tensor<B, 2, Int>,
    pub inp_trg: Tensor<B, 2, Int>,
    pub out_trg: Tensor<B, 2, Int>,
    pub src_lengths: Tensor<B, 1, Int>,
    pub trg_lengths: Tensor<B, 1, Int>,
    /// Carried through untouched; only devectorization reads these.
    pub oov_maps: Vec<OovMap>,
}

impl<B: Backend> Seq3Batch<B> {
    pub fn batch_size(&self) -> usize {
        self.src_lengths.dims()[0]
    }

    pub fn max_src_len(&self) -> usize {
        self.inp_src.dims()[1]
    }
}

/// Pad `rows` to a rectangle and lift onto the device.
fn id_matrix<B: Backend>(
    rows: &[Vec<i64>],
    width: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let batch = rows.len();
    let mut flat = vec![PAD; batch * width];
    for (i, row) in rows.iter().enumerate() {
        flat[i * width..i * width + row.len()].copy_from_slice(row);
    }
    Tensor::from_data(TensorData::new(flat, [batch, width]), device)
}

/// Collate tokenized sentences into a padded `Seq3Batch`.
pub fn collate<B: Backend>(
    vocab: &Vocab,
    samples: &[Vec<String>],
    device: &B::Device,
) -> Result<Seq3Batch<B>, TrainError> {
    if samples.is_empty() {
        return Err(TrainError::BadBatch("empty batch".into()));
    }
    if let Some(i) = samples.iter().position(|s| s.is_empty()) {
        return Err(TrainError::BadBatch(format!("sample {i} has no tokens")));
    }

    let mut inp_src = Vec::with_capacity(samples.len());
    let mut out_src = Vec::with_capacity(samples.len());
    let mut inp_trg = Vec::with_capacity(samples.len());
    let mut out_trg = Vec::with_capacity(samples.len());
    let mut src_lengths = Vec::with_capacity(samples.len());
    let mut trg_lengths = Vec::with_capacity(samples.len());
    let mut oov_maps = Vec::with_capacity(samples.len());

    for tokens in samples {
        let (ids, oov_map) = vectorize(vocab, tokens);
        let n = ids.len() as i64;

        let mut shifted: Vec<i64> = ids[1..].to_vec();
        shifted.push(EOS);
        let mut sos_first = vec![SOS];
        sos_first.extend_from_slice(&ids);
        let mut eos_last = ids.clone();
        eos_last.push(EOS);

        inp_src.push(ids);
        out_src.push(shifted);
        inp_trg.push(sos_first);
        out_trg.push(eos_last);
        src_lengths.push(n);
        trg_lengths.push(n + 1);
        oov_maps.push(oov_map);
    }

    let s_max = src_lengths.iter().copied().max().unwrap_or(0) as usize;

    Ok(Seq3Batch {
        inp_src: id_matrix(&inp_src, s_max, device),
        out_src: id_matrix(&out_src, s_max, device),
        inp_trg: id_matrix(&inp_trg, s_max + 1, device),
        out_trg: id_matrix(&out_trg, s_max + 1, device),
        src_lengths: int_tensor(&src_lengths, device),
        trg_lengths: int_tensor(&trg_lengths, device),
        oov_maps,
    })
}

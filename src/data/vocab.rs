//! Word vocabulary with fixed special tokens and out-of-vocabulary slots.
//!
//! Id layout is frozen for checkpoint compatibility:
//! 0 = `<pad>`, 1 = `<sos>`, 2 = `<eos>`, 3 = `<unk>`, then the
//! configured number of `<oov-i>` slots, then corpus words by frequency.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const PAD: i64 = 0;
pub const SOS: i64 = 1;
pub const EOS: i64 = 2;
pub const UNK: i64 = 3;

pub const PAD_TOKEN: &str = "<pad>";
pub const SOS_TOKEN: &str = "<sos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";

const SPECIALS: [&str; 4] = [PAD_TOKEN, SOS_TOKEN, EOS_TOKEN, UNK_TOKEN];

fn oov_token(slot: usize) -> String {
    format!("<oov-{slot}>")
}

/// Frozen word↔id mapping.
///
/// Built once from a tokenized corpus and never mutated afterwards; the
/// per-sentence OOV slots let copy-style outputs refer to unseen words
/// without growing the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    encode_map: HashMap<String, i64>,
    decode_map: Vec<String>,
    oov_slots: usize,
}

impl Vocab {
    /// Build from token occurrences, most frequent first.
    ///
    /// `max_words` caps the number of corpus words kept (specials and OOV
    /// slots are always present on top of the cap). Ties break
    /// alphabetically so builds are deterministic.
    pub fn build<'a, I>(tokens: I, max_words: Option<usize>, oov_slots: usize) -> Vocab
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0) += 1;
        }
        let mut ranked: Vec<(&str, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        if let Some(cap) = max_words {
            ranked.truncate(cap);
        }

        let mut decode_map: Vec<String> = SPECIALS.iter().map(|s| s.to_string()).collect();
        decode_map.extend((0..oov_slots).map(oov_token));
        decode_map.extend(
            ranked
                .into_iter()
                .filter(|(w, _)| !SPECIALS.contains(w))
                .map(|(w, _)| w.to_string()),
        );

        let encode_map = decode_map
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as i64))
            .collect();

        Vocab {
            encode_map,
            decode_map,
            oov_slots,
        }
    }

    /// Word → id, falling back to `<unk>`.
    pub fn encode(&self, word: &str) -> i64 {
        self.encode_map.get(word).copied().unwrap_or(UNK)
    }

    /// Word → id without the `<unk>` fallback.
    pub fn lookup(&self, word: &str) -> Option<i64> {
        self.encode_map.get(word).copied()
    }

    /// Id → word.
    pub fn decode(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.decode_map.get(i))
            .map(String::as_str)
    }

    pub fn size(&self) -> usize {
        self.decode_map.len()
    }

    pub fn oov_slots(&self) -> usize {
        self.oov_slots
    }

    /// Id of the `slot`-th OOV placeholder.
    pub fn oov_id(&self, slot: usize) -> Option<i64> {
        (slot < self.oov_slots).then(|| (SPECIALS.len() + slot) as i64)
    }

    /// Whether `id` falls in the OOV slot range.
    pub fn is_oov(&self, id: i64) -> bool {
        let lo = SPECIALS.len() as i64;
        id >= lo && id < lo + self.oov_slots as i64
    }

    /// Consistency check for deserialized vocabularies: special ids must
    /// sit at their frozen positions and both maps must agree.
    pub fn is_corrupt(&self) -> bool {
        if self.decode_map.len() < SPECIALS.len() + self.oov_slots {
            return true;
        }
        for (i, s) in SPECIALS.iter().enumerate() {
            if self.decode_map[i] != *s {
                return true;
            }
        }
        if self.encode_map.len() != self.decode_map.len() {
            return true;
        }
        self.decode_map
            .iter()
            .enumerate()
            .any(|(i, w)| self.encode_map.get(w) != Some(&(i as i64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Vocab {
        let corpus = ["the", "cat", "the", "sat", "the", "cat"];
        Vocab::build(corpus.iter().copied(), None, 2)
    }

    #[test]
    fn specials_come_first() {
        let vocab = toy();
        assert_eq!(vocab.decode(PAD), Some("<pad>"));
        assert_eq!(vocab.decode(SOS), Some("<sos>"));
        assert_eq!(vocab.decode(EOS), Some("<eos>"));
        assert_eq!(vocab.decode(UNK), Some("<unk>"));
        assert_eq!(vocab.decode(4), Some("<oov-0>"));
        assert_eq!(vocab.decode(5), Some("<oov-1>"));
    }

    #[test]
    fn words_ranked_by_frequency() {
        let vocab = toy();
        // "the" (3) before "cat" (2) before "sat" (1)
        assert_eq!(vocab.encode("the"), 6);
        assert_eq!(vocab.encode("cat"), 7);
        assert_eq!(vocab.encode("sat"), 8);
        assert_eq!(vocab.size(), 9);
    }

    #[test]
    fn unknown_words_fall_back_to_unk() {
        let vocab = toy();
        assert_eq!(vocab.encode("dog"), UNK);
        assert_eq!(vocab.lookup("dog"), None);
    }

    #[test]
    fn oov_slot_ids() {
        let vocab = toy();
        assert_eq!(vocab.oov_id(0), Some(4));
        assert_eq!(vocab.oov_id(1), Some(5));
        assert_eq!(vocab.oov_id(2), None);
        assert!(vocab.is_oov(4));
        assert!(!vocab.is_oov(6));
    }

    #[test]
    fn max_words_caps_corpus_words_only() {
        let corpus = ["a", "b", "c", "a", "b", "a"];
        let vocab = Vocab::build(corpus.iter().copied(), Some(2), 1);
        // 4 specials + 1 oov + 2 words
        assert_eq!(vocab.size(), 7);
        assert_eq!(vocab.encode("c"), UNK);
    }

    #[test]
    fn serde_roundtrip_is_not_corrupt() {
        let vocab = toy();
        assert!(!vocab.is_corrupt());
        let json = serde_json::to_string(&vocab).unwrap();
        let back: Vocab = serde_json::from_str(&json).unwrap();
        assert!(!back.is_corrupt());
        assert_eq!(back.encode("cat"), vocab.encode("cat"));
    }
}

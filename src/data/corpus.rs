//! Line-oriented corpus loading and batch chunking.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use rayon::prelude::*;

use crate::data::vocab::Vocab;

/// A tokenized corpus: one sentence per input line, lowercased,
/// whitespace-split, truncated to `max_len` tokens. Empty lines dropped.
#[derive(Debug, Clone)]
pub struct Corpus {
    pub sentences: Vec<Vec<String>>,
}

impl Corpus {
    pub fn load(path: &Path, max_len: usize) -> io::Result<Corpus> {
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<io::Result<_>>()?;
        let sentences: Vec<Vec<String>> = lines
            .par_iter()
            .map(|line| {
                line.split_whitespace()
                    .take(max_len)
                    .map(|w| w.to_lowercase())
                    .collect::<Vec<String>>()
            })
            .filter(|tokens| !tokens.is_empty())
            .collect();
        Ok(Corpus { sentences })
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Build a vocabulary over every token in the corpus.
    pub fn build_vocab(&self, max_words: Option<usize>, oov_slots: usize) -> Vocab {
        Vocab::build(
            self.sentences
                .iter()
                .flat_map(|s| s.iter().map(String::as_str)),
            max_words,
            oov_slots,
        )
    }

    /// Sentence indices chunked into batches of near-uniform length.
    ///
    /// Sorting by length before chunking keeps padding waste low; a
    /// proper bucketed sampler can replace this at the call site.
    pub fn length_sorted_batches(&self, batch_size: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.sentences.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.sentences[i].len()));
        order
            .chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect()
    }

    /// Inverse document frequency per vocabulary id, for weighted topic
    /// pooling. Ids never seen in the corpus (specials, OOV slots) get a
    /// neutral weight of 1.
    pub fn idf(&self, vocab: &Vocab) -> Vec<f32> {
        let mut doc_counts = vec![0u32; vocab.size()];
        for sentence in &self.sentences {
            let mut seen = std::collections::HashSet::new();
            for word in sentence {
                let id = vocab.encode(word);
                if seen.insert(id) {
                    doc_counts[id as usize] += 1;
                }
            }
        }
        let n = self.sentences.len().max(1) as f32;
        doc_counts
            .iter()
            .map(|&c| {
                if c == 0 {
                    1.0
                } else {
                    (n / c as f32).ln().max(0.0) + 1.0
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_corpus(text: &str) -> Corpus {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{text}").unwrap();
        Corpus::load(file.path(), 50).unwrap()
    }

    #[test]
    fn load_lowercases_and_drops_empty_lines() {
        let corpus = temp_corpus("The Cat\n\nsat DOWN\n");
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.sentences[0], vec!["the", "cat"]);
        assert_eq!(corpus.sentences[1], vec!["sat", "down"]);
    }

    #[test]
    fn batches_are_length_sorted() {
        let corpus = temp_corpus("a\na b c\na b\n");
        let batches = corpus.length_sorted_batches(2);
        assert_eq!(batches.len(), 2);
        // longest first
        assert_eq!(corpus.sentences[batches[0][0]].len(), 3);
        assert_eq!(corpus.sentences[batches[0][1]].len(), 2);
    }

    #[test]
    fn idf_is_neutral_for_unseen_ids() {
        let corpus = temp_corpus("a b\na c\n");
        let vocab = corpus.build_vocab(None, 1);
        let idf = corpus.idf(&vocab);
        assert_eq!(idf.len(), vocab.size());
        // "a" occurs in every sentence: weight 1; "b" in half: bigger
        let a = idf[vocab.encode("a") as usize];
        let b = idf[vocab.encode("b") as usize];
        assert!((a - 1.0).abs() < 1e-6);
        assert!(b > a);
        // pad never occurs
        assert!((idf[0] - 1.0).abs() < 1e-6);
    }
}

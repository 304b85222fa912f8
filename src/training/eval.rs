//! Evaluation scoring.
//!
//! Model selection goes through a `Scorer` so a real ROUGE
//! implementation can be injected; the built-in scorer computes plain
//! n-gram overlap F1 plus an LCS-based variant, which tracks ROUGE well
//! enough for picking checkpoints.

use std::collections::HashMap;

/// F1 summary scores over a corpus of (reference, hypothesis) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RougeScores {
    pub rouge_1: f64,
    pub rouge_2: f64,
    pub rouge_l: f64,
}

pub trait Scorer {
    fn score(&self, references: &[Vec<String>], hypotheses: &[Vec<String>]) -> RougeScores;
}

/// Clipped n-gram overlap F1 (n = 1, 2) and LCS F1, macro-averaged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NgramF1Scorer;

impl Scorer for NgramF1Scorer {
    fn score(&self, references: &[Vec<String>], hypotheses: &[Vec<String>]) -> RougeScores {
        let pairs = references.len().min(hypotheses.len());
        if pairs == 0 {
            return RougeScores::default();
        }
        let mut totals = RougeScores::default();
        for (reference, hypothesis) in references.iter().zip(hypotheses).take(pairs) {
            totals.rouge_1 += ngram_f1(reference, hypothesis, 1);
            totals.rouge_2 += ngram_f1(reference, hypothesis, 2);
            totals.rouge_l += lcs_f1(reference, hypothesis);
        }
        RougeScores {
            rouge_1: totals.rouge_1 / pairs as f64,
            rouge_2: totals.rouge_2 / pairs as f64,
            rouge_l: totals.rouge_l / pairs as f64,
        }
    }
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], u32> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for gram in tokens.windows(n) {
            *counts.entry(gram).or_insert(0) += 1;
        }
    }
    counts
}

fn ngram_f1(reference: &[String], hypothesis: &[String], n: usize) -> f64 {
    let ref_counts = ngram_counts(reference, n);
    let hyp_counts = ngram_counts(hypothesis, n);
    let overlap: u32 = hyp_counts
        .iter()
        .map(|(gram, &count)| count.min(ref_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    let ref_total: u32 = ref_counts.values().sum();
    let hyp_total: u32 = hyp_counts.values().sum();
    f1(overlap as f64, ref_total as f64, hyp_total as f64)
}

fn lcs_f1(reference: &[String], hypothesis: &[String]) -> f64 {
    let lcs = lcs_length(reference, hypothesis) as f64;
    f1(lcs, reference.len() as f64, hypothesis.len() as f64)
}

fn lcs_length(a: &[String], b: &[String]) -> usize {
    let mut row = vec![0usize; b.len() + 1];
    for x in a {
        let mut prev_diag = 0;
        for (j, y) in b.iter().enumerate() {
            let up = row[j + 1];
            row[j + 1] = if x == y {
                prev_diag + 1
            } else {
                row[j + 1].max(row[j])
            };
            prev_diag = up;
        }
    }
    row[b.len()]
}

fn f1(overlap: f64, ref_total: f64, hyp_total: f64) -> f64 {
    if ref_total == 0.0 || hyp_total == 0.0 {
        return 0.0;
    }
    let recall = overlap / ref_total;
    let precision = overlap / hyp_total;
    if recall + precision == 0.0 {
        return 0.0;
    }
    2.0 * recall * precision / (recall + precision)
}

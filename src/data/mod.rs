//! Corpus, vocabulary and batch plumbing.

pub mod batch;
pub mod corpus;
pub mod vocab;

pub use batch::{collate, devectorize, vectorize, OovMap, Seq3Batch};
pub use corpus::Corpus;
pub use vocab::Vocab;

pub mod compress;
pub mod train;

use std::path::Path;
use std::process;

use seq3::data::Corpus;

/// Load a one-sentence-per-line corpus or exit with a message.
pub fn load_corpus_or_exit(path: &Path, max_len: usize) -> Corpus {
    match Corpus::load(path, max_len) {
        Ok(corpus) if !corpus.is_empty() => corpus,
        Ok(_) => {
            eprintln!("error: {} contains no sentences", path.display());
            process::exit(1);
        }
        Err(e) => {
            eprintln!("error: read {}: {e}", path.display());
            process::exit(1);
        }
    }
}

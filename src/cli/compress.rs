use std::path::PathBuf;
use std::process;

use burn::backend::NdArray;
use clap::Args;

use seq3::checkpoint;
use seq3::data::{collate, devectorize};
use seq3::training::{sample_lengths, LengthBounds};

#[derive(Args)]
pub struct CompressArgs {
    /// Input sentences, one per line
    pub input: PathBuf,
    /// Checkpoint directory produced by `seq3 train`
    #[arg(short, long, default_value = "checkpoints")]
    pub checkpoint: PathBuf,
    /// Write compressions here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(long, default_value = "32")]
    pub batch_size: usize,
    /// Sentences are truncated to this many tokens
    #[arg(long, default_value = "50")]
    pub max_sentence_len: usize,
    /// Shortest summary as a fraction of the source length
    #[arg(long, default_value = "0.3")]
    pub min_ratio: f64,
    /// Longest summary as a fraction of the source length
    #[arg(long, default_value = "0.5")]
    pub max_ratio: f64,
}

pub fn cmd_compress(args: CompressArgs) {
    type B = NdArray;
    let device = Default::default();

    let (model, _config, vocab, _state) =
        match checkpoint::load_bundle::<B>(&args.checkpoint, &device) {
            Ok(bundle) => bundle,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        };

    let corpus = super::load_corpus_or_exit(&args.input, args.max_sentence_len);
    let bounds = LengthBounds {
        min_ratio: args.min_ratio,
        max_ratio: args.max_ratio,
        ..LengthBounds::default()
    };

    // Chunking without length sorting keeps output lines aligned with
    // input lines.
    let mut lines = Vec::with_capacity(corpus.len());
    for chunk in corpus.sentences.chunks(args.batch_size.max(1)) {
        let batch = match collate::<B>(&vocab, chunk, &device) {
            Ok(batch) => batch,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        };
        let latent_lengths = sample_lengths(&batch.src_lengths, &bounds);
        let generated = model.generate(&batch, latent_lengths);
        for (i, tokens) in generated.tokens.iter().enumerate() {
            lines.push(devectorize(&vocab, tokens, &batch.oov_maps[i]).join(" "));
        }
    }

    match &args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, lines.join("\n") + "\n") {
                eprintln!("error: write {}: {e}", path.display());
                process::exit(1);
            }
            eprintln!("wrote {} compressions to {}", lines.len(), path.display());
        }
        None => {
            for line in &lines {
                println!("{line}");
            }
        }
    }
}

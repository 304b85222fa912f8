use std::path::PathBuf;
use std::process;

use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Tensor, TensorData};
use clap::Args;

use seq3::checkpoint::{self, TrainState};
use seq3::data::{collate, Seq3Batch, Vocab};
use seq3::model::{Seq3, Seq3Config};
use seq3::training::{
    create_optimizer, LengthBounds, NgramF1Scorer, Schedule, Seq3Objective, Trainer, TrainerConfig,
};

#[derive(Args)]
pub struct TrainArgs {
    /// Training corpus, one sentence per line
    pub input: PathBuf,
    /// Held-out corpus scored against its own sources after each epoch
    #[arg(long)]
    pub eval: Option<PathBuf>,
    /// Checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    pub out: PathBuf,
    /// Resume from an existing bundle in the checkpoint directory
    #[arg(long)]
    pub resume: bool,
    #[arg(long, default_value = "10")]
    pub epochs: usize,
    #[arg(long, default_value = "32")]
    pub batch_size: usize,
    /// Sentences are truncated to this many tokens
    #[arg(long, default_value = "50")]
    pub max_sentence_len: usize,
    /// Vocabulary cap (most frequent words kept)
    #[arg(long)]
    pub max_words: Option<usize>,
    /// Copy slots for out-of-vocabulary words
    #[arg(long, default_value = "10")]
    pub oov_slots: usize,
    #[arg(long, default_value = "256")]
    pub d_embedding: usize,
    #[arg(long, default_value = "512")]
    pub d_hidden: usize,
    #[arg(long, default_value = "0.001")]
    pub learning_rate: f64,
    /// Weight of the topic distance term
    #[arg(long, default_value = "1.0")]
    pub topic_weight: f64,
    /// Weight of the terminator length term
    #[arg(long, default_value = "1.0")]
    pub length_weight: f64,
    /// Shortest summary as a fraction of the source length
    #[arg(long, default_value = "0.3")]
    pub min_ratio: f64,
    /// Longest summary as a fraction of the source length
    #[arg(long, default_value = "0.5")]
    pub max_ratio: f64,
    /// Use the GPU backend (requires the wgpu feature)
    #[arg(long)]
    pub gpu: bool,
}

pub fn cmd_train(args: TrainArgs) {
    if args.gpu {
        #[cfg(feature = "wgpu")]
        {
            run::<Autodiff<burn::backend::Wgpu>>(&args, &Default::default());
            return;
        }
        #[cfg(not(feature = "wgpu"))]
        {
            eprintln!("error: this build has no wgpu support (rebuild with --features wgpu)");
            process::exit(1);
        }
    }
    run::<Autodiff<NdArray>>(&args, &Default::default());
}

fn run<B: AutodiffBackend>(args: &TrainArgs, device: &B::Device) {
    let corpus = super::load_corpus_or_exit(&args.input, args.max_sentence_len);
    eprintln!(
        "loaded {} sentences from {}",
        corpus.len(),
        args.input.display()
    );

    // On resume the sidecar vocabulary and config win; the corpus only
    // supplies batches.
    let (model, config, vocab, state) = if args.resume && checkpoint::bundle_exists(&args.out) {
        match checkpoint::load_bundle::<B>(&args.out, device) {
            Ok((model, config, vocab, state)) => {
                eprintln!(
                    "resuming from {} (epoch {}, step {})",
                    args.out.display(),
                    state.epoch,
                    state.step
                );
                (model, config, vocab, state)
            }
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }
    } else {
        let vocab = corpus.build_vocab(args.max_words, args.oov_slots);
        let config = Seq3Config::new(vocab.size())
            .with_d_embedding(args.d_embedding)
            .with_d_hidden(args.d_hidden);
        let model = match config.init::<B>(device) {
            Ok(model) => model,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        };
        (model, config, vocab, TrainState::default())
    };
    eprintln!(
        "vocabulary: {} entries ({} copy slots)",
        vocab.size(),
        vocab.oov_slots()
    );

    let idf = corpus.idf(&vocab);
    let idf = Tensor::<B, 1>::from_data(TensorData::new(idf, [vocab.size()]), device);
    let model = model.with_idf(idf);

    let bounds = LengthBounds {
        min_ratio: args.min_ratio,
        max_ratio: args.max_ratio,
        ..LengthBounds::default()
    };
    let trainer_config = TrainerConfig {
        learning_rate: args.learning_rate,
        train_bounds: bounds,
        eval_bounds: bounds,
        ..TrainerConfig::default()
    };

    let mut objective = Seq3Objective::new();
    objective.topic_weight = Schedule::Constant(args.topic_weight);
    objective.length_weight = Schedule::Constant(args.length_weight);

    let optimizer = create_optimizer::<B>(&trainer_config);
    let optimizer = if args.resume {
        match checkpoint::load_optimizer(&args.out, optimizer, device) {
            Ok(optimizer) => optimizer,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }
    } else {
        optimizer
    };

    let mut trainer = Trainer::new(model, optimizer, objective, trainer_config);
    trainer.restore_progress(state.epoch, state.step);

    let batches = build_batches::<B>(&corpus.sentences, &vocab, args.batch_size, device, true);
    let eval_batches = args.eval.as_ref().map(|path| {
        let eval_corpus = super::load_corpus_or_exit(path, args.max_sentence_len);
        build_batches::<B>(&eval_corpus.sentences, &vocab, args.batch_size, device, false)
    });

    let mut best_rouge = f64::NEG_INFINITY;
    while trainer.epoch_count() < args.epochs {
        match trainer.train_epoch(batches.iter().cloned()) {
            Ok(stats) => eprintln!("epoch {:>3} | {}", trainer.epoch_count(), stats.summary()),
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        }

        if let Some(eval_batches) = &eval_batches {
            let report = trainer.eval_epoch(eval_batches.iter().cloned(), &vocab, &NgramF1Scorer);
            eprintln!(
                "          | rouge-1 {:.4}  rouge-2 {:.4}  rouge-l {:.4}",
                report.rouge.rouge_1, report.rouge.rouge_2, report.rouge.rouge_l
            );
            if report.rouge.rouge_2 > best_rouge {
                best_rouge = report.rouge.rouge_2;
                save_or_exit(&args.out.join("best"), &trainer, &config, &vocab);
            }
        }

        save_or_exit(&args.out, &trainer, &config, &vocab);
    }
    eprintln!(
        "done: {} steps, checkpoints in {}",
        trainer.step_count(),
        args.out.display()
    );
}

fn build_batches<B: AutodiffBackend>(
    sentences: &[Vec<String>],
    vocab: &Vocab,
    batch_size: usize,
    device: &B::Device,
    length_sorted: bool,
) -> Vec<Seq3Batch<B>> {
    let mut order: Vec<usize> = (0..sentences.len()).collect();
    if length_sorted {
        order.sort_by_key(|&i| std::cmp::Reverse(sentences[i].len()));
    }
    order
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let samples: Vec<Vec<String>> = chunk.iter().map(|&i| sentences[i].clone()).collect();
            match collate::<B>(vocab, &samples, device) {
                Ok(batch) => batch,
                Err(e) => {
                    eprintln!("error: {e}");
                    process::exit(1);
                }
            }
        })
        .collect()
}

fn save_or_exit<B, O, J>(
    dir: &std::path::Path,
    trainer: &Trainer<B, O, J>,
    config: &Seq3Config,
    vocab: &Vocab,
) where
    B: AutodiffBackend,
    O: burn::optim::Optimizer<Seq3<B>, B>,
    J: seq3::training::Objective<B>,
{
    let state = TrainState {
        epoch: trainer.epoch_count(),
        step: trainer.step_count(),
    };
    if let Err(e) = checkpoint::save_bundle(dir, trainer.model(), config, vocab, state) {
        eprintln!("error: {e}");
        process::exit(1);
    }
    if let Err(e) = checkpoint::save_optimizer(dir, trainer.optimizer()) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

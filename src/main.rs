use clap::{Parser, Subcommand};

mod cli;

use cli::compress::{cmd_compress, CompressArgs};
use cli::train::{cmd_train, TrainArgs};

#[derive(Parser)]
#[command(
    name = "seq3",
    version,
    about = "Unsupervised sentence compression with a discrete sequence bottleneck"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a compression autoencoder on a raw text corpus
    Train(TrainArgs),
    /// Compress sentences with a trained checkpoint
    Compress(CompressArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Compress(args) => cmd_compress(args),
    }
}

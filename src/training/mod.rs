//! Training: loss terms, annealing schedules, latent length sampling, the
//! optimizer loop and compression scoring.

pub mod eval;
pub mod lengths;
pub mod losses;
pub mod schedule;
pub mod trainer;

pub use eval::{NgramF1Scorer, RougeScores, Scorer};
pub use lengths::{sample_lengths, LengthBounds};
pub use losses::{eos_length_loss, prior_loss, reconstruction_loss, topic_loss, Distance};
pub use schedule::Schedule;
pub use trainer::{
    create_optimizer, EpochStats, EvalReport, Objective, Seq3Objective, StepContext, StepOutput,
    Trainer, TrainerConfig,
};

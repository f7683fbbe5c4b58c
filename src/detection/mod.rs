//! Impact detection
//!
//! Feature extraction, heuristic and learned scoring, and the labeled sample
//! store that feeds learned mode.

pub mod classifier;
pub mod features;
pub mod forest;
pub mod heuristic;
pub mod training;

use thiserror::Error;

pub use classifier::{ClassificationResult, Classifier, ClassifierMode};
pub use features::{FeatureExtractor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use forest::{ForestParams, LearnedModel};
pub use heuristic::{Band, HeuristicConfig, Tier};
pub use training::{Label, TrainingSample, TrainingStore};

/// Errors from training and model persistence. Scoring itself never fails.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Not enough training samples ({have}/{need})")]
    InsufficientSamples { have: usize, need: usize },

    #[error("Training needs both shot and not-shot samples")]
    SingleClass,

    #[error("Model error: {0}")]
    Model(String),

    #[error("Learned mode is disabled")]
    LearnedModeDisabled,
}

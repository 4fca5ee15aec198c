pub mod classifier;
pub mod inference;
pub mod trainer;
pub mod training;

#[cfg(feature = "ml")]
pub mod burn_engine;
#[cfg(feature = "ml")]
pub mod ml_model;

pub use classifier::{BatchMetrics, Classifier, ClassifierFactory};
pub use inference::{rank_predictions, PredictedItem, VisionModel};
pub use trainer::{StartOutcome, TrainerOptions, TrainingSession, VisionModelTrainer};
pub use training::{
    fit, format_eta, BatchEnd, EpochEnd, MetricsLogObserver, SnapshotObserver, StatusObserver,
    TrainingObserver, TrainingPlan, TrainingReport, TrainingState, TrainingStatus,
};

#[cfg(feature = "ml")]
pub use burn_engine::{BurnClassifier, BurnClassifierFactory, CpuBackend, GpuBackend};
#[cfg(feature = "ml")]
pub use ml_model::{VisionCnn, VisionCnnConfig, MIN_INPUT_SIZE};

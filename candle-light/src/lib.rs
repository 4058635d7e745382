//! High-level training framework for Candle, inspired by PyTorch Lightning.
//!
//! Besides the [`Trainer`] loop, the crate ships two callbacks:
//! [`PredictionRecorder`] writes the per-item predictions of each epoch to disk,
//! and [`EarlyStopping`] halts training on a plateau and restores the best weights.

pub mod callbacks;
pub mod config;
pub mod data;
pub mod module;
pub mod trainer;
pub mod weights;

pub use callbacks::{
    Callback, EarlyStopping, EpochMetrics, Mode, PredictionFormat, PredictionRecorder, Split,
};
pub use config::TrainerConfig;
pub use data::{DataLoader, SplitInfo};
pub use module::{LightModule, StepOutput};
pub use trainer::Trainer;
pub use weights::WeightSnapshot;

pub use candle::{Module, ModuleT};

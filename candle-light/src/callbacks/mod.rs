//! Callback system for training hooks.

mod early_stopping;
mod prediction_recorder;

pub use early_stopping::EarlyStopping;
pub use prediction_recorder::{prediction_path, PredictionFormat, PredictionRecorder, Split};

use crate::{StepOutput, Trainer};
use candle::Result;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Min,
    Max,
}

/// Aggregated values for one epoch, looked up by name.
#[derive(Clone, Debug, Default)]
pub struct EpochMetrics {
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    /// Step metrics averaged over the epoch, keyed as `train_<name>` / `val_<name>`.
    pub extra: HashMap<String, f64>,
}

impl EpochMetrics {
    pub fn new(train_loss: f32) -> Self {
        Self {
            train_loss,
            ..Default::default()
        }
    }

    pub fn with_val_loss(mut self, val_loss: f32) -> Self {
        self.val_loss = Some(val_loss);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        match name {
            "val_loss" => self.val_loss,
            "train_loss" => Some(self.train_loss),
            _ => self.extra.get(name).map(|&v| v as f32),
        }
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn should_stop(&self) -> bool {
        false
    }
}

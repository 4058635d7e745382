//! Early stopping callback with best-weight restoration.

use super::{Callback, EpochMetrics, Mode};
use crate::weights::{self, WeightSnapshot};
use crate::Trainer;
use candle::Result;
use candle_nn::VarMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Stops training once the monitored metric has not improved for `patience`
/// epochs, then restores the best weights seen and saves them to
/// `<dirpath>/<stopped_epoch + 1>` when the fit ends.
pub struct EarlyStopping {
    varmap: Arc<Mutex<VarMap>>,
    dirpath: PathBuf,
    monitor: String,
    patience: usize,
    min_delta: f32,
    mode: Mode,
    best_metric: f32,
    epochs_without_improvement: usize,
    stopped_epoch: Option<usize>,
    best_weights: Option<WeightSnapshot>,
}

impl EarlyStopping {
    pub fn new(varmap: Arc<Mutex<VarMap>>, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            monitor: "val_loss".to_string(),
            patience: 0,
            min_delta: 0.0,
            mode: Mode::Min,
            best_metric: f32::INFINITY,
            epochs_without_improvement: 0,
            stopped_epoch: None,
            best_weights: None,
        }
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f32) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self.best_metric = Self::initial_best(mode);
        self
    }

    /// Best monitored value seen so far.
    pub fn best(&self) -> f32 {
        self.best_metric
    }

    /// Consecutive epochs without improvement.
    pub fn wait(&self) -> usize {
        self.epochs_without_improvement
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn best_weights(&self) -> Option<&WeightSnapshot> {
        self.best_weights.as_ref()
    }

    /// Path the best weights are written to for a stop at `stopped_epoch`.
    pub fn checkpoint_path(&self, stopped_epoch: usize) -> PathBuf {
        self.dirpath.join((stopped_epoch + 1).to_string())
    }

    fn initial_best(mode: Mode) -> f32 {
        match mode {
            Mode::Min => f32::INFINITY,
            Mode::Max => f32::NEG_INFINITY,
        }
    }

    fn is_improvement(&self, current: f32, best: f32) -> bool {
        match self.mode {
            Mode::Min => current < best - self.min_delta,
            Mode::Max => current > best + self.min_delta,
        }
    }

    fn restore_best_weights(&self) -> Result<()> {
        match &self.best_weights {
            Some(snapshot) => {
                tracing::info!("Restoring model weights from the end of the best epoch.");
                let varmap = weights::lock(&self.varmap)?;
                snapshot.restore(&varmap)
            }
            None => {
                tracing::warn!("early stopping triggered before any improvement, weights left as-is");
                Ok(())
            }
        }
    }
}

impl Callback for EarlyStopping {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        self.epochs_without_improvement = 0;
        self.stopped_epoch = None;
        self.best_metric = Self::initial_best(self.mode);
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            candle::bail!("early stopping: metric {} missing from epoch {epoch} metrics", self.monitor)
        };

        if self.is_improvement(current, self.best_metric) {
            self.best_metric = current;
            self.epochs_without_improvement = 0;
            let varmap = weights::lock(&self.varmap)?;
            self.best_weights = Some(WeightSnapshot::capture(&varmap)?);
        } else {
            self.epochs_without_improvement += 1;
            if self.epochs_without_improvement >= self.patience {
                self.stopped_epoch = Some(epoch);
                tracing::info!(
                    epoch,
                    best = self.best_metric,
                    "{} did not improve for {} epochs, stopping",
                    self.monitor,
                    self.epochs_without_improvement
                );
                self.restore_best_weights()?;
            }
        }

        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        let Some(stopped_epoch) = self.stopped_epoch else {
            return Ok(());
        };
        let path = self.checkpoint_path(stopped_epoch);
        tracing::info!(
            "Epoch {:05}: early stopping. Saving best weights to: {}",
            stopped_epoch + 1,
            path.display()
        );
        weights::save_weights(&self.varmap, &path)
    }

    fn should_stop(&self) -> bool {
        self.stopped_epoch.is_some()
    }
}

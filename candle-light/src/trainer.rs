//! Training loop implementation.

use crate::callbacks::EpochMetrics;
use crate::{Callback, LightModule, StepOutput, TrainerConfig};
use candle::{DType, Result};
use candle_nn::Optimizer;
use std::collections::HashMap;

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    global_step: usize,
    current_epoch: usize,
}

/// Running means of the loss and step metrics over one pass.
#[derive(Default)]
struct EpochAccumulator {
    loss_sum: f64,
    steps: usize,
    metric_sums: HashMap<String, (f64, usize)>,
}

impl EpochAccumulator {
    fn update(&mut self, loss: f32, output: &StepOutput) {
        self.loss_sum += loss as f64;
        self.steps += 1;
        for (name, value) in output.metrics.iter() {
            let entry = self.metric_sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    fn mean_loss(&self) -> Option<f32> {
        (self.steps > 0).then(|| (self.loss_sum / self.steps as f64) as f32)
    }

    fn means(&self, prefix: &str) -> impl Iterator<Item = (String, f64)> + '_ {
        let prefix = prefix.to_string();
        self.metric_sums
            .iter()
            .map(move |(name, (sum, n))| (format!("{prefix}_{name}"), sum / *n as f64))
    }
}

fn scalar_loss(output: &StepOutput) -> Result<f32> {
    output.loss.to_dtype(DType::F32)?.to_scalar::<f32>()
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            global_step: 0,
            current_epoch: 0,
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    /// Run `f` on every callback. The callbacks are moved out for the call so
    /// they can borrow the trainer.
    fn each_callback<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn Callback, &Trainer) -> Result<()>,
    {
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let trainer: &Trainer = self;
        let result = callbacks
            .iter_mut()
            .try_for_each(|callback| f(callback.as_mut(), trainer));
        self.callbacks = callbacks;
        result
    }

    fn should_stop(&self) -> bool {
        self.callbacks.iter().any(|callback| callback.should_stop())
    }

    pub fn fit<M, O, I>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        train_data: I,
        val_data: Option<I>,
    ) -> Result<()>
    where
        M: LightModule,
        M::Batch: Clone,
        O: Optimizer,
        I: IntoIterator<Item = M::Batch>,
    {
        let train_batches: Vec<M::Batch> = train_data.into_iter().collect();
        let val_batches: Option<Vec<M::Batch>> = val_data.map(|v| v.into_iter().collect());
        self.global_step = 0;

        self.each_callback(|cb, trainer| cb.on_fit_start(trainer))?;

        for epoch in 0..self.config.max_epochs {
            self.current_epoch = epoch;
            self.each_callback(|cb, trainer| cb.on_epoch_start(trainer, epoch))?;

            let mut train_acc = EpochAccumulator::default();
            for (batch_idx, batch) in train_batches.iter().enumerate() {
                let output = model.training_step(batch.clone(), batch_idx)?;
                optimizer.backward_step(&output.loss)?;
                let loss = scalar_loss(&output)?;
                train_acc.update(loss, &output);
                self.global_step += 1;

                let every = self.config.log_every_n_steps;
                if every > 0 && self.global_step % every == 0 {
                    tracing::info!(epoch, step = self.global_step, loss, "train");
                }
                self.each_callback(|cb, trainer| cb.on_train_batch_end(trainer, batch_idx, &output))?;
            }

            let mut metrics = EpochMetrics::new(train_acc.mean_loss().unwrap_or(f32::NAN));
            metrics.extra.extend(train_acc.means("train"));

            if let Some(val_batches) = &val_batches {
                let mut val_acc = EpochAccumulator::default();
                for (batch_idx, batch) in val_batches.iter().enumerate() {
                    let output = model.validation_step(batch.clone(), batch_idx)?;
                    val_acc.update(scalar_loss(&output)?, &output);
                    self.each_callback(|cb, trainer| {
                        cb.on_validation_batch_end(trainer, batch_idx, &output)
                    })?;
                }
                metrics.val_loss = val_acc.mean_loss();
                metrics.extra.extend(val_acc.means("val"));
            }

            tracing::debug!(epoch, train_loss = metrics.train_loss, val_loss = ?metrics.val_loss, "epoch done");
            self.each_callback(|cb, trainer| cb.on_epoch_end(trainer, epoch, &metrics))?;

            if self.should_stop() {
                tracing::info!(epoch, "stop requested by a callback");
                break;
            }
        }

        self.each_callback(|cb, trainer| cb.on_fit_end(trainer))
    }

    /// Mean validation loss over `val_data`.
    pub fn validate<M>(&self, model: &M, val_data: &[M::Batch]) -> Result<f32>
    where
        M: LightModule,
        M::Batch: Clone,
    {
        let mut acc = EpochAccumulator::default();
        for (batch_idx, batch) in val_data.iter().enumerate() {
            let output = model.validation_step(batch.clone(), batch_idx)?;
            acc.update(scalar_loss(&output)?, &output);
        }
        match acc.mean_loss() {
            Some(loss) => Ok(loss),
            None => candle::bail!("validate called without batches"),
        }
    }
}

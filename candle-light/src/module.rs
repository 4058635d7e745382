//! LightModule trait for trainable models.

use candle::{Result, Tensor, Var};
use std::collections::HashMap;

/// Output from a training or validation step.
pub struct StepOutput {
    /// The loss tensor for backpropagation.
    pub loss: Tensor,
    /// Optional metrics (e.g., accuracy, perplexity).
    pub metrics: HashMap<String, f64>,
    /// Optional per-example model outputs for the batch, shaped `(batch, classes)`.
    pub predictions: Option<Tensor>,
}

impl StepOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            metrics: HashMap::new(),
            predictions: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Attach the per-example outputs so callbacks can record them without a
    /// second forward pass.
    pub fn with_predictions(mut self, predictions: Tensor) -> Self {
        self.predictions = Some(predictions);
        self
    }
}

/// Trait for models that can be trained with [`Trainer`](crate::Trainer).
pub trait LightModule {
    type Batch;

    /// Compute loss and metrics for a training batch.
    fn training_step(&mut self, batch: Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Compute loss and metrics for a validation batch.
    fn validation_step(&self, batch: Self::Batch, batch_idx: usize) -> Result<StepOutput> {
        let _ = (batch, batch_idx);
        candle::bail!("validation_step not implemented")
    }

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var>;
}

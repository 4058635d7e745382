//! Per-epoch recording of per-item predictions.

use super::{Callback, EpochMetrics};
use crate::data::DataLoader;
use crate::{StepOutput, Trainer};
use candle::{DType, Device, Result, Tensor};
use std::fmt;
use std::path::{Path, PathBuf};

const PREDICTIONS_KEY: &str = "predictions";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
        }
    }
}

/// On-disk container for the recorded predictions. Each stores a single
/// `predictions` array of shape `(items, classes)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PredictionFormat {
    /// HDF5 file with one `predictions` dataset.
    #[default]
    Hdf5,
    Safetensors,
    Npz,
}

impl PredictionFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PredictionFormat::Hdf5 => "h5",
            PredictionFormat::Safetensors => "safetensors",
            PredictionFormat::Npz => "npz",
        }
    }

    fn write(&self, predictions: &Tensor, path: &Path) -> Result<()> {
        match self {
            PredictionFormat::Hdf5 => write_hdf5(predictions, path),
            PredictionFormat::Safetensors => predictions.save_safetensors(PREDICTIONS_KEY, path),
            PredictionFormat::Npz => Tensor::write_npz(&[(PREDICTIONS_KEY, predictions)], path),
        }
    }
}

fn write_hdf5(predictions: &Tensor, path: &Path) -> Result<()> {
    let shape = predictions.dims2()?;
    let values = predictions.flatten_all()?.to_vec1::<f32>()?;
    let file = hdf5::File::create(path).map_err(candle::Error::wrap)?;
    let dataset = file
        .new_dataset::<f32>()
        .shape(shape)
        .create(PREDICTIONS_KEY)
        .map_err(candle::Error::wrap)?;
    dataset
        .write_raw(values.as_slice())
        .map_err(candle::Error::wrap)
}

/// `<dir>/predictions_<split>_e_<epoch>.<extension>`
pub fn prediction_path(dir: impl AsRef<Path>, split: Split, epoch: usize, extension: &str) -> PathBuf {
    dir.as_ref()
        .join(format!("predictions_{split}_e_{epoch}.{extension}"))
}

/// One slot per dataset item, zero until written.
struct PredictionBuffer {
    split: Split,
    num_classes: usize,
    batch_size: usize,
    values: Vec<f32>,
    written: Vec<bool>,
    n_written: usize,
}

impl PredictionBuffer {
    fn zeros(split: Split, total_items: usize, batch_size: usize, num_classes: usize) -> Self {
        Self {
            split,
            num_classes,
            batch_size,
            values: vec![0f32; total_items * num_classes],
            written: vec![false; total_items],
            n_written: 0,
        }
    }

    fn fresh(&self) -> Self {
        Self::zeros(self.split, self.written.len(), self.batch_size, self.num_classes)
    }

    fn total_items(&self) -> usize {
        self.written.len()
    }

    fn record_batch(&mut self, batch_idx: usize, predictions: &Tensor) -> Result<()> {
        let (rows, cols) = predictions.dims2()?;
        if cols != self.num_classes {
            candle::bail!(
                "{} batch {batch_idx}: expected {} prediction columns, got {cols}",
                self.split,
                self.num_classes
            )
        }
        if rows > self.batch_size {
            candle::bail!(
                "{} batch {batch_idx}: {rows} predictions exceed the batch size {}",
                self.split,
                self.batch_size
            )
        }
        let Some((start, end)) = batch_idx
            .checked_mul(self.batch_size)
            .and_then(|start| start.checked_add(rows).map(|end| (start, end)))
        else {
            candle::bail!("{} batch {batch_idx}: item id overflows usize", self.split)
        };
        if end > self.total_items() {
            candle::bail!(
                "{} batch {batch_idx}: item ids {start}..{end} out of range for {} items",
                self.split,
                self.total_items()
            )
        }
        if rows < self.batch_size && end != self.total_items() {
            candle::bail!(
                "{} batch {batch_idx}: short batch of {rows} items is not the final batch",
                self.split
            )
        }
        if let Some(offset) = self.written[start..end].iter().position(|&w| w) {
            candle::bail!(
                "{} batch {batch_idx}: item {} already recorded this epoch",
                self.split,
                start + offset
            )
        }

        let rows = predictions
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;
        for (offset, row) in rows.into_iter().enumerate() {
            let item_id = start + offset;
            let slot = item_id * self.num_classes;
            self.values[slot..slot + self.num_classes].copy_from_slice(&row);
            self.written[item_id] = true;
        }
        self.n_written += end - start;
        Ok(())
    }

    fn into_tensor(self) -> Result<Tensor> {
        let total_items = self.total_items();
        Tensor::from_vec(self.values, (total_items, self.num_classes), &Device::Cpu)
    }
}

/// Records the predictions of every training and validation item during an
/// epoch and writes them to one file per split when the epoch ends.
///
/// Item ids are `batch_idx * batch_size + offset`, so batches must arrive in
/// loader order with the loader's batch size; only the final batch may be short.
/// The training and validation steps must attach their outputs with
/// [`StepOutput::with_predictions`].
///
/// Training predictions are the ones the training step produced: computed in
/// training mode (dropout, batch-norm batch statistics) and before the
/// optimizer update for that batch. Validation predictions come from
/// `validation_step` after the epoch's updates.
pub struct PredictionRecorder {
    dirpath: PathBuf,
    format: PredictionFormat,
    train: PredictionBuffer,
    val: PredictionBuffer,
    epoch: Option<usize>,
}

impl PredictionRecorder {
    pub fn new(
        train_loader: &impl DataLoader,
        val_loader: &impl DataLoader,
        dirpath: impl Into<PathBuf>,
    ) -> Result<Self> {
        let num_classes = 2;
        Ok(Self {
            dirpath: dirpath.into(),
            format: PredictionFormat::default(),
            train: Self::buffer(Split::Train, train_loader, num_classes)?,
            val: Self::buffer(Split::Val, val_loader, num_classes)?,
            epoch: None,
        })
    }

    fn buffer(split: Split, loader: &impl DataLoader, num_classes: usize) -> Result<PredictionBuffer> {
        if loader.batch_size() == 0 {
            candle::bail!("{split} loader reports a batch size of 0")
        }
        Ok(PredictionBuffer::zeros(
            split,
            loader.total_item_count(),
            loader.batch_size(),
            num_classes,
        ))
    }

    /// Width of each prediction vector, 2 by default.
    pub fn num_classes(mut self, num_classes: usize) -> Result<Self> {
        if num_classes == 0 {
            candle::bail!("prediction width must be at least 1")
        }
        for buffer in [&mut self.train, &mut self.val] {
            buffer.num_classes = num_classes;
            *buffer = buffer.fresh();
        }
        Ok(self)
    }

    pub fn format(mut self, format: PredictionFormat) -> Self {
        self.format = format;
        self
    }

    /// Epoch most recently started.
    pub fn epoch(&self) -> Option<usize> {
        self.epoch
    }

    pub fn path(&self, split: Split, epoch: usize) -> PathBuf {
        prediction_path(&self.dirpath, split, epoch, self.format.extension())
    }

    /// Current value of the slot for `item_id`, zero when not yet recorded.
    pub fn prediction(&self, split: Split, item_id: usize) -> Option<&[f32]> {
        let buffer = self.buffer_ref(split);
        if item_id >= buffer.total_items() {
            return None;
        }
        let slot = item_id * buffer.num_classes;
        Some(&buffer.values[slot..slot + buffer.num_classes])
    }

    /// Number of items recorded so far in the current epoch.
    pub fn recorded(&self, split: Split) -> usize {
        self.buffer_ref(split).n_written
    }

    fn buffer_ref(&self, split: Split) -> &PredictionBuffer {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        }
    }

    fn buffer_mut(&mut self, split: Split) -> &mut PredictionBuffer {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
        }
    }

    fn record(&mut self, split: Split, batch_idx: usize, output: &StepOutput) -> Result<()> {
        let Some(predictions) = &output.predictions else {
            candle::bail!("{split} batch {batch_idx}: step output carries no predictions")
        };
        self.buffer_mut(split).record_batch(batch_idx, predictions)
    }

    fn flush(&mut self, split: Split, epoch: usize) -> Result<()> {
        let path = self.path(split, epoch);
        let buffer = self.buffer_mut(split);
        let fresh = buffer.fresh();
        let buffer = std::mem::replace(buffer, fresh);
        let missing = buffer.total_items() - buffer.n_written;
        if missing > 0 {
            tracing::warn!(%split, epoch, missing, "saving predictions with unrecorded items left at zero");
        }
        let predictions = buffer.into_tensor()?;
        self.format.write(&predictions, &path)?;
        tracing::debug!(%split, epoch, path = %path.display(), "saved predictions");
        Ok(())
    }
}

impl Callback for PredictionRecorder {
    fn on_epoch_start(&mut self, _trainer: &Trainer, epoch: usize) -> Result<()> {
        self.epoch = Some(epoch);
        for split in [Split::Train, Split::Val] {
            let buffer = self.buffer_mut(split);
            if buffer.n_written > 0 {
                *buffer = buffer.fresh();
            }
        }
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        batch_idx: usize,
        output: &StepOutput,
    ) -> Result<()> {
        self.record(Split::Train, batch_idx, output)
    }

    fn on_validation_batch_end(
        &mut self,
        _trainer: &Trainer,
        batch_idx: usize,
        output: &StepOutput,
    ) -> Result<()> {
        self.record(Split::Val, batch_idx, output)
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        self.flush(Split::Train, epoch)?;
        self.flush(Split::Val, epoch)
    }
}

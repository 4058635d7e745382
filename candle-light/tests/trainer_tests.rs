use anyhow::Result;
use candle::{Device, Tensor, Var};
use candle_light::{
    Callback, EarlyStopping, EpochMetrics, LightModule, Mode, StepOutput, Trainer, TrainerConfig,
};
use candle_nn::{Linear, Module, Optimizer, VarMap, SGD};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct Batch {
    xs: Tensor,
    ys: Tensor,
}

struct LinearModel {
    linear: Linear,
    w: Var,
    b: Var,
    varmap: VarMap,
    // Validation losses reported per epoch instead of the real ones, when set.
    scripted_val_losses: Vec<f32>,
    val_calls: Cell<usize>,
}

impl LinearModel {
    fn new(device: &Device) -> Result<Self> {
        let w = Var::new(&[[0f32, 0.]], device)?;
        let b = Var::new(0f32, device)?;
        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        let varmap = VarMap::new();
        {
            let mut data = varmap.data().lock().unwrap();
            data.insert("w".to_string(), w.clone());
            data.insert("b".to_string(), b.clone());
        }
        Ok(Self {
            linear,
            w,
            b,
            varmap,
            scripted_val_losses: Vec::new(),
            val_calls: Cell::new(0),
        })
    }

    fn with_val_losses(mut self, losses: &[f32]) -> Self {
        self.scripted_val_losses = losses.to_vec();
        self
    }
}

impl LightModule for LinearModel {
    type Batch = Batch;

    fn training_step(&mut self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        let ys = self.linear.forward(&batch.xs)?;
        let loss = ys.sub(&batch.ys)?.sqr()?.sum_all()?;
        Ok(StepOutput::new(loss))
    }

    fn validation_step(&self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        if !self.scripted_val_losses.is_empty() {
            let call = self.val_calls.get();
            self.val_calls.set(call + 1);
            let idx = call.min(self.scripted_val_losses.len() - 1);
            let loss = Tensor::new(self.scripted_val_losses[idx], batch.xs.device())?;
            return Ok(StepOutput::new(loss));
        }
        let ys = self.linear.forward(&batch.xs)?;
        let loss = ys.sub(&batch.ys)?.sqr()?.sum_all()?;
        Ok(StepOutput::new(loss))
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone()]
    }
}

#[test]
fn trainer_basic_training() -> Result<()> {
    let device = Device::Cpu;

    let w_gen = Tensor::new(&[[3f32, 1.]], &device)?;
    let b_gen = Tensor::new(-2f32, &device)?;
    let gen = Linear::new(w_gen, Some(b_gen));
    let sample_xs = Tensor::new(&[[2f32, 1.], [7., 4.], [-4., 12.], [5., 8.]], &device)?;
    let sample_ys = gen.forward(&sample_xs)?;

    let batches = vec![Batch {
        xs: sample_xs,
        ys: sample_ys,
    }];

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;

    let config = TrainerConfig::new().max_epochs(1000).log_every_n_steps(0);
    let mut trainer = Trainer::new(config);
    trainer.fit(&mut model, &mut optimizer, batches, None)?;

    let w_vals = model.w.to_vec2::<f32>()?;
    let b_val = model.b.to_scalar::<f32>()?;

    assert!((w_vals[0][0] - 3.0).abs() < 0.01);
    assert!((w_vals[0][1] - 1.0).abs() < 0.01);
    assert!((b_val - (-2.0)).abs() < 0.03);
    assert_eq!(trainer.global_step(), 1000);

    Ok(())
}

#[test]
fn trainer_with_validation() -> Result<()> {
    let device = Device::Cpu;

    let w_gen = Tensor::new(&[[3f32, 1.]], &device)?;
    let b_gen = Tensor::new(-2f32, &device)?;
    let gen = Linear::new(w_gen, Some(b_gen));
    let sample_xs = Tensor::new(&[[2f32, 1.], [7., 4.], [-4., 12.], [5., 8.]], &device)?;
    let sample_ys = gen.forward(&sample_xs)?;

    let batches = vec![Batch {
        xs: sample_xs.clone(),
        ys: sample_ys.clone(),
    }];
    let val_batches = vec![Batch {
        xs: sample_xs,
        ys: sample_ys,
    }];

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;

    let config = TrainerConfig::new().max_epochs(100).log_every_n_steps(0);
    let mut trainer = Trainer::new(config);
    trainer.fit(&mut model, &mut optimizer, batches, Some(val_batches))?;

    let probe = vec![Batch {
        xs: Tensor::new(&[[2f32, 1.], [7., 4.]], &device)?,
        ys: Tensor::new(&[[5f32], [25.]], &device)?,
    }];
    let val_loss = trainer.validate(&model, probe.as_slice())?;

    assert!(val_loss.is_finite());
    Ok(())
}

struct CountingCallback {
    epoch_starts: Arc<AtomicUsize>,
    epoch_ends: Arc<AtomicUsize>,
    batch_ends: Arc<AtomicUsize>,
    val_batch_ends: Arc<AtomicUsize>,
}

impl CountingCallback {
    fn new() -> Self {
        Self {
            epoch_starts: Arc::new(AtomicUsize::new(0)),
            epoch_ends: Arc::new(AtomicUsize::new(0)),
            batch_ends: Arc::new(AtomicUsize::new(0)),
            val_batch_ends: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Callback for CountingCallback {
    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> candle::Result<()> {
        self.epoch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        self.epoch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> candle::Result<()> {
        self.batch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_validation_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> candle::Result<()> {
        self.val_batch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn unit_batches(device: &Device) -> Result<Vec<Batch>> {
    Ok(vec![
        Batch {
            xs: Tensor::new(&[[1f32, 0.]], device)?,
            ys: Tensor::new(&[[1f32]], device)?,
        },
        Batch {
            xs: Tensor::new(&[[0f32, 1.]], device)?,
            ys: Tensor::new(&[[1f32]], device)?,
        },
    ])
}

#[test]
fn trainer_callback_invocation() -> Result<()> {
    let device = Device::Cpu;
    let batches = unit_batches(&device)?;
    let val_batches = unit_batches(&device)?;

    let callback = CountingCallback::new();
    let epoch_starts = callback.epoch_starts.clone();
    let epoch_ends = callback.epoch_ends.clone();
    let batch_ends = callback.batch_ends.clone();
    let val_batch_ends = callback.val_batch_ends.clone();

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;

    let config = TrainerConfig::new().max_epochs(5).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(callback);
    trainer.fit(&mut model, &mut optimizer, batches, Some(val_batches))?;

    assert_eq!(epoch_starts.load(Ordering::SeqCst), 5);
    assert_eq!(epoch_ends.load(Ordering::SeqCst), 5);
    assert_eq!(batch_ends.load(Ordering::SeqCst), 10); // 2 batches * 5 epochs
    assert_eq!(val_batch_ends.load(Ordering::SeqCst), 10);

    Ok(())
}

struct EarlyStopCallback {
    stop_at_epoch: usize,
    current_epoch: usize,
}

impl Callback for EarlyStopCallback {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        self.current_epoch += 1;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.current_epoch >= self.stop_at_epoch
    }
}

#[test]
fn trainer_early_stopping() -> Result<()> {
    let device = Device::Cpu;

    let batches = vec![Batch {
        xs: Tensor::new(&[[1f32, 0.]], &device)?,
        ys: Tensor::new(&[[1f32]], &device)?,
    }];

    let counting = CountingCallback::new();
    let epoch_count = counting.epoch_starts.clone();
    let stopper = EarlyStopCallback {
        stop_at_epoch: 3,
        current_epoch: 0,
    };

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;

    let config = TrainerConfig::new().max_epochs(100).log_every_n_steps(0);
    let mut trainer = Trainer::new(config)
        .with_callback(counting)
        .with_callback(stopper);
    trainer.fit(&mut model, &mut optimizer, batches, None)?;

    assert_eq!(epoch_count.load(Ordering::SeqCst), 3);

    Ok(())
}

/// Records `w` as it stands at the end of every epoch.
struct WeightTrace {
    w: Var,
    seen: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl Callback for WeightTrace {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle::Result<()> {
        let w = self.w.as_tensor().flatten_all()?.to_vec1::<f32>()?;
        self.seen.lock().unwrap().push(w);
        Ok(())
    }
}

#[test]
fn builtin_early_stopping() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;

    let batches = vec![Batch {
        xs: Tensor::new(&[[2f32, 1.], [7., 4.]], &device)?,
        ys: Tensor::new(&[[5f32], [23.]], &device)?,
    }];
    let val_batches = batches.clone();

    let mut model = LinearModel::new(&device)?.with_val_losses(&[5.0, 4.0, 4.5, 4.6, 1.0]);
    let mut optimizer = SGD::new(model.parameters(), 0.001)?;
    let varmap = Arc::new(Mutex::new(model.varmap.clone()));

    let counting = CountingCallback::new();
    let epoch_count = counting.epoch_starts.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let trace = WeightTrace {
        w: model.w.clone(),
        seen: seen.clone(),
    };
    let early_stopping = EarlyStopping::new(varmap, dir.path())
        .monitor("val_loss")
        .patience(2)
        .mode(Mode::Min);

    let config = TrainerConfig::new().max_epochs(50).log_every_n_steps(0);
    let mut trainer = Trainer::new(config)
        .with_callback(counting)
        .with_callback(trace)
        .with_callback(early_stopping);
    trainer.fit(&mut model, &mut optimizer, batches, Some(val_batches))?;

    // Best at epoch 1, two misses at epochs 2 and 3.
    assert_eq!(epoch_count.load(Ordering::SeqCst), 4);

    let seen = seen.lock().unwrap();
    let w_now = model.w.as_tensor().flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(w_now, seen[1]);
    assert_ne!(w_now, seen[3]);

    let saved = candle::safetensors::load(dir.path().join("4"), &Device::Cpu)?;
    assert_eq!(saved["w"].flatten_all()?.to_vec1::<f32>()?, seen[1]);

    Ok(())
}

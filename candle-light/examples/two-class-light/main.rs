// Trains a small two-class classifier on synthetic points, recording the
// predictions of every item each epoch and stopping on a validation plateau.
use anyhow::Result;
use candle::{DType, Device, Tensor, Var, D};
use candle_light::{
    EarlyStopping, LightModule, PredictionRecorder, SplitInfo, StepOutput, Trainer, TrainerConfig,
};
use candle_nn::{loss, ops, Linear, Optimizer, VarBuilder, VarMap};
use std::sync::{Arc, Mutex};

const BATCH_SIZE: usize = 16;

#[derive(Clone)]
struct Batch {
    points: Tensor,
    labels: Tensor,
}

struct Classifier {
    fc1: Linear,
    fc2: Linear,
    varmap: VarMap,
}

impl Classifier {
    fn new(dev: &Device) -> candle::Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let fc1 = candle_nn::linear(2, 16, vs.pp("fc1"))?;
        let fc2 = candle_nn::linear(16, 2, vs.pp("fc2"))?;
        Ok(Self { fc1, fc2, varmap })
    }

    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        xs.apply(&self.fc1)?.relu()?.apply(&self.fc2)
    }

    fn step(&self, batch: &Batch) -> candle::Result<StepOutput> {
        let logits = self.forward(&batch.points)?;
        let log_sm = ops::log_softmax(&logits, D::Minus1)?;
        let loss = loss::nll(&log_sm, &batch.labels)?;
        let sum_ok = logits
            .argmax(D::Minus1)?
            .eq(&batch.labels)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let accuracy = sum_ok / batch.labels.dims1()? as f32;
        let probs = ops::softmax(&logits, D::Minus1)?;
        Ok(StepOutput::new(loss)
            .with_metric("accuracy", accuracy as f64)
            .with_predictions(probs))
    }
}

impl LightModule for Classifier {
    type Batch = Batch;

    fn training_step(&mut self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        self.step(&batch)
    }

    fn validation_step(&self, batch: Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        self.step(&batch)
    }

    fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}

/// Points inside the unit circle are class 1, the rest class 0.
fn create_batches(n_samples: usize, dev: &Device) -> Result<Vec<Batch>> {
    let points = Tensor::rand(-1.5f32, 1.5, (n_samples, 2), dev)?;
    let radius = points.sqr()?.sum(D::Minus1)?;
    let labels = radius.lt(1.0)?.to_dtype(DType::U32)?;

    let mut batches = Vec::with_capacity(n_samples.div_ceil(BATCH_SIZE));
    let mut start = 0;
    while start < n_samples {
        let len = BATCH_SIZE.min(n_samples - start);
        batches.push(Batch {
            points: points.narrow(0, start, len)?,
            labels: labels.narrow(0, start, len)?,
        });
        start += len;
    }
    Ok(batches)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_light=info".parse()?),
        )
        .init();

    let dev = Device::Cpu;
    let out_dir = std::env::temp_dir().join("two-class-light");
    std::fs::create_dir_all(&out_dir)?;
    println!("Writing predictions and weights to {}", out_dir.display());

    let (n_train, n_val) = (500, 130);
    let train_batches = create_batches(n_train, &dev)?;
    let val_batches = create_batches(n_val, &dev)?;

    let mut model = Classifier::new(&dev)?;
    let params = candle_nn::ParamsAdamW {
        lr: 0.01,
        ..Default::default()
    };
    let mut optimizer = candle_nn::AdamW::new(model.parameters(), params)?;

    let recorder = PredictionRecorder::new(
        &SplitInfo::new(n_train, BATCH_SIZE),
        &SplitInfo::new(n_val, BATCH_SIZE),
        &out_dir,
    )?;
    let early_stopping =
        EarlyStopping::new(Arc::new(Mutex::new(model.varmap.clone())), &out_dir).patience(5);

    let config = TrainerConfig::new().max_epochs(200).log_every_n_steps(100);
    let mut trainer = Trainer::new(config)
        .with_callback(recorder)
        .with_callback(early_stopping);
    trainer.fit(&mut model, &mut optimizer, train_batches, Some(val_batches.clone()))?;

    println!(
        "Stopped after epoch {}, validation loss {:.4}",
        trainer.current_epoch(),
        trainer.validate(&model, val_batches.as_slice())?
    );
    Ok(())
}

//! Training loops for the calorimeter transformer
//!
//! Two trainers share the same structure: an AdamW optimizer over a `VarMap`,
//! a pluggable learning-rate scheduler stepped once per update, and a metrics
//! tracker. [`Trainer`] fits the transformer alone with a teacher-forced MSE
//! objective; [`AdversarialTrainer`] adds a discriminator with its own
//! optimizer and alternates the two updates under one loss strategy.
//!
//! Teacher forcing happens here: the decoder input for position t is
//! `[start_token, cluster[..t-1]]`, and predictions are compared against the
//! unshifted clusters position by position.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::dataset::DataLoader;
use crate::discriminator::{Discriminator, DiscriminatorConfig};
use crate::losses::AdversarialLoss;
use crate::schedulers::LrScheduler;
use crate::transformer::{Transformer, TransformerConfig};
use crate::CaloResult;

/// Complete training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Initial learning rate (overridden by the scheduler each step)
    pub learning_rate: f64,
    /// Weight decay for AdamW
    pub weight_decay: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Batch size
    pub batch_size: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Log frequency (steps)
    pub log_every: usize,
    /// Random seed
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            batch_size: 32,
            epochs: 10,
            log_every: 100,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Configuration for quick experiments.
    pub fn quick() -> Self {
        Self {
            batch_size: 16,
            epochs: 3,
            log_every: 10,
            ..Self::default()
        }
    }
}

/// Training metrics tracker.
#[derive(Debug, Clone, Default)]
pub struct TrainingMetrics {
    /// Loss history
    pub loss_history: Vec<f64>,
    /// Learning rate history
    pub lr_history: Vec<f64>,
    /// Evaluation loss history
    pub eval_loss_history: Vec<f64>,
    /// Training time per step (ms)
    pub step_times: Vec<f64>,
    /// Best evaluation loss
    pub best_eval_loss: f64,
    /// Step with best evaluation loss
    pub best_step: usize,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self {
            best_eval_loss: f64::INFINITY,
            ..Default::default()
        }
    }

    pub fn log_step(&mut self, loss: f64, lr: f64, step_time_ms: f64) {
        self.loss_history.push(loss);
        self.lr_history.push(lr);
        self.step_times.push(step_time_ms);
    }

    pub fn log_eval(&mut self, eval_loss: f64, step: usize) {
        self.eval_loss_history.push(eval_loss);
        if eval_loss < self.best_eval_loss {
            self.best_eval_loss = eval_loss;
            self.best_step = step;
        }
    }

    pub fn summary(&self) -> String {
        let n_steps = self.loss_history.len();
        let recent_loss: f64 = if n_steps >= 100 {
            self.loss_history[n_steps - 100..].iter().sum::<f64>() / 100.0
        } else if n_steps > 0 {
            self.loss_history.iter().sum::<f64>() / n_steps as f64
        } else {
            0.0
        };
        let avg_step_time: f64 = if self.step_times.is_empty() {
            0.0
        } else {
            self.step_times.iter().sum::<f64>() / self.step_times.len() as f64
        };
        format!(
            "Steps: {}, Recent Loss: {:.4}, Best Eval: {:.4} (step {}), Avg Step Time: {:.1}ms",
            n_steps, recent_loss, self.best_eval_loss, self.best_step, avg_step_time
        )
    }
}

/// Decoder input under teacher forcing: start token, then all but the last
/// cluster position.
fn teacher_forced_input(model: &Transformer, cluster: &Tensor) -> CaloResult<Tensor> {
    let (_batch, tgt_len, _depth) = cluster.dims3()?;
    let start = model.get_start_token(cluster)?.unsqueeze(1)?;
    if tgt_len == 1 {
        return Ok(start);
    }
    let history = cluster.narrow(1, 0, tgt_len - 1)?;
    Ok(Tensor::cat(&[start, history], 1)?)
}

/// Trainer for the transformer alone, with a teacher-forced MSE objective.
pub struct Trainer {
    model: Transformer,
    var_map: VarMap,
    optimizer: AdamW,
    scheduler: Box<dyn LrScheduler>,
    config: TrainingConfig,
    metrics: TrainingMetrics,
    global_step: usize,
}

impl Trainer {
    pub fn new(
        model_config: TransformerConfig,
        training_config: TrainingConfig,
        scheduler: Box<dyn LrScheduler>,
        device: &Device,
    ) -> CaloResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let model = Transformer::new(model_config, vb)?;

        let optimizer = AdamW::new(
            var_map.all_vars(),
            ParamsAdamW {
                lr: training_config.learning_rate,
                weight_decay: training_config.weight_decay,
                beta1: training_config.beta1,
                beta2: training_config.beta2,
                eps: training_config.eps,
            },
        )?;

        Ok(Self {
            model,
            var_map,
            optimizer,
            scheduler,
            config: training_config,
            metrics: TrainingMetrics::new(),
            global_step: 0,
        })
    }

    /// Single teacher-forced training step on one batch.
    pub fn train_step(&mut self, photon: &Tensor, cluster: &Tensor) -> CaloResult<f64> {
        let start = Instant::now();

        let shifted = teacher_forced_input(&self.model, cluster)?;
        let out = self.model.forward(photon, &shifted, true)?;
        let loss = candle_nn::loss::mse(&out.output, cluster)?;
        let loss_value: f32 = loss.to_scalar()?;

        let grads = loss.backward()?;
        let lr = self.scheduler.next_lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let step_time = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.log_step(loss_value as f64, lr, step_time);

        if self.config.log_every > 0 && self.global_step % self.config.log_every == 0 {
            log::info!(
                "Step {}: loss={:.4}, lr={:.2e}",
                self.global_step,
                loss_value,
                lr
            );
        }

        Ok(loss_value as f64)
    }

    /// Train over every batch the loader yields; returns the average loss.
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> CaloResult<f64> {
        loader.reset();

        let mut total_loss = 0.0;
        let mut n_batches = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            total_loss += self.train_step(&batch.photon, &batch.cluster)?;
            n_batches += 1;
        }

        if n_batches == 0 {
            return Ok(0.0);
        }
        Ok(total_loss / n_batches as f64)
    }

    /// Teacher-forced loss without gradient updates.
    pub fn evaluate(&mut self, loader: &mut DataLoader) -> CaloResult<f64> {
        loader.reset();

        let mut total_loss = 0.0;
        let mut n_batches = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            let shifted = teacher_forced_input(&self.model, &batch.cluster)?;
            let out = self.model.forward(&batch.photon, &shifted, false)?;
            let loss: f32 = candle_nn::loss::mse(&out.output, &batch.cluster)?.to_scalar()?;
            total_loss += loss as f64;
            n_batches += 1;
        }

        if n_batches == 0 {
            return Ok(0.0);
        }
        let avg = total_loss / n_batches as f64;
        self.metrics.log_eval(avg, self.global_step);
        Ok(avg)
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}

/// Losses from one adversarial update.
#[derive(Debug, Clone, Copy)]
pub struct AdversarialStepResult {
    pub discriminator_loss: f64,
    pub transformer_loss: f64,
}

/// Trainer alternating discriminator and transformer updates under one
/// adversarial loss strategy. Each player owns its variable map and
/// optimizer; the scheduler drives the transformer's rate only.
pub struct AdversarialTrainer {
    model: Transformer,
    var_map: VarMap,
    optimizer: AdamW,
    discriminator: Discriminator,
    disc_var_map: VarMap,
    disc_optimizer: AdamW,
    scheduler: Box<dyn LrScheduler>,
    loss: Box<dyn AdversarialLoss>,
    config: TrainingConfig,
    metrics: TrainingMetrics,
    global_step: usize,
}

impl AdversarialTrainer {
    pub fn new(
        model_config: TransformerConfig,
        disc_config: DiscriminatorConfig,
        training_config: TrainingConfig,
        scheduler: Box<dyn LrScheduler>,
        loss: Box<dyn AdversarialLoss>,
        device: &Device,
    ) -> CaloResult<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let model = Transformer::new(model_config, vb)?;

        let disc_var_map = VarMap::new();
        let disc_vb = VarBuilder::from_varmap(&disc_var_map, DType::F32, device);
        let discriminator = Discriminator::new(disc_config, disc_vb)?;

        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            weight_decay: training_config.weight_decay,
            beta1: training_config.beta1,
            beta2: training_config.beta2,
            eps: training_config.eps,
        };
        let optimizer = AdamW::new(var_map.all_vars(), params.clone())?;
        let disc_optimizer = AdamW::new(disc_var_map.all_vars(), params)?;

        Ok(Self {
            model,
            var_map,
            optimizer,
            discriminator,
            disc_var_map,
            disc_optimizer,
            scheduler,
            loss,
            config: training_config,
            metrics: TrainingMetrics::new(),
            global_step: 0,
        })
    }

    /// One alternating update: discriminator on detached predictions first,
    /// then the transformer against the refreshed discriminator.
    pub fn train_step(&mut self, photon: &Tensor, cluster: &Tensor) -> CaloResult<AdversarialStepResult> {
        let start = Instant::now();

        let shifted = teacher_forced_input(&self.model, cluster)?;
        let pred = self.model.forward(photon, &shifted, true)?.output;

        // discriminator update; the generator graph is cut off
        let detached = pred.detach();
        let d_loss =
            self.loss
                .discriminator_loss(&self.discriminator, cluster, &detached, None, true)?;
        let d_value: f32 = d_loss.to_scalar()?;
        let d_grads = d_loss.backward()?;
        self.disc_optimizer.step(&d_grads)?;

        // transformer update against the refreshed discriminator
        let t_loss = self
            .loss
            .transformer_loss(&self.discriminator, cluster, &pred, None, false)?;
        let t_value: f32 = t_loss.to_scalar()?;
        let t_grads = t_loss.backward()?;
        let lr = self.scheduler.next_lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&t_grads)?;
        self.global_step += 1;

        let step_time = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.log_step(t_value as f64, lr, step_time);

        if self.config.log_every > 0 && self.global_step % self.config.log_every == 0 {
            log::info!(
                "Step {} [{}]: d_loss={:.4}, t_loss={:.4}, lr={:.2e}",
                self.global_step,
                self.loss.name(),
                d_value,
                t_value,
                lr
            );
        }

        Ok(AdversarialStepResult {
            discriminator_loss: d_value as f64,
            transformer_loss: t_value as f64,
        })
    }

    /// Alternate updates over every batch; returns average transformer loss.
    pub fn train_epoch(&mut self, loader: &mut DataLoader) -> CaloResult<f64> {
        loader.reset();

        let mut total_loss = 0.0;
        let mut n_batches = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            let result = self.train_step(&batch.photon, &batch.cluster)?;
            total_loss += result.transformer_loss;
            n_batches += 1;
        }

        if n_batches == 0 {
            return Ok(0.0);
        }
        Ok(total_loss / n_batches as f64)
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn disc_var_map(&self) -> &VarMap {
        &self.disc_var_map
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::PointCloudDataset;
    use crate::embedding::SeqOrderConfig;
    use crate::losses::MeanAbsoluteError;
    use crate::schedulers::AttentionDecay;

    fn tiny_model_config() -> TransformerConfig {
        TransformerConfig {
            encoder_depth: 16,
            decoder_depth: 16,
            num_layers: 2,
            num_heads: 2,
            key_dim: 8,
            ff_units: 32,
            mlp_units: 32,
            dropout_rate: 0.0,
            encoder_seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 64,
                normalization: 128.0,
                dropout_rate: 0.0,
            },
            decoder_seq_ord: SeqOrderConfig {
                latent_dim: 8,
                max_length: 64,
                normalization: 128.0,
                dropout_rate: 0.0,
            },
            ..TransformerConfig::default()
        }
    }

    fn loader() -> DataLoader {
        let dataset = PointCloudDataset::synthetic(16, 6, 8, 3, 3).unwrap();
        DataLoader::new(dataset, 8, false, Device::Cpu).unwrap()
    }

    #[test]
    fn test_teacher_forced_input_shape() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = Transformer::new(tiny_model_config(), vb).unwrap();
        let cluster = Tensor::randn(0f32, 1f32, (4, 8, 3), &device).unwrap();
        let shifted = teacher_forced_input(&model, &cluster).unwrap();
        assert_eq!(shifted.dims(), cluster.dims());
        // first position is the start token (zeros by default)
        let first = shifted.narrow(1, 0, 1).unwrap();
        let max = first
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn test_train_steps_record_metrics() {
        let device = Device::Cpu;
        let scheduler = Box::new(AttentionDecay::new(16, 10).unwrap());
        let mut trainer = Trainer::new(
            tiny_model_config(),
            TrainingConfig::quick(),
            scheduler,
            &device,
        )
        .unwrap();

        let mut loader = loader();
        let avg = trainer.train_epoch(&mut loader).unwrap();
        assert!(avg.is_finite());
        assert_eq!(trainer.global_step(), 2);
        assert_eq!(trainer.metrics().loss_history.len(), 2);
        assert_eq!(trainer.metrics().lr_history.len(), 2);
        for loss in &trainer.metrics().loss_history {
            assert!(loss.is_finite());
        }
        // warmup phase of the scheduler: rate rises between the two steps
        assert!(trainer.metrics().lr_history[1] > trainer.metrics().lr_history[0]);
    }

    #[test]
    fn test_evaluate_records_eval_loss() {
        let device = Device::Cpu;
        let scheduler = Box::new(AttentionDecay::new(16, 10).unwrap());
        let mut trainer = Trainer::new(
            tiny_model_config(),
            TrainingConfig::quick(),
            scheduler,
            &device,
        )
        .unwrap();

        let mut loader = loader();
        let eval_loss = trainer.evaluate(&mut loader).unwrap();
        assert!(eval_loss.is_finite());
        assert_eq!(trainer.metrics().eval_loss_history.len(), 1);
        assert_eq!(trainer.metrics().best_eval_loss, eval_loss);
    }

    #[test]
    fn test_adversarial_step() {
        let device = Device::Cpu;
        let scheduler = Box::new(AttentionDecay::new(16, 10).unwrap());
        let mut trainer = AdversarialTrainer::new(
            tiny_model_config(),
            DiscriminatorConfig {
                latent_dim: 16,
                hidden_units: 32,
                ..DiscriminatorConfig::default()
            },
            TrainingConfig::quick(),
            scheduler,
            Box::new(MeanAbsoluteError),
            &device,
        )
        .unwrap();

        let mut loader = loader();
        let batch = loader.next_batch().unwrap().unwrap();
        let result = trainer.train_step(&batch.photon, &batch.cluster).unwrap();
        assert!(result.discriminator_loss.is_finite());
        assert!(result.transformer_loss.is_finite());
        // the two objectives share one divergence with opposite signs
        assert!((result.discriminator_loss + result.transformer_loss).abs() < 1.0);
        assert_eq!(trainer.global_step(), 1);
    }
}

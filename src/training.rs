//! Adapter training.
//!
//! [`AdapterTrainer`] runs AdamW over the trainable adapter variables of a
//! [`PeftModel`], with gradient accumulation, norm clipping and a learning
//! rate from [`LrSchedule`]. Its [`TrainingLog`] is written in the metric
//! format of benchmark records, and [`TrainConfig`] is the `train_config`
//! block those records carry.

#![allow(clippy::cast_precision_loss)]

use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::bench::record::{
    StepMetrics, TrainInfo, TrainStatus, EVAL_TIME, TRAIN_LOSS, TRAIN_SAMPLES, TRAIN_TIME,
    VALID_ACCURACY,
};
use crate::error::{PeftError, Result};
use crate::model::PeftModel;
use crate::traits::{BuildAdapter, Mergeable, Trainable};

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LrSchedule {
    /// Constant learning rate
    #[default]
    Constant,
    /// Ramp from 0 to the base rate, then hold
    LinearWarmup {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Half-cosine from the base rate down to `min_lr`
    CosineAnnealing {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
    /// Straight line from the base rate down to `min_lr`
    LinearDecay {
        /// Total number of steps
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
    /// Linear warmup followed by cosine annealing over the remaining steps
    WarmupCosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of steps, warmup included
        total_steps: usize,
        /// Minimum learning rate
        min_lr: f64,
    },
}

impl LrSchedule {
    /// Learning rate at `step` (0-indexed) for a peak rate of `base_lr`.
    #[must_use]
    pub fn get_lr(&self, step: usize, base_lr: f64) -> f64 {
        match *self {
            Self::Constant => base_lr,
            Self::LinearWarmup { warmup_steps } => ramp_up(step, warmup_steps, base_lr),
            Self::CosineAnnealing {
                total_steps,
                min_lr,
            } => decay(step, total_steps, base_lr, min_lr, |p| {
                (1.0 + (std::f64::consts::PI * p).cos()) / 2.0
            }),
            Self::LinearDecay {
                total_steps,
                min_lr,
            } => decay(step, total_steps, base_lr, min_lr, |p| 1.0 - p),
            Self::WarmupCosine {
                warmup_steps,
                total_steps,
                min_lr,
            } => {
                if step < warmup_steps {
                    ramp_up(step, warmup_steps, base_lr)
                } else {
                    Self::CosineAnnealing {
                        total_steps: total_steps.saturating_sub(warmup_steps),
                        min_lr,
                    }
                    .get_lr(step - warmup_steps, base_lr)
                }
            }
        }
    }
}

fn ramp_up(step: usize, warmup_steps: usize, base_lr: f64) -> f64 {
    if step >= warmup_steps {
        base_lr
    } else {
        base_lr * step as f64 / warmup_steps as f64
    }
}

/// `min_lr + (base_lr - min_lr) * shape(progress)`, `min_lr` once done.
fn decay(step: usize, total_steps: usize, base_lr: f64, min_lr: f64, shape: impl Fn(f64) -> f64) -> f64 {
    if step >= total_steps {
        return min_lr;
    }
    let progress = step as f64 / total_steps as f64;
    min_lr + (base_lr - min_lr) * shape(progress)
}

/// Optimizer arguments of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerKwargs {
    /// Learning rate
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Weight decay
    #[serde(default)]
    pub weight_decay: f64,
    /// Other optimizer arguments
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_lr() -> f64 {
    1e-4
}

impl Default for OptimizerKwargs {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: 0.0,
            extra: Map::new(),
        }
    }
}

/// Training hyperparameters, as stored in `run_info.train_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Base model identifier
    pub model_id: String,
    /// Model dtype, e.g. `bfloat16`
    pub dtype: String,
    /// Maximum tokens per sample
    pub max_seq_length: usize,
    /// Training batch size
    pub batch_size: usize,
    /// Evaluation batch size
    pub batch_size_eval: usize,
    /// Number of optimizer steps
    pub max_steps: usize,
    /// Evaluate every this many steps
    pub eval_steps: usize,
    /// Whether the model was compiled
    pub compile: bool,
    /// Prompt template
    pub query_template: String,
    /// Random seed
    pub seed: u64,
    /// Gradient norm clipping threshold
    pub grad_norm_clip: f64,
    /// Optimizer name
    pub optimizer_type: String,
    /// Optimizer arguments
    pub optimizer_kwargs: OptimizerKwargs,
    /// Scheduler name: `cosine`, `linear`, `constant` or none
    pub lr_scheduler: Option<String>,
    /// Mixed precision training
    pub use_amp: bool,
    /// Keep adapter weights in float32
    pub autocast_adapter_dtype: bool,
    /// Generation settings for evaluation
    pub generation_kwargs: Map<String, Value>,
    /// Attention kernel
    pub attn_implementation: Option<String>,
    /// Keys not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            dtype: "float32".to_string(),
            max_seq_length: 768,
            batch_size: 4,
            batch_size_eval: 50,
            max_steps: 5000,
            eval_steps: 250,
            compile: false,
            query_template: String::new(),
            seed: 0,
            grad_norm_clip: 1.0,
            optimizer_type: "AdamW".to_string(),
            optimizer_kwargs: OptimizerKwargs::default(),
            lr_scheduler: Some("cosine".to_string()),
            use_amp: false,
            autocast_adapter_dtype: true,
            generation_kwargs: Map::new(),
            attn_implementation: None,
            extra: Map::new(),
        }
    }
}

impl TrainConfig {
    /// Schedule named by `lr_scheduler`. `cosine` warms up over the first
    /// tenth of `max_steps`.
    ///
    /// # Errors
    /// Returns an error for an unknown scheduler name.
    pub fn lr_schedule(&self) -> Result<LrSchedule> {
        match self.lr_scheduler.as_deref() {
            None | Some("constant") => Ok(LrSchedule::Constant),
            Some("cosine") => Ok(LrSchedule::WarmupCosine {
                warmup_steps: self.max_steps / 10,
                total_steps: self.max_steps,
                min_lr: 0.0,
            }),
            Some("linear") => Ok(LrSchedule::LinearDecay {
                total_steps: self.max_steps,
                min_lr: 0.0,
            }),
            Some(other) => Err(PeftError::InvalidConfig(format!(
                "unknown lr_scheduler '{other}'"
            ))),
        }
    }
}

/// Optimizer settings of an [`AdapterTrainer`].
#[derive(Debug, Clone)]
pub struct AdapterTrainingConfig {
    /// Base learning rate
    pub learning_rate: f64,
    /// Learning rate schedule
    pub lr_schedule: LrSchedule,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Batches whose gradients are averaged per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Clip the global gradient norm to this value
    pub max_grad_norm: Option<f64>,
}

impl Default for AdapterTrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            lr_schedule: LrSchedule::Constant,
            weight_decay: 0.0,
            gradient_accumulation_steps: 1,
            max_grad_norm: Some(1.0),
        }
    }
}

impl AdapterTrainingConfig {
    /// Trainer settings for a benchmark `train_config`.
    ///
    /// # Errors
    /// Returns an error for an unknown scheduler name.
    pub fn from_train_config(config: &TrainConfig) -> Result<Self> {
        Ok(Self {
            learning_rate: config.optimizer_kwargs.lr,
            lr_schedule: config.lr_schedule()?,
            weight_decay: config.optimizer_kwargs.weight_decay,
            gradient_accumulation_steps: 1,
            max_grad_norm: (config.grad_norm_clip > 0.0).then_some(config.grad_norm_clip),
        })
    }
}

/// Step, epoch and accumulation counters of a training run.
#[derive(Debug, Clone)]
pub struct AdapterTrainingState {
    /// Current global step
    pub global_step: usize,
    /// Current epoch
    pub epoch: usize,
    /// Steps within current epoch
    pub steps_in_epoch: usize,
    /// Batches accumulated since the last optimizer step
    pub accumulated_steps: usize,
    /// Best validation loss seen
    pub best_val_loss: Option<f64>,
    /// Training configuration
    config: AdapterTrainingConfig,
}

impl AdapterTrainingState {
    /// Fresh state at step 0.
    #[must_use]
    pub fn new(config: AdapterTrainingConfig) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            steps_in_epoch: 0,
            accumulated_steps: 0,
            best_val_loss: None,
            config,
        }
    }

    /// Learning rate of the next optimizer step.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.config
            .lr_schedule
            .get_lr(self.global_step, self.config.learning_rate)
    }

    /// True once enough batches are accumulated for an optimizer step.
    #[must_use]
    pub fn should_update(&self) -> bool {
        self.accumulated_steps >= self.config.gradient_accumulation_steps
    }

    /// Count one processed batch. Returns `true` when it completes an
    /// optimizer step.
    pub fn step(&mut self) -> bool {
        self.accumulated_steps += 1;
        self.steps_in_epoch += 1;

        if self.should_update() {
            self.global_step += 1;
            self.accumulated_steps = 0;
            true
        } else {
            false
        }
    }

    /// Start a new epoch.
    pub fn new_epoch(&mut self) {
        self.epoch += 1;
        self.steps_in_epoch = 0;
    }

    /// Record a validation loss; `true` if it improves on the best so far.
    pub fn update_best_val_loss(&mut self, val_loss: f64) -> bool {
        match self.best_val_loss {
            Some(best) if val_loss >= best => false,
            _ => {
                self.best_val_loss = Some(val_loss);
                true
            }
        }
    }

    /// Batches per optimizer step.
    #[must_use]
    pub fn gradient_accumulation_steps(&self) -> usize {
        self.config.gradient_accumulation_steps
    }

    /// Clipping threshold of the global gradient norm.
    #[must_use]
    pub fn max_grad_norm(&self) -> Option<f64> {
        self.config.max_grad_norm
    }

    /// Decoupled weight decay.
    #[must_use]
    pub fn weight_decay(&self) -> f64 {
        self.config.weight_decay
    }
}

/// Metric series of a training run in benchmark-record form.
#[derive(Debug, Clone, Default)]
pub struct TrainingLog {
    entries: Vec<StepMetrics>,
}

impl TrainingLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` at `step`, adding an entry if the step is new.
    pub fn record(&mut self, step: usize, key: &str, value: f64) {
        match self.entries.iter_mut().rev().find(|e| e.step == step) {
            Some(entry) => entry.insert(key, value),
            None => self.entries.push(StepMetrics::new(step).with(key, value)),
        }
    }

    /// Record a training step.
    pub fn log_train(&mut self, step: usize, loss: f64, samples: usize, train_time: f64) {
        self.record(step, TRAIN_LOSS, loss);
        self.record(step, TRAIN_SAMPLES, samples as f64);
        self.record(step, TRAIN_TIME, train_time);
    }

    /// Record an evaluation.
    pub fn log_eval(&mut self, step: usize, valid_accuracy: f64, eval_time: f64) {
        self.record(step, VALID_ACCURACY, valid_accuracy);
        self.record(step, EVAL_TIME, eval_time);
    }

    /// Entries in step order.
    #[must_use]
    pub fn entries(&self) -> &[StepMetrics] {
        &self.entries
    }

    /// Convert into the `train_info` block of a record.
    #[must_use]
    pub fn into_train_info(
        self,
        train_time: f64,
        num_trainable_params: u64,
        num_total_params: u64,
        status: TrainStatus,
    ) -> TrainInfo {
        TrainInfo {
            train_time,
            num_trainable_params,
            num_total_params,
            status,
            metrics: self.entries,
            ..TrainInfo::default()
        }
    }
}

/// AdamW over adapter variables, driven by an [`LrSchedule`].
pub struct AdapterTrainer {
    optimizer: AdamW,
    vars: Vec<Var>,
    state: AdapterTrainingState,
    log: TrainingLog,
    pending: Option<GradStore>,
    pending_loss: f64,
    samples: usize,
    started: Instant,
}

impl AdapterTrainer {
    /// Trainer over `vars`.
    ///
    /// # Errors
    /// Returns an error if `vars` is empty or the optimizer cannot be built.
    pub fn new(vars: Vec<Var>, config: AdapterTrainingConfig) -> Result<Self> {
        if vars.is_empty() {
            return Err(PeftError::InvalidConfig(
                "no trainable variables to optimize".into(),
            ));
        }
        if config.gradient_accumulation_steps == 0 {
            return Err(PeftError::InvalidConfig(
                "gradient_accumulation_steps must be > 0".into(),
            ));
        }
        let params = ParamsAdamW {
            lr: config.lr_schedule.get_lr(0, config.learning_rate),
            weight_decay: config.weight_decay,
            ..ParamsAdamW::default()
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            vars,
            state: AdapterTrainingState::new(config),
            log: TrainingLog::new(),
            pending: None,
            pending_loss: 0.0,
            samples: 0,
            started: Instant::now(),
        })
    }

    /// Trainer over the unfrozen variables of the active adapters of `model`.
    ///
    /// # Errors
    /// Returns an error if the model has no trainable variables.
    pub fn for_model<A>(model: &PeftModel<A>, config: AdapterTrainingConfig) -> Result<Self>
    where
        A: BuildAdapter + Mergeable + Trainable,
    {
        let mut var_map = VarMap::new();
        model.register_active_parameters(&mut var_map)?;
        Self::new(var_map.all_vars(), config)
    }

    /// Training state.
    #[must_use]
    pub fn state(&self) -> &AdapterTrainingState {
        &self.state
    }

    /// Metric log.
    #[must_use]
    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    /// Metric log, for adding evaluation results.
    pub fn log_mut(&mut self) -> &mut TrainingLog {
        &mut self.log
    }

    /// Seconds since the trainer was built.
    #[must_use]
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Backpropagate `loss` computed on `batch_size` samples.
    ///
    /// Once enough batches are accumulated, the averaged gradients are
    /// clipped, the optimizer steps and the gradients are returned.
    ///
    /// # Errors
    /// Returns an error if backpropagation or the optimizer step fails.
    pub fn step(&mut self, loss: &Tensor, batch_size: usize) -> Result<Option<GradStore>> {
        let grads = loss.backward()?;
        self.pending_loss += f64::from(loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?);
        self.samples += batch_size;
        self.accumulate(grads)?;

        if !self.state.step() {
            return Ok(None);
        }

        let accumulation = self.state.gradient_accumulation_steps();
        let mut grads = self.pending.take().ok_or_else(|| {
            PeftError::InvalidConfig("optimizer step without gradients".into())
        })?;
        if accumulation > 1 {
            self.scale(&mut grads, 1.0 / accumulation as f64)?;
        }
        let grad_norm = self.grad_norm(&grads)?;
        if let Some(max_norm) = self.state.max_grad_norm() {
            if grad_norm > max_norm {
                self.scale(&mut grads, max_norm / (grad_norm + 1e-6))?;
            }
        }

        // The schedule is indexed by the step being taken.
        let lr = self
            .state
            .config
            .lr_schedule
            .get_lr(self.state.global_step - 1, self.state.config.learning_rate);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;

        let step = self.state.global_step;
        let loss = self.pending_loss / accumulation as f64;
        self.pending_loss = 0.0;
        debug!(step, loss, lr, grad_norm, "optimizer step");
        self.log.log_train(step, loss, self.samples, self.elapsed());
        Ok(Some(grads))
    }

    fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        let Some(mut acc) = self.pending.take() else {
            self.pending = Some(grads);
            return Ok(());
        };
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sum = match acc.get(var.as_tensor()) {
                    Some(prev) => prev.add(grad)?,
                    None => grad.clone(),
                };
                acc.insert(var.as_tensor(), sum);
            }
        }
        self.pending = Some(acc);
        Ok(())
    }

    fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut total = 0.0f64;
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let sq: f32 = grad
                    .to_dtype(candle_core::DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_scalar()?;
                total += f64::from(sq);
            }
        }
        Ok(total.sqrt())
    }

    fn scale(&self, grads: &mut GradStore, factor: f64) -> Result<()> {
        for var in &self.vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let scaled = grad.affine(factor, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
        Ok(())
    }
}

/// Count trainable parameters in an adapter.
///
/// # Arguments
/// * `adapter` - The adapter to count parameters for
///
/// # Returns
/// Number of trainable parameters
#[must_use]
pub fn count_trainable_parameters<A: Trainable>(adapter: &A) -> usize {
    if adapter.is_frozen() {
        0
    } else {
        adapter.num_parameters()
    }
}

/// Parameter count with a K/M/B suffix, e.g. `9.18M`.
#[must_use]
pub fn format_parameter_count(count: usize) -> String {
    const UNITS: [(f64, &str); 3] = [(1e9, "B"), (1e6, "M"), (1e3, "K")];
    let value = count as f64;
    UNITS
        .iter()
        .find(|(scale, _)| value >= *scale)
        .map_or_else(|| count.to_string(), |(scale, unit)| format!("{:.2}{unit}", value / scale))
}

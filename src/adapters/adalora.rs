//! AdaLoRA: low-rank updates in SVD form whose rank shrinks during training.
//!
//! Each layer learns `ΔW = P Λ Q` with a diagonal `Λ`. Pruning a rank means
//! zeroing its singular value, so the parameters keep their shape and only
//! the mask changes. Which ranks survive is decided across all layers by
//! [`crate::adapters::rank_allocator`], following a schedule of
//! `tinit` warmup steps, a cubic budget decay, and `tfinal` steps at the
//! target budget.
//!
//! Reference: <https://arxiv.org/abs/2303.10512>

#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Added to the rank in the scaling denominator.
const RANKNUM_EPS: f64 = 1e-5;

/// Configuration for AdaLoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaLoraConfig {
    /// Average rank per layer once the budget is spent.
    pub target_r: usize,

    /// Rank every layer starts with.
    pub init_r: usize,

    /// Scaling numerator.
    pub alpha: usize,

    /// Dropout probability applied to the adapter input.
    #[serde(default)]
    pub dropout: f64,

    /// Warmup steps before any rank is pruned.
    #[serde(default)]
    pub tinit: usize,

    /// Steps at the end that keep the final rank pattern fixed.
    #[serde(default)]
    pub tfinal: usize,

    /// Steps between two maskings.
    #[serde(default = "default_delta_t")]
    pub delta_t: usize,

    /// EMA factor of the smoothed sensitivity.
    #[serde(default = "default_beta")]
    pub beta1: f64,

    /// EMA factor of the sensitivity uncertainty.
    #[serde(default = "default_beta")]
    pub beta2: f64,

    /// Weight of the orthogonality penalty on `P` and `Q`.
    #[serde(default = "default_orth_reg")]
    pub orth_reg_weight: f64,

    /// Length of the training run; the schedule depends on it.
    pub total_step: usize,

    /// Kept ranks per module, recorded by the rank allocator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_pattern: Option<BTreeMap<String, Vec<bool>>>,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_delta_t() -> usize {
    1
}

fn default_beta() -> f64 {
    0.85
}

fn default_orth_reg() -> f64 {
    0.5
}

impl Default for AdaLoraConfig {
    fn default() -> Self {
        Self {
            target_r: 8,
            init_r: 12,
            alpha: 16,
            dropout: 0.0,
            tinit: 0,
            tfinal: 0,
            delta_t: default_delta_t(),
            beta1: default_beta(),
            beta2: default_beta(),
            orth_reg_weight: default_orth_reg(),
            total_step: 1000,
            rank_pattern: None,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for AdaLoraConfig {
    const PEFT_TYPE: PeftType = PeftType::AdaLora;

    fn validate(&self) -> Result<()> {
        if self.target_r == 0 || self.target_r > self.init_r {
            return Err(PeftError::InvalidConfig(format!(
                "need 0 < target_r <= init_r, got target_r={} init_r={}",
                self.target_r, self.init_r
            )));
        }
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be positive".into()));
        }
        for (name, value) in [("dropout", self.dropout), ("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PeftError::InvalidConfig(format!("{name} {value} is outside [0, 1]")));
            }
        }
        let budgeting_end = self.total_step.saturating_sub(self.tfinal);
        if self.tinit >= budgeting_end {
            return Err(PeftError::InvalidConfig(format!(
                "no budgeting phase: tinit ({}) must be below total_step - tfinal ({budgeting_end})",
                self.tinit
            )));
        }
        if self.delta_t == 0 {
            return Err(PeftError::InvalidConfig("delta_t must be positive".into()));
        }
        self.base.validate()
    }

    fn base(&self) -> &BaseAdapterConfig {
        &self.base
    }
}

/// AdaLoRA layer using SVD-based parameterization.
///
/// Uses `W = W0 + P * Λ * Q` where:
/// - P: Left singular vectors `lora_B` (out_features × r)
/// - Λ: Diagonal singular values `lora_E` (r × 1)
/// - Q: Right singular vectors `lora_A` (r × in_features)
///
/// Ranks are pruned by zeroing entries of Λ.
pub struct AdaLoraLayer {
    /// Right singular vectors: [init_r, in_features]
    lora_a: Var,
    /// Singular values: [init_r, 1]
    lora_e: Var,
    /// Left singular vectors: [out_features, init_r]
    lora_b: Var,
    /// Kept ranks
    rank_mask: Vec<bool>,
    /// Configuration
    config: AdaLoraConfig,
    /// Input dimension
    in_features: usize,
    /// Output dimension
    out_features: usize,
    /// Whether gradients are disabled
    frozen: bool,
    /// Whether dropout is active
    training: bool,
}

impl AdaLoraLayer {
    /// Create a new AdaLoRA layer.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - AdaLoRA configuration
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if configuration is invalid or tensor initialization fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: AdaLoraConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let r = config.init_r;

        // E starts at zero so the adapter is a no-op until trained
        let lora_a = Tensor::randn(0.0f32, 0.02, (r, in_features), device)?;
        let lora_e = Tensor::zeros((r, 1), DType::F32, device)?;
        let lora_b = Tensor::randn(0.0f32, 0.02, (out_features, r), device)?;

        Ok(Self {
            lora_a: Var::from_tensor(&lora_a)?,
            lora_e: Var::from_tensor(&lora_e)?,
            lora_b: Var::from_tensor(&lora_b)?,
            rank_mask: vec![true; r],
            frozen: config.base.inference_mode,
            config,
            in_features,
            out_features,
            training: false,
        })
    }

    /// Get the current active rank.
    #[must_use]
    pub fn current_rank(&self) -> usize {
        self.rank_mask.iter().filter(|keep| **keep).count()
    }

    /// Get the target rank.
    #[must_use]
    pub fn target_rank(&self) -> usize {
        self.config.target_r
    }

    /// Get the initial rank.
    #[must_use]
    pub fn init_rank(&self) -> usize {
        self.config.init_r
    }

    /// Get the scaling factor `alpha / (r + eps)`.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.config.alpha as f64 / (self.config.init_r as f64 + RANKNUM_EPS)
    }

    /// Current keep-mask over the ranks.
    #[must_use]
    pub fn rank_mask(&self) -> &[bool] {
        &self.rank_mask
    }

    /// Singular values `[init_r, 1]`.
    #[must_use]
    pub fn singular_values(&self) -> &Tensor {
        self.lora_e.as_tensor()
    }

    /// Zero the singular values of pruned ranks.
    ///
    /// # Errors
    /// Returns error if the mask length differs from `init_r`.
    pub fn apply_rank_mask(&mut self, keep: &[bool]) -> Result<()> {
        if keep.len() != self.config.init_r {
            return Err(PeftError::DimensionMismatch {
                message: format!(
                    "rank mask has {} entries, layer has rank {}",
                    keep.len(),
                    self.config.init_r
                ),
            });
        }
        let device = self.lora_e.device();
        let mask: Vec<f32> = keep.iter().map(|k| if *k { 1.0 } else { 0.0 }).collect();
        let mask = Tensor::from_vec(mask, (self.config.init_r, 1), device)?
            .to_dtype(self.lora_e.dtype())?;
        let masked = self.lora_e.as_tensor().mul(&mask)?;
        self.lora_e.set(&masked)?;
        self.rank_mask = keep.to_vec();
        Ok(())
    }

    /// `‖A Aᵀ − I‖_F + ‖Bᵀ B − I‖_F`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn orthogonal_penalty(&self) -> Result<Tensor> {
        let a = self.lora_a.as_tensor();
        let b = self.lora_b.as_tensor();
        let eye = Tensor::eye(self.config.init_r, a.dtype(), a.device())?;

        let a_cov = a.matmul(&a.t()?)?;
        let a_loss = a_cov.sub(&eye)?.sqr()?.sum_all()?.sqrt()?;

        let b_cov = b.t()?.matmul(b)?;
        let b_loss = b_cov.sub(&eye)?.sqr()?.sum_all()?.sqrt()?;

        Ok(a_loss.add(&b_loss)?)
    }

    /// `ΔW = B (A ⊙ E) * scaling`, shape `[out_features, in_features]`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let ae = self.lora_a.as_tensor().broadcast_mul(self.lora_e.as_tensor())?;
        let delta = self.lora_b.as_tensor().matmul(&ae)?;
        Ok(delta.affine(self.scaling(), 0.0)?)
    }
}

impl Adapter for AdaLoraLayer {
    type Config = AdaLoraConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let result = base.forward(input)?;

        let x = if self.training && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(input, self.config.dropout as f32)?
        } else {
            input.clone()
        };
        // x @ (A ⊙ E)^T @ B^T * scaling
        let ae = self.lora_a.as_tensor().broadcast_mul(self.lora_e.as_tensor())?;
        let out = x.broadcast_matmul(&ae.t()?)?;
        let out = out.broadcast_matmul(&self.lora_b.as_tensor().t()?)?;
        let out = out.affine(self.scaling(), 0.0)?;

        Ok(result.broadcast_add(&out)?)
    }

    fn num_parameters(&self) -> usize {
        // A: init_r × in_features, E: init_r, B: out_features × init_r
        self.config.init_r * self.in_features
            + self.config.init_r
            + self.out_features * self.config.init_r
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for AdaLoraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.broadcast_add(&delta_w)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.broadcast_sub(&delta_w)?)
    }
}

impl Trainable for AdaLoraLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![
            ("lora_A".to_string(), self.lora_a.clone()),
            ("lora_E".to_string(), self.lora_e.clone()),
            ("lora_B".to_string(), self.lora_b.clone()),
        ]
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn unfreeze(&mut self) {
        self.frozen = false;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

impl BuildAdapter for AdaLoraLayer {
    fn build(
        in_features: usize,
        out_features: usize,
        config: &AdaLoraConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, out_features, config.clone(), device)
    }
}

impl SaveLoad for AdaLoraLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("lora_A".to_string(), self.lora_a.as_tensor().clone());
        state_dict.insert("lora_E".to_string(), self.lora_e.as_tensor().clone());
        state_dict.insert("lora_B".to_string(), self.lora_b.as_tensor().clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.lora_a, &state_dict, "lora_A")?;
        assign_var(&self.lora_e, &state_dict, "lora_E")?;
        assign_var(&self.lora_b, &state_dict, "lora_B")?;
        let values: Vec<f32> = self
            .lora_e
            .as_tensor()
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        // An all-zero E is an untrained adapter, not one pruned to rank 0.
        self.rank_mask = if values.iter().all(|v| *v == 0.0) {
            vec![true; values.len()]
        } else {
            values.iter().map(|v| *v != 0.0).collect()
        };
        Ok(())
    }
}

//! Low-rank adaptation (LoRA).
//!
//! The weight update is the product of a down projection `A` (`r × in`) and an
//! up projection `B` (`out × r`), scaled by `alpha / r`. `B` starts at zero so
//! a new adapter leaves the layer unchanged.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator (`alpha / r`, or `alpha / sqrt(r)` with rsLoRA).
    pub alpha: usize,

    /// Dropout probability applied to the LoRA input.
    #[serde(default)]
    pub dropout: f64,

    /// Use rank-stabilized scaling `alpha / sqrt(r)`.
    #[serde(default)]
    pub use_rslora: bool,

    /// Initialization of A and B.
    #[serde(default)]
    pub init_lora_weights: LoraInitialization,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

/// Initialization strategy for LoRA weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraInitialization {
    /// Standard: A ~ N(0, 1/in), B = 0
    #[default]
    Standard,
    /// Gaussian: A ~ N(0, 1/r²), B = 0
    Gaussian,
    /// Both A and B random. The adapter is not a no-op at initialization.
    Random,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 16,
            dropout: 0.0,
            use_rslora: false,
            init_lora_weights: LoraInitialization::Standard,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl LoraConfig {
    /// Effective scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        if self.use_rslora {
            self.alpha as f64 / (self.r as f64).sqrt()
        } else {
            self.alpha as f64 / self.r as f64
        }
    }
}

impl AdapterConfig for LoraConfig {
    const PEFT_TYPE: PeftType = PeftType::Lora;

    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("rank must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(PeftError::InvalidConfig("alpha must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(PeftError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        self.base.validate()
    }

    fn base(&self) -> &BaseAdapterConfig {
        &self.base
    }
}

/// LoRA layer implementing low-rank adaptation.
///
/// Computes: `output = base(x) + (dropout(x) @ A^T @ B^T) * scaling`
pub struct LoraLayer {
    /// Down projection: in_features → r
    lora_a: Var,
    /// Up projection: r → out_features
    lora_b: Var,
    /// Scaling factor
    scaling: f64,
    /// Configuration
    config: LoraConfig,
    /// Input dimension
    in_features: usize,
    /// Output dimension
    out_features: usize,
    /// Whether gradients are disabled
    frozen: bool,
    /// Whether dropout is active
    training: bool,
}

impl LoraLayer {
    /// Create a new LoRA layer.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - LoRA configuration
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if configuration is invalid or weight initialization fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: LoraConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let r = config.r;

        let a_weight = match config.init_lora_weights {
            LoraInitialization::Gaussian => {
                Tensor::randn(0.0f32, 1.0 / r as f32, (r, in_features), device)?
            }
            LoraInitialization::Standard | LoraInitialization::Random => {
                let std = (1.0 / in_features as f64).sqrt();
                Tensor::randn(0.0f32, std as f32, (r, in_features), device)?
            }
        };
        let b_weight = match config.init_lora_weights {
            LoraInitialization::Random => {
                let std = (1.0 / r as f64).sqrt();
                Tensor::randn(0.0f32, std as f32, (out_features, r), device)?
            }
            _ => Tensor::zeros((out_features, r), DType::F32, device)?,
        };

        Ok(Self {
            lora_a: Var::from_tensor(&a_weight)?,
            lora_b: Var::from_tensor(&b_weight)?,
            scaling: config.scaling(),
            frozen: config.base.inference_mode,
            config,
            in_features,
            out_features,
            training: false,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// `ΔW = B A * scaling`, shape `[out_features, in_features]`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let delta = self.lora_b.as_tensor().matmul(self.lora_a.as_tensor())?;
        Ok(delta.affine(self.scaling, 0.0)?)
    }
}

impl Adapter for LoraLayer {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let result = base.forward(input)?;

        let x = if self.training && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(input, self.config.dropout as f32)?
        } else {
            input.clone()
        };
        // x @ A^T @ B^T * scaling
        let lora_out = x.broadcast_matmul(&self.lora_a.as_tensor().t()?)?;
        let lora_out = lora_out.broadcast_matmul(&self.lora_b.as_tensor().t()?)?;
        let lora_out = lora_out.affine(self.scaling, 0.0)?;

        Ok(result.broadcast_add(&lora_out)?)
    }

    fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for LoraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.broadcast_add(&delta_w)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.broadcast_sub(&delta_w)?)
    }
}

impl Trainable for LoraLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![
            ("lora_A.weight".to_string(), self.lora_a.clone()),
            ("lora_B.weight".to_string(), self.lora_b.clone()),
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

impl BuildAdapter for LoraLayer {
    fn build(
        in_features: usize,
        out_features: usize,
        config: &LoraConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, out_features, config.clone(), device)
    }
}

impl SaveLoad for LoraLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("lora_A.weight".to_string(), self.lora_a.as_tensor().clone());
        state_dict.insert("lora_B.weight".to_string(), self.lora_b.as_tensor().clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.lora_a, &state_dict, "lora_A.weight")?;
        assign_var(&self.lora_b, &state_dict, "lora_B.weight")?;
        Ok(())
    }
}

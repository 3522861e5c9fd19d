//! MiSS (Matrix Shard Sharing) implementation.
//!
//! MiSS trains one small block that is shared by every chunk of the input
//! dimension. The default variant adds `Σ_chunks x_c · B` to the base output;
//! `mini` shares a narrower block along the output as well; `bat` adds
//! `W_ab · B_a + B_a` to each `r×r` block of the weight.
//!
//! Reference: <https://arxiv.org/abs/2409.15371>

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::linalg::invert;
use crate::traits::{linear_with_weight, Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Which MiSS variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissInit {
    /// Shared `[r, out]` block added to every input chunk.
    #[default]
    Default,
    /// Block-wise affine transform of the weight.
    Bat,
    /// Shared `[r, mini_r]` block tiled along the output.
    Mini,
}

/// Configuration for MiSS adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissConfig {
    /// Shard size along the input dimension.
    pub r: usize,

    /// Output width of the shared block in the `mini` variant.
    #[serde(default = "default_mini_r")]
    pub mini_r: usize,

    /// Dropout applied to the input of the shared block.
    #[serde(default)]
    pub dropout: f64,

    /// Variant and initialization.
    #[serde(default)]
    pub init_weights: MissInit,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_mini_r() -> usize {
    1
}

impl Default for MissConfig {
    fn default() -> Self {
        Self {
            r: 64,
            mini_r: default_mini_r(),
            dropout: 0.0,
            init_weights: MissInit::Default,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for MissConfig {
    const PEFT_TYPE: PeftType = PeftType::Miss;

    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("r must be > 0".into()));
        }
        if self.init_weights == MissInit::Mini && self.mini_r == 0 {
            return Err(PeftError::InvalidConfig("mini_r must be > 0".into()));
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

/// MiSS layer.
pub struct MissLayer {
    /// `[r, out]`, `[r, mini_r]` or `[out / r, r, r]` depending on the variant.
    /// Zero means no change in every variant.
    miss_block: Var,
    config: MissConfig,
    in_features: usize,
    out_features: usize,
    frozen: bool,
    training: bool,
}

impl MissLayer {
    /// Create a new MiSS layer with a zero block.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the variant does not
    /// fit the layer dimensions.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: MissConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let r = config.r;

        let block = match config.init_weights {
            MissInit::Default => Tensor::zeros((r, out_features), DType::F32, device)?,
            MissInit::Mini => {
                if out_features % config.mini_r != 0 {
                    return Err(PeftError::InvalidConfig(format!(
                        "out_features ({out_features}) must be divisible by mini_r ({})",
                        config.mini_r
                    )));
                }
                Tensor::zeros((r, config.mini_r), DType::F32, device)?
            }
            MissInit::Bat => {
                if in_features % r != 0 || out_features % r != 0 {
                    return Err(PeftError::InvalidConfig(format!(
                        "bat needs in_features ({in_features}) and out_features \
                         ({out_features}) divisible by r ({r})"
                    )));
                }
                Tensor::zeros((out_features / r, r, r), DType::F32, device)?
            }
        };

        Ok(Self {
            miss_block: Var::from_tensor(&block)?,
            frozen: config.base.inference_mode,
            config,
            in_features,
            out_features,
            training: false,
        })
    }

    /// The variant of this layer.
    #[must_use]
    pub fn variant(&self) -> MissInit {
        self.config.init_weights
    }

    /// Shared block spanning the full output, shape `[r, out_features]`.
    fn shared_block(&self) -> Result<Tensor> {
        let block = self.miss_block.as_tensor();
        match self.config.init_weights {
            MissInit::Mini => Ok(block.repeat((1, self.out_features / self.config.mini_r))?),
            _ => Ok(block.clone()),
        }
    }

    /// Additive update `ΔW` (`[out, in]`) of the default and mini variants.
    ///
    /// Column `j` of `ΔW` is row `j mod r` of the shared block.
    fn delta_weight(&self) -> Result<Tensor> {
        let r = self.config.r;
        let chunks = self.in_features.div_ceil(r);
        let tiled = self.shared_block()?.repeat((chunks, 1))?;
        Ok(tiled.narrow(0, 0, self.in_features)?.t()?.contiguous()?)
    }

    /// Split `weight` into `[in/r, out/r, r, r]` blocks, `[b, a] = W_ab`.
    fn weight_blocks(&self, weight: &Tensor) -> Result<Tensor> {
        let r = self.config.r;
        Ok(weight
            .reshape((self.out_features / r, r, self.in_features / r, r))?
            .permute((2, 0, 1, 3))?
            .contiguous()?)
    }

    fn from_weight_blocks(&self, blocks: &Tensor) -> Result<Tensor> {
        Ok(blocks
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .reshape((self.out_features, self.in_features))?)
    }
}

impl Adapter for MissLayer {
    type Config = MissConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        // Bat folds the base weight into the adapted weight, so input
        // dropout would also hit the frozen path; it is not applied.
        if self.config.init_weights == MissInit::Bat {
            let weight = self.merge(base.weight())?;
            return linear_with_weight(input, &weight, base);
        }

        let result = base.forward(input)?;
        let x = if self.training && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(input, self.config.dropout as f32)?
        } else {
            input.clone()
        };

        let r = self.config.r;
        let padding = (r - self.in_features % r) % r;
        let x = if padding > 0 {
            x.pad_with_zeros(D::Minus1, 0, padding)?
        } else {
            x
        };
        let features = x.dim(D::Minus1)?;
        let mut shape = x.dims().to_vec();
        shape.pop();
        shape.extend([features / r, r]);
        let summed = x.reshape(shape)?.sum(D::Minus2)?;

        let block = self.shared_block()?.to_dtype(summed.dtype())?;
        Ok(result.add(&summed.broadcast_matmul(&block)?)?)
    }

    fn num_parameters(&self) -> usize {
        self.miss_block.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for MissLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let block = self.miss_block.as_tensor().to_dtype(base_weight.dtype())?;
        if self.config.init_weights == MissInit::Bat {
            // W_ab + W_ab @ B_a + B_a
            let blocks = self.weight_blocks(base_weight)?;
            let updated = blocks
                .add(&blocks.broadcast_matmul(&block)?)?
                .broadcast_add(&block)?;
            return self.from_weight_blocks(&updated);
        }
        Ok(base_weight.add(&self.delta_weight()?.to_dtype(base_weight.dtype())?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        if self.config.init_weights == MissInit::Bat {
            // W_ab = (W'_ab - B_a) @ (I + B_a)^-1
            let dtype = merged_weight.dtype();
            let block = self.miss_block.as_tensor();
            let r = self.config.r;
            let eye = Tensor::eye(r, block.dtype(), block.device())?;
            let inverses = (0..self.out_features / r)
                .map(|a| invert(&eye.add(&block.get(a)?)?))
                .collect::<Result<Vec<_>>>()?;
            let inverses = Tensor::stack(&inverses, 0)?.to_dtype(dtype)?;
            let blocks = self.weight_blocks(merged_weight)?;
            let restored = blocks
                .broadcast_sub(&block.to_dtype(dtype)?)?
                .broadcast_matmul(&inverses)?;
            return self.from_weight_blocks(&restored);
        }
        Ok(merged_weight.sub(&self.delta_weight()?.to_dtype(merged_weight.dtype())?)?)
    }
}

impl Trainable for MissLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![("miss_block".to_string(), self.miss_block.clone())]
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

impl BuildAdapter for MissLayer {
    fn build(
        in_features: usize,
        out_features: usize,
        config: &MissConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, out_features, config.clone(), device)
    }
}

impl SaveLoad for MissLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "miss_block".to_string(),
            self.miss_block.as_tensor().clone(),
        )]))
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.miss_block, &state_dict, "miss_block")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::max_abs_diff;

    fn base_linear(in_features: usize, out_features: usize) -> Linear {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (out_features, in_features), &device).unwrap();
        let bias = Tensor::randn(0f32, 1.0, out_features, &device).unwrap();
        Linear::new(weight, Some(bias))
    }

    fn config(r: usize, init: MissInit) -> MissConfig {
        MissConfig {
            r,
            mini_r: 2,
            init_weights: init,
            ..Default::default()
        }
    }

    fn randomize(layer: &MissLayer, std: f32) -> Result<()> {
        let shape = layer.miss_block.shape().clone();
        let values = Tensor::randn(0f32, std, shape, &Device::Cpu)?;
        layer.miss_block.set(&values)?;
        Ok(())
    }

    #[test]
    fn test_miss_config_serde() -> Result<()> {
        let json = r#"{"r": 4, "init_weights": "bat", "target_modules": ["q_proj"]}"#;
        let config: MissConfig = serde_json::from_str(json)?;
        assert_eq!(config.init_weights, MissInit::Bat);
        assert_eq!(config.mini_r, 1);
        assert!(config.validate().is_ok());
        Ok(())
    }

    #[test]
    fn test_miss_identity_at_init() -> Result<()> {
        let device = Device::Cpu;
        let base = base_linear(8, 4);
        let input = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
        for init in [MissInit::Default, MissInit::Mini, MissInit::Bat] {
            let layer = MissLayer::new(8, 4, config(2, init), &device)?;
            let output = layer.forward(&input, &base)?;
            assert!(max_abs_diff(&output, &base.forward(&input)?)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_miss_delta_columns_repeat_block_rows() -> Result<()> {
        let device = Device::Cpu;
        let layer = MissLayer::new(5, 3, config(2, MissInit::Default), &device)?;
        let block = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device)?;
        layer.miss_block.set(&block)?;
        let delta: Vec<Vec<f32>> = layer.delta_weight()?.to_vec2()?;
        assert_eq!(
            delta,
            vec![
                vec![1.0, 4.0, 1.0, 4.0, 1.0],
                vec![2.0, 5.0, 2.0, 5.0, 2.0],
                vec![3.0, 6.0, 3.0, 6.0, 3.0],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_miss_forward_matches_merge_with_padding() -> Result<()> {
        let device = Device::Cpu;
        let base = base_linear(7, 4);
        let input = Tensor::randn(0f32, 1.0, (2, 3, 7), &device)?;
        for init in [MissInit::Default, MissInit::Mini] {
            let layer = MissLayer::new(7, 4, config(3, init), &device)?;
            randomize(&layer, 0.5)?;
            let merged = layer.merge(base.weight())?;
            let merged_layer = Linear::new(merged.clone(), base.bias().cloned());
            let expected = layer.forward(&input, &base)?;
            assert!(max_abs_diff(&expected, &merged_layer.forward(&input)?)? < 1e-4);
            assert!(max_abs_diff(&layer.unmerge(&merged)?, base.weight())? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_miss_bat_merge_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let layer = MissLayer::new(8, 4, config(2, MissInit::Bat), &device)?;
        randomize(&layer, 0.1)?;
        let base = base_linear(8, 4);

        let merged = layer.merge(base.weight())?;
        let block = layer.miss_block.as_tensor().get(1)?;
        let w_12 = base.weight().narrow(0, 2, 2)?.narrow(1, 4, 2)?;
        let expected = w_12.add(&w_12.matmul(&block)?)?.add(&block)?;
        let actual = merged.narrow(0, 2, 2)?.narrow(1, 4, 2)?;
        assert!(max_abs_diff(&expected, &actual)? < 1e-5);

        let unmerged = layer.unmerge(&merged)?;
        assert!(max_abs_diff(&unmerged, base.weight())? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_miss_bat_forward_ignores_dropout() -> Result<()> {
        let device = Device::Cpu;
        let bat = MissConfig {
            dropout: 0.5,
            ..config(2, MissInit::Bat)
        };
        let mut layer = MissLayer::new(8, 4, bat, &device)?;
        randomize(&layer, 0.1)?;
        let base = base_linear(8, 4);
        let input = Tensor::randn(0f32, 1.0, (3, 8), &device)?;

        let eval = layer.forward(&input, &base)?;
        layer.set_training(true);
        assert!(max_abs_diff(&layer.forward(&input, &base)?, &eval)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_miss_dimension_checks() {
        let device = Device::Cpu;
        assert!(MissLayer::new(7, 4, config(2, MissInit::Bat), &device).is_err());
        assert!(MissLayer::new(8, 5, config(2, MissInit::Mini), &device).is_err());
        assert!(MissLayer::new(7, 5, config(2, MissInit::Default), &device).is_ok());
    }

    #[test]
    fn test_miss_num_parameters() -> Result<()> {
        let device = Device::Cpu;
        assert_eq!(
            MissLayer::new(16, 8, config(4, MissInit::Default), &device)?.num_parameters(),
            32
        );
        assert_eq!(
            MissLayer::new(16, 8, config(4, MissInit::Mini), &device)?.num_parameters(),
            8
        );
        assert_eq!(
            MissLayer::new(16, 8, config(4, MissInit::Bat), &device)?.num_parameters(),
            32
        );
        Ok(())
    }
}

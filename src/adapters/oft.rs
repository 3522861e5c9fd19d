//! OFT (Orthogonal Fine-Tuning) implementation.
//!
//! OFT applies orthogonal transformations to preserve the pretrained knowledge
//! while adapting models. It uses block-diagonal orthogonal matrices to
//! transform weights efficiently.
//!
//! Reference: <https://arxiv.org/abs/2306.07280>

#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::linalg::{apply_blockwise, block_diag, cayley, skew_symmetric};
use crate::traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Configuration for OFT adapters.
///
/// Exactly one of `r` and `oft_block_size` must be non-zero; the other is
/// derived from the input dimension of each targeted layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OftConfig {
    /// Number of OFT blocks (determines expressiveness vs efficiency).
    #[serde(default)]
    pub r: usize,

    /// Size of each OFT block.
    #[serde(default)]
    pub oft_block_size: usize,

    /// Whether to use constrained OFT (COFT), which keeps each block within
    /// `eps` of the identity rotation.
    #[serde(default)]
    pub coft: bool,

    /// Radius of the COFT constraint.
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Share one block across the whole layer.
    #[serde(default)]
    pub block_share: bool,

    /// Whether to use exact Cayley transform computation.
    ///
    /// When `false` (default), uses a Neumann series approximation `(I + Q)^{-1} ≈ I - Q + Q^2`
    /// which is efficient but less accurate for larger Q values.
    ///
    /// When `true`, computes the exact inverse using Newton-Schulz iteration,
    /// providing higher accuracy at the cost of additional computation.
    #[serde(default)]
    pub use_exact_cayley: bool,

    /// Start from the identity rotation. When `false` the blocks are random.
    #[serde(default = "default_true")]
    pub init_weights: bool,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_eps() -> f64 {
    6e-5
}

fn default_true() -> bool {
    true
}

impl Default for OftConfig {
    fn default() -> Self {
        Self {
            r: 8,
            oft_block_size: 0,
            coft: false,
            eps: default_eps(),
            block_share: false,
            use_exact_cayley: false,
            init_weights: true,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl OftConfig {
    /// `(num_blocks, block_size)` for a layer with `in_features` inputs.
    ///
    /// # Errors
    /// Returns an error if `in_features` cannot be split into equal blocks.
    pub fn blocks_for(&self, in_features: usize) -> Result<(usize, usize)> {
        let (num_blocks, block_size) = if self.r > 0 {
            if in_features % self.r != 0 {
                return Err(PeftError::InvalidConfig(format!(
                    "in_features ({in_features}) must be divisible by r ({})",
                    self.r
                )));
            }
            (self.r, in_features / self.r)
        } else {
            if in_features % self.oft_block_size != 0 {
                return Err(PeftError::InvalidConfig(format!(
                    "in_features ({in_features}) must be divisible by oft_block_size ({})",
                    self.oft_block_size
                )));
            }
            (in_features / self.oft_block_size, self.oft_block_size)
        };
        Ok((num_blocks, block_size))
    }
}

impl AdapterConfig for OftConfig {
    const PEFT_TYPE: PeftType = PeftType::Oft;

    fn validate(&self) -> Result<()> {
        if (self.r == 0) == (self.oft_block_size == 0) {
            return Err(PeftError::InvalidConfig(format!(
                "exactly one of r ({}) and oft_block_size ({}) must be non-zero",
                self.r, self.oft_block_size
            )));
        }
        if self.eps <= 0.0 {
            return Err(PeftError::InvalidConfig("eps must be > 0".into()));
        }
        self.base.validate()
    }

    fn base(&self) -> &BaseAdapterConfig {
        &self.base
    }
}

/// OFT layer implementing Orthogonal Fine-Tuning.
///
/// Uses block-diagonal orthogonal matrices to transform weights:
/// `W' = W @ R` where R is a block-diagonal orthogonal matrix.
///
/// The orthogonal matrix R is parameterized via Cayley transform:
/// `R = (I - Q) @ (I + Q)^{-1}` where Q is skew-symmetric.
pub struct OftLayer {
    /// Parameters of the skew-symmetric blocks.
    /// Shape: [num_blocks, block_size, block_size], or [1, ..] when shared
    oft_r: Var,
    /// Configuration
    config: OftConfig,
    /// Size of each block
    block_size: usize,
    /// Number of blocks covering the input
    num_blocks: usize,
    /// Whether gradients are disabled
    frozen: bool,
}

impl OftLayer {
    /// Create a new OFT layer.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension of the wrapped layer
    /// * `config` - OFT configuration
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or does not fit `in_features`.
    pub fn new(in_features: usize, config: OftConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let (num_blocks, block_size) = config.blocks_for(in_features)?;
        let stored_blocks = if config.block_share { 1 } else { num_blocks };
        let shape = (stored_blocks, block_size, block_size);

        let oft_r = if config.init_weights {
            Tensor::zeros(shape, DType::F32, device)?
        } else {
            Tensor::randn(0.0f32, 0.1, shape, device)?
        };

        Ok(Self {
            oft_r: Var::from_tensor(&oft_r)?,
            frozen: config.base.inference_mode,
            config,
            block_size,
            num_blocks,
        })
    }

    /// Get the number of blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Get the block size.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Block parameters, projected onto the COFT ball when enabled.
    fn constrained_r(&self) -> Result<Tensor> {
        let r = self.oft_r.as_tensor();
        if !self.config.coft {
            return Ok(r.clone());
        }
        let radius = self.config.eps / (self.num_blocks as f64).sqrt();
        let norm = r.sqr()?.sum_keepdim(2)?.sum_keepdim(1)?.sqrt()?;
        let scale = norm.maximum(radius)?.recip()?.affine(radius, 0.0)?;
        Ok(r.broadcast_mul(&scale)?)
    }

    /// Orthogonal blocks `[num_blocks, block_size, block_size]`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn orthogonal_blocks(&self) -> Result<Tensor> {
        let q = skew_symmetric(&self.constrained_r()?)?;
        let blocks = cayley(&q, self.config.use_exact_cayley)?;
        if self.config.block_share {
            Ok(blocks
                .broadcast_as((self.num_blocks, self.block_size, self.block_size))?
                .contiguous()?)
        } else {
            Ok(blocks)
        }
    }

    /// Full rotation `blockdiag(O)`, shape `[in_features, in_features]`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn rotation(&self) -> Result<Tensor> {
        block_diag(&self.orthogonal_blocks()?)
    }
}

impl Adapter for OftLayer {
    type Config = OftConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let rotated = apply_blockwise(input, &self.orthogonal_blocks()?)?;
        Ok(base.forward(&rotated)?)
    }

    fn num_parameters(&self) -> usize {
        self.oft_r.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for OftLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        // W' = W @ R
        let rotation = self.rotation()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.matmul(&rotation)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        // W = W' @ R^T (R is orthogonal, so R^{-1} = R^T)
        let rotation = self.rotation()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.matmul(&rotation.t()?)?)
    }
}

impl Trainable for OftLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![("oft_r".to_string(), self.oft_r.clone())]
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

    fn set_training(&mut self, _training: bool) {}
}

impl BuildAdapter for OftLayer {
    fn build(
        in_features: usize,
        _out_features: usize,
        config: &OftConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, config.clone(), device)
    }
}

impl SaveLoad for OftLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "oft_r".to_string(),
            self.oft_r.as_tensor().clone(),
        )]))
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.oft_r, &state_dict, "oft_r")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::max_abs_diff;

    fn random_config(r: usize) -> OftConfig {
        OftConfig {
            r,
            init_weights: false,
            ..Default::default()
        }
    }

    fn base_linear(in_features: usize, out_features: usize) -> Linear {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (out_features, in_features), &device).unwrap();
        let bias = Tensor::randn(0f32, 1.0, out_features, &device).unwrap();
        Linear::new(weight, Some(bias))
    }

    #[test]
    fn test_oft_config_default() {
        let config = OftConfig::default();
        assert_eq!(config.r, 8);
        assert!(!config.coft);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oft_config_requires_exactly_one_size() {
        let neither = OftConfig {
            r: 0,
            ..Default::default()
        };
        assert!(neither.validate().is_err());

        let both = OftConfig {
            oft_block_size: 4,
            ..Default::default()
        };
        assert!(both.validate().is_err());

        let block_size_only = OftConfig {
            r: 0,
            oft_block_size: 4,
            ..Default::default()
        };
        assert!(block_size_only.validate().is_ok());
        assert_eq!(block_size_only.blocks_for(16).unwrap(), (4, 4));
    }

    #[test]
    fn test_oft_layer_creation() {
        let device = Device::Cpu;
        // 64 is divisible by 8
        let layer = OftLayer::new(64, OftConfig::default(), &device).unwrap();
        assert_eq!(layer.num_blocks(), 8);
        assert_eq!(layer.block_size(), 8);
    }

    #[test]
    fn test_oft_layer_invalid_dimensions() {
        let device = Device::Cpu;
        // 65 is not divisible by 8
        let layer = OftLayer::new(65, OftConfig::default(), &device);
        assert!(layer.is_err());
    }

    #[test]
    fn test_oft_identity_at_init() -> Result<()> {
        let device = Device::Cpu;
        let layer = OftLayer::new(16, OftConfig::default(), &device)?;
        let base = base_linear(16, 6);
        let input = Tensor::randn(0f32, 1.0, (2, 3, 16), &device)?;
        let output = layer.forward(&input, &base)?;
        assert!(max_abs_diff(&output, &base.forward(&input)?)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_oft_num_parameters() {
        let device = Device::Cpu;
        let layer = OftLayer::new(64, OftConfig::default(), &device).unwrap();
        // 8 blocks of 8x8 = 8 * 64 = 512
        assert_eq!(layer.num_parameters(), 512);

        let shared = OftConfig {
            block_share: true,
            ..Default::default()
        };
        let layer = OftLayer::new(64, shared, &device).unwrap();
        assert_eq!(layer.num_parameters(), 64);
    }

    #[test]
    fn test_oft_blocks_are_orthogonal() -> Result<()> {
        let device = Device::Cpu;
        let config = OftConfig {
            use_exact_cayley: true,
            ..random_config(4)
        };
        let layer = OftLayer::new(16, config, &device)?;
        let rotation = layer.rotation()?;
        let product = rotation.matmul(&rotation.t()?)?;
        let eye = Tensor::eye(16, DType::F32, &device)?;
        assert!(max_abs_diff(&product, &eye)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_oft_merge_matches_forward() -> Result<()> {
        let device = Device::Cpu;
        let config = OftConfig {
            use_exact_cayley: true,
            ..random_config(4)
        };
        let layer = OftLayer::new(16, config, &device)?;
        let base = base_linear(16, 8);
        let input = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;

        let merged = layer.merge(base.weight())?;
        let merged_layer = Linear::new(merged.clone(), base.bias().cloned());
        let expected = layer.forward(&input, &base)?;
        assert!(max_abs_diff(&expected, &merged_layer.forward(&input)?)? < 1e-4);

        let unmerged = layer.unmerge(&merged)?;
        assert!(max_abs_diff(&unmerged, base.weight())? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_oft_block_share_repeats_block() -> Result<()> {
        let device = Device::Cpu;
        let config = OftConfig {
            block_share: true,
            ..random_config(4)
        };
        let layer = OftLayer::new(16, config, &device)?;
        let blocks = layer.orthogonal_blocks()?;
        assert_eq!(blocks.dims(), &[4, 4, 4]);
        assert!(max_abs_diff(&blocks.get(0)?, &blocks.get(3)?)? < 1e-7);
        Ok(())
    }

    #[test]
    fn test_oft_coft_limits_rotation() -> Result<()> {
        let device = Device::Cpu;
        let config = OftConfig {
            coft: true,
            eps: 1e-3,
            ..random_config(2)
        };
        let layer = OftLayer::new(8, config, &device)?;
        let rotation = layer.rotation()?;
        let eye = Tensor::eye(8, DType::F32, &device)?;
        assert!(max_abs_diff(&rotation, &eye)? < 1e-2);
        Ok(())
    }

    #[test]
    fn test_oft_freeze_unfreeze() {
        let device = Device::Cpu;
        let mut layer = OftLayer::new(64, OftConfig::default(), &device).unwrap();

        assert!(!layer.is_frozen());
        layer.freeze();
        assert!(layer.is_frozen());
        assert!(layer.trainable_vars().is_empty());
        layer.unfreeze();
        assert!(!layer.is_frozen());
    }

    #[test]
    fn test_oft_approx_vs_exact_cayley() -> Result<()> {
        // Small rotations agree between both inverses
        let device = Device::Cpu;
        let approx = OftLayer::new(16, random_config(4), &device)?;
        let mut exact = OftLayer::new(
            16,
            OftConfig {
                use_exact_cayley: true,
                ..random_config(4)
            },
            &device,
        )?;
        let small = approx.oft_r.as_tensor().affine(0.1, 0.0)?;
        approx.oft_r.set(&small)?;
        exact.load_state_dict(approx.state_dict()?)?;
        assert!(max_abs_diff(&approx.rotation()?, &exact.rotation()?)? < 1e-3);
        Ok(())
    }
}

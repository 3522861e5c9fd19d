//! Butterfly orthogonal fine-tuning (BOFT).
//!
//! The input is rotated by a product of sparse orthogonal factors before the
//! frozen layer is applied, and each output is rescaled by a learned factor.
//! Every factor is block diagonal up to a fixed butterfly permutation, so `m`
//! factors mix information across `block_size * 2^(m-1)` features while each
//! only stores `block_num` small blocks.
//!
//! Reference: <https://arxiv.org/abs/2311.06243>

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::linalg::{block_diag, cayley, skew_symmetric};
use crate::traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Configuration for BOFT adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoftConfig {
    /// Features per orthogonal block. Zero derives it from `boft_block_num`.
    #[serde(default)]
    pub boft_block_size: usize,

    /// Orthogonal blocks per factor. Zero derives it from `boft_block_size`.
    #[serde(default = "default_boft_block_num")]
    pub boft_block_num: usize,

    /// Number of butterfly factors; 1 is plain block-diagonal OFT.
    /// The block count must be divisible by `2^(factors - 1)`.
    #[serde(default = "default_boft_n_butterfly_factor")]
    pub boft_n_butterfly_factor: usize,

    /// Fraction of blocks replaced by the identity during training.
    #[serde(default)]
    pub boft_dropout: f64,

    /// Start from the identity rotation. When `false` the blocks are random.
    #[serde(default = "default_true")]
    pub init_weights: bool,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_boft_block_num() -> usize {
    4
}

fn default_boft_n_butterfly_factor() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for BoftConfig {
    fn default() -> Self {
        Self {
            boft_block_size: 0,
            boft_block_num: default_boft_block_num(),
            boft_n_butterfly_factor: default_boft_n_butterfly_factor(),
            boft_dropout: 0.0,
            init_weights: true,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl BoftConfig {
    /// `(block_size, block_num)` for a layer with `in_features` inputs.
    ///
    /// # Errors
    /// Returns an error if the blocks do not tile the input or cannot be
    /// paired up by every butterfly factor.
    pub fn butterfly_dims(&self, in_features: usize) -> Result<(usize, usize)> {
        let (fixed, name) = if self.boft_block_size > 0 {
            (self.boft_block_size, "boft_block_size")
        } else {
            (self.boft_block_num, "boft_block_num")
        };
        if fixed == 0 || in_features % fixed != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "{name} ({fixed}) does not divide in_features ({in_features})"
            )));
        }
        let other = in_features / fixed;
        let (block_size, block_num) = if self.boft_block_size > 0 {
            (fixed, other)
        } else {
            (other, fixed)
        };

        let extra_factors = self.boft_n_butterfly_factor.saturating_sub(1);
        if extra_factors > 0 {
            let groups = 1usize << extra_factors;
            if block_num % groups != 0 {
                return Err(PeftError::InvalidConfig(format!(
                    "{} butterfly factors need a block count divisible by {groups}, got {block_num}",
                    self.boft_n_butterfly_factor
                )));
            }
            if block_size % 2 != 0 {
                return Err(PeftError::InvalidConfig(format!(
                    "butterfly factors need an even block size, got {block_size}"
                )));
            }
        }
        Ok((block_size, block_num))
    }
}

impl AdapterConfig for BoftConfig {
    const PEFT_TYPE: PeftType = PeftType::Boft;

    fn validate(&self) -> Result<()> {
        if (self.boft_block_size == 0) == (self.boft_block_num == 0) {
            return Err(PeftError::InvalidConfig(format!(
                "set exactly one of boft_block_size ({}) and boft_block_num ({})",
                self.boft_block_size, self.boft_block_num
            )));
        }
        if self.boft_n_butterfly_factor == 0 {
            return Err(PeftError::InvalidConfig(
                "boft_n_butterfly_factor must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.boft_dropout) {
            return Err(PeftError::InvalidConfig(format!(
                "boft_dropout {} is outside [0, 1]",
                self.boft_dropout
            )));
        }
        self.base.validate()
    }

    fn base(&self) -> &BaseAdapterConfig {
        &self.base
    }
}

/// BOFT layer implementing Butterfly Orthogonal Fine-Tuning.
///
/// The rotation is a product of butterfly factors `P_i @ BlockDiag(O_i) @ P_i^T`
/// where `P_i` is a permutation matrix and `O_i` are orthogonal blocks. The
/// adapted weight is `(W @ R^T) * boft_s`.
pub struct BoftLayer {
    /// Parameters of the skew-symmetric blocks.
    /// Shape: `[n_butterfly_factor + 1, block_num, block_size, block_size]`
    boft_r: Var,

    /// Scaling factors for output features.
    /// Shape: `[out_features, 1]`
    boft_s: Var,

    /// Precomputed permutation matrices for butterfly structure.
    /// Shape: `[n_butterfly_factor + 1, features, features]`
    boft_p: Tensor,

    /// Configuration
    config: BoftConfig,

    /// Size of each block
    block_size: usize,

    /// Number of blocks
    block_num: usize,

    /// Number of butterfly factors (config value - 1, for internal use)
    n_butterfly_factor: usize,

    /// Whether gradients are disabled
    frozen: bool,

    /// Whether block dropout is active
    training: bool,
}

impl BoftLayer {
    /// Create a new BOFT layer.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - BOFT configuration
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if configuration is invalid or tensor initialization fails.
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: BoftConfig,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let (block_size, block_num) = config.butterfly_dims(in_features)?;
        let n_butterfly_factor = config.boft_n_butterfly_factor - 1;

        let shape = (n_butterfly_factor + 1, block_num, block_size, block_size);
        let boft_r = if config.init_weights {
            Tensor::zeros(shape, DType::F32, device)?
        } else {
            Tensor::randn(0.0f32, 0.1, shape, device)?
        };
        let boft_s = Tensor::ones((out_features, 1), DType::F32, device)?;

        let boft_p = (0..=n_butterfly_factor)
            .map(|i| {
                let order = if n_butterfly_factor == 0 {
                    (0..in_features).collect()
                } else {
                    butterfly_permutation(in_features, block_num >> i, block_size / 2)?
                };
                permutation_matrix(&order, device)
            })
            .collect::<Result<Vec<_>>>()?;
        let boft_p = Tensor::stack(&boft_p, 0)?;

        Ok(Self {
            boft_r: Var::from_tensor(&boft_r)?,
            boft_s: Var::from_tensor(&boft_s)?,
            boft_p,
            frozen: config.base.inference_mode,
            config,
            block_size,
            block_num,
            n_butterfly_factor,
            training: false,
        })
    }

    /// Orthogonal blocks `[factors, block_num, block_size, block_size]`.
    fn orthogonal_blocks(&self) -> Result<Tensor> {
        let factors = self.n_butterfly_factor + 1;
        let q = skew_symmetric(self.boft_r.as_tensor())?.reshape((
            factors * self.block_num,
            self.block_size,
            self.block_size,
        ))?;
        let blocks = cayley(&q, true)?;
        Ok(blocks.reshape((factors, self.block_num, self.block_size, self.block_size))?)
    }

    /// Replace a random subset of the blocks of one random factor by the
    /// identity.
    fn drop_blocks(&self, blocks: &Tensor) -> Result<Tensor> {
        let factors = self.n_butterfly_factor + 1;
        let to_replace = (self.config.boft_dropout * self.block_num as f64) as usize;
        if to_replace == 0 {
            return Ok(blocks.clone());
        }
        let device = blocks.device();

        let draws: Vec<f32> = Tensor::rand(0f32, 1.0, self.block_num + 1, device)?.to_vec1()?;
        let factor = ((draws[0] * factors as f32) as usize).min(factors - 1);
        let mut order: Vec<usize> = (0..self.block_num).collect();
        order.sort_by(|a, b| draws[a + 1].total_cmp(&draws[b + 1]));

        let mut keep = vec![1f32; factors * self.block_num];
        for block in order.into_iter().take(to_replace) {
            keep[factor * self.block_num + block] = 0.0;
        }
        let keep = Tensor::from_vec(keep, (factors, self.block_num, 1, 1), device)?
            .to_dtype(blocks.dtype())?;
        let eye = Tensor::eye(self.block_size, blocks.dtype(), device)?;
        let replaced = eye.broadcast_mul(&keep.affine(-1.0, 1.0)?)?;
        Ok(blocks.broadcast_mul(&keep)?.add(&replaced)?)
    }

    /// Compute the full butterfly rotation `[in_features, in_features]`.
    ///
    /// Applies the butterfly factorization: product of `P @ BlockDiag @ P^T`
    /// across all butterfly factors, later factors on the left. Block
    /// dropout is never applied here, so merges are deterministic.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn rotation(&self) -> Result<Tensor> {
        self.rotation_with(false)
    }

    fn rotation_with(&self, dropout: bool) -> Result<Tensor> {
        let mut blocks = self.orthogonal_blocks()?;
        if dropout {
            blocks = self.drop_blocks(&blocks)?;
        }

        let mut result: Option<Tensor> = None;
        for factor_idx in 0..=self.n_butterfly_factor {
            let block_diag_mat = block_diag(&blocks.get(factor_idx)?)?;
            let perm = self.boft_p.get(factor_idx)?;
            let butterfly_mat = perm.matmul(&block_diag_mat.matmul(&perm.t()?)?)?;
            result = Some(match result {
                Some(acc) => butterfly_mat.matmul(&acc)?,
                None => butterfly_mat,
            });
        }
        result.ok_or_else(|| PeftError::InvalidConfig("BOFT layer has no butterfly factor".into()))
    }

    /// Get the number of blocks.
    #[must_use]
    pub fn block_num(&self) -> usize {
        self.block_num
    }

    /// Get the block size.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the number of butterfly factors.
    #[must_use]
    pub fn n_butterfly_factor(&self) -> usize {
        self.n_butterfly_factor + 1 // Return the config value
    }
}

/// Butterfly reordering of `0..n`.
///
/// `n` is split into `groups` equal groups. Inside each group the chunks of
/// `chunk` consecutive indices at even positions move to the front and the
/// odd ones follow, so a block-diagonal matrix conjugated by this permutation
/// pairs features that are `group / 2` apart.
fn butterfly_permutation(n: usize, groups: usize, chunk: usize) -> Result<Vec<usize>> {
    if groups == 0 || chunk == 0 || n % groups != 0 || 2 * chunk * groups > n {
        return Err(PeftError::InvalidConfig(format!(
            "cannot split {n} features into {groups} butterfly groups of {chunk}-wide chunks"
        )));
    }
    let group = n / groups;
    let chunks = group / chunk;
    let mut order = Vec::with_capacity(n);
    for start in (0..n).step_by(group) {
        for c in (0..chunks).step_by(2).chain((1..chunks).step_by(2)) {
            order.extend(start + c * chunk..start + (c + 1) * chunk);
        }
    }
    Ok(order)
}

/// Matrix `P` with `P[i, order[i]] = 1`.
fn permutation_matrix(order: &[usize], device: &Device) -> Result<Tensor> {
    let n = order.len();
    let mut data = vec![0f32; n * n];
    for (row, &col) in order.iter().enumerate() {
        data[row * n + col] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

impl Adapter for BoftLayer {
    type Config = BoftConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let rotation = self.rotation_with(self.training && self.config.boft_dropout > 0.0)?;

        // x @ R @ W^T * s^T + b
        let rotated = input.broadcast_matmul(&rotation)?;
        let out = rotated.broadcast_matmul(&base.weight().t()?)?;
        let out = out.broadcast_mul(&self.boft_s.as_tensor().t()?)?;

        match base.bias() {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }

    fn num_parameters(&self) -> usize {
        self.boft_r.elem_count() + self.boft_s.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for BoftLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        // W' = (W @ R^T) * boft_s
        let rotation = self.rotation()?.to_dtype(base_weight.dtype())?;
        let rotated = base_weight.matmul(&rotation.t()?)?;
        Ok(rotated.broadcast_mul(self.boft_s.as_tensor())?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        // W = (W' / boft_s) @ R
        let rotation = self.rotation()?.to_dtype(merged_weight.dtype())?;
        let unscaled = merged_weight.broadcast_div(self.boft_s.as_tensor())?;
        Ok(unscaled.matmul(&rotation)?)
    }
}

impl Trainable for BoftLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![
            ("boft_R".to_string(), self.boft_r.clone()),
            ("boft_s".to_string(), self.boft_s.clone()),
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

impl BuildAdapter for BoftLayer {
    fn build(
        in_features: usize,
        out_features: usize,
        config: &BoftConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, out_features, config.clone(), device)
    }
}

impl SaveLoad for BoftLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("boft_R".to_string(), self.boft_r.as_tensor().clone());
        state_dict.insert("boft_s".to_string(), self.boft_s.as_tensor().clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.boft_r, &state_dict, "boft_R")?;
        assign_var(&self.boft_s, &state_dict, "boft_s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::max_abs_diff;
    use candle_core::{Device, Module};

    fn butterfly_config(block_num: usize, factor: usize) -> BoftConfig {
        BoftConfig {
            boft_block_size: 0,
            boft_block_num: block_num,
            boft_n_butterfly_factor: factor,
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
    fn test_boft_config_default() {
        let config = BoftConfig::default();
        assert_eq!(config.boft_block_num, 4);
        assert_eq!(config.boft_n_butterfly_factor, 1);
        assert!((config.boft_dropout - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_boft_config_validation() {
        let mut config = BoftConfig::default();

        // Valid config
        assert!(config.validate().is_ok());

        // Both block_size and block_num set
        config.boft_block_size = 8;
        config.boft_block_num = 4;
        assert!(config.validate().is_err());

        // Neither set
        config.boft_block_size = 0;
        config.boft_block_num = 0;
        assert!(config.validate().is_err());

        // Invalid butterfly factor
        config.boft_block_num = 4;
        config.boft_n_butterfly_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_boft_layer_creation() -> Result<()> {
        let device = Device::Cpu;
        let layer = BoftLayer::new(64, 64, BoftConfig::default(), &device)?;
        assert_eq!(layer.block_num(), 4);
        assert_eq!(layer.block_size(), 16);
        assert_eq!(layer.n_butterfly_factor(), 1);
        Ok(())
    }

    #[test]
    fn test_boft_identity_at_init() -> Result<()> {
        let device = Device::Cpu;
        let config = BoftConfig {
            boft_n_butterfly_factor: 2,
            ..Default::default()
        };
        let layer = BoftLayer::new(16, 8, config, &device)?;
        let base = base_linear(16, 8);
        let input = Tensor::randn(0.0f32, 1.0f32, (2, 10, 16), &device)?;

        let output = layer.forward(&input, &base)?;
        assert_eq!(output.dims(), &[2, 10, 8]);
        assert!(max_abs_diff(&output, &base.forward(&input)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_boft_parameter_count() -> Result<()> {
        let device = Device::Cpu;
        let layer = BoftLayer::new(64, 64, BoftConfig::default(), &device)?;

        // One factor of 4 blocks of 16x16, plus one scale per output.
        assert_eq!(layer.num_parameters(), 1088);
        Ok(())
    }

    #[test]
    fn test_butterfly_permutation_order() -> Result<()> {
        // Even chunks before odd chunks within each half
        assert_eq!(butterfly_permutation(8, 2, 1)?, vec![0, 2, 1, 3, 4, 6, 5, 7]);
        assert_eq!(butterfly_permutation(8, 1, 2)?, vec![0, 1, 4, 5, 2, 3, 6, 7]);
        assert!(butterfly_permutation(8, 4, 2).is_err());

        let p = permutation_matrix(&[2, 0, 1], &Device::Cpu)?;
        let v = Tensor::new(&[10f32, 20., 30.], &Device::Cpu)?.unsqueeze(1)?;
        let picked: Vec<f32> = p.matmul(&v)?.flatten_all()?.to_vec1()?;
        assert_eq!(picked, vec![30., 10., 20.]);
        Ok(())
    }

    #[test]
    fn test_boft_rotation_is_orthogonal() -> Result<()> {
        let device = Device::Cpu;
        let layer = BoftLayer::new(16, 16, butterfly_config(4, 3), &device)?;
        let rotation = layer.rotation()?;
        let product = rotation.matmul(&rotation.t()?)?;
        let eye = Tensor::eye(16, DType::F32, &device)?;
        assert!(max_abs_diff(&product, &eye)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_boft_merge_matches_forward() -> Result<()> {
        let device = Device::Cpu;
        let layer = BoftLayer::new(16, 12, butterfly_config(4, 2), &device)?;
        let s = Tensor::randn(1.0f32, 0.1, (12, 1), &device)?;
        layer.boft_s.set(&s)?;
        let base = base_linear(16, 12);
        let input = Tensor::randn(0.0f32, 1.0f32, (3, 16), &device)?;

        let merged = layer.merge(base.weight())?;
        let merged_layer = Linear::new(merged.clone(), base.bias().cloned());
        let expected = layer.forward(&input, &base)?;
        assert!(max_abs_diff(&expected, &merged_layer.forward(&input)?)? < 1e-4);

        let unmerged = layer.unmerge(&merged)?;
        assert!(max_abs_diff(&unmerged, base.weight())? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_boft_dropout_only_in_training() -> Result<()> {
        let device = Device::Cpu;
        let config = BoftConfig {
            boft_dropout: 1.0,
            ..butterfly_config(4, 1)
        };
        let mut layer = BoftLayer::new(16, 16, config, &device)?;
        let base = base_linear(16, 16);
        let x = Tensor::randn(0f32, 1.0, (2, 16), &device)?;
        let plain = base.forward(&x)?;
        assert!(max_abs_diff(&layer.forward(&x, &base)?, &plain)? > 1e-3);

        // Every block of the single factor is dropped, leaving the base layer.
        layer.set_training(true);
        assert!(max_abs_diff(&layer.forward(&x, &base)?, &plain)? < 1e-4);
        let eye = Tensor::eye(16, DType::F32, &device)?;
        assert!(max_abs_diff(&layer.rotation()?, &eye)? > 1e-3);
        Ok(())
    }

    #[test]
    fn test_boft_merge_ignores_dropout_in_training() -> Result<()> {
        let device = Device::Cpu;
        let config = BoftConfig {
            boft_dropout: 0.5,
            ..butterfly_config(4, 1)
        };
        let mut layer = BoftLayer::new(16, 16, config, &device)?;
        layer.set_training(true);
        let weight = base_linear(16, 16).weight().clone();

        let merged = layer.merge(&weight)?;
        assert!(max_abs_diff(&merged, &layer.merge(&weight)?)? < 1e-6);
        assert!(max_abs_diff(&layer.unmerge(&merged)?, &weight)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_boft_blocks_must_tile_input() {
        let device = Device::Cpu;
        let config = BoftConfig {
            boft_block_num: 5,
            ..Default::default()
        };

        let result = BoftLayer::new(64, 64, config, &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_boft_odd_block_count_rejected_with_butterfly() {
        let device = Device::Cpu;

        let config = BoftConfig {
            boft_block_num: 3,
            boft_n_butterfly_factor: 2,
            ..Default::default()
        };

        let result = BoftLayer::new(48, 64, config, &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_boft_freeze_unfreeze() -> Result<()> {
        let device = Device::Cpu;
        let mut layer = BoftLayer::new(64, 64, BoftConfig::default(), &device)?;

        assert!(!layer.is_frozen());
        layer.freeze();
        assert!(layer.is_frozen());
        assert!(layer.trainable_vars().is_empty());
        layer.unfreeze();
        assert!(!layer.is_frozen());
        Ok(())
    }
}

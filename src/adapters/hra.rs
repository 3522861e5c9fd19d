//! HRA (Householder Reflection Adaptation) implementation.
//!
//! HRA multiplies the frozen weight by a chain of `r` Householder reflections
//! `H = Π (I - 2 u uᵀ / ‖u‖²)`. The columns of `hra_u` are initialized in equal
//! pairs so the chain starts as the identity.
//!
//! Reference: <https://arxiv.org/abs/2405.17484>

#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{assign_var, SaveLoad};
use crate::traits::{linear_with_weight, Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// Configuration for HRA adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HraConfig {
    /// Number of Householder reflections.
    pub r: usize,

    /// Orthonormalize the reflection vectors (Gram-Schmidt) and use a single
    /// reflection `I - 2 U Uᵀ`. Requires `init_weights = false`: the paired
    /// vectors of the identity init collapse under orthonormalization.
    #[serde(default)]
    pub apply_gs: bool,

    /// Pairwise-equal initialization so the adapter starts as the identity.
    #[serde(default = "default_true")]
    pub init_weights: bool,

    /// Targeting options.
    #[serde(flatten)]
    pub base: BaseAdapterConfig,
}

fn default_true() -> bool {
    true
}

impl Default for HraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            apply_gs: false,
            init_weights: true,
            base: BaseAdapterConfig::default(),
        }
    }
}

impl AdapterConfig for HraConfig {
    const PEFT_TYPE: PeftType = PeftType::Hra;

    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("r must be > 0".into()));
        }
        if self.init_weights && self.r % 2 != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "r ({}) must be even for symmetric initialization",
                self.r
            )));
        }
        if self.apply_gs && self.init_weights {
            return Err(PeftError::InvalidConfig(
                "apply_gs requires init_weights = false".into(),
            ));
        }
        self.base.validate()
    }

    fn base(&self) -> &BaseAdapterConfig {
        &self.base
    }
}

/// HRA layer holding the reflection vectors of one linear layer.
pub struct HraLayer {
    /// Reflection vectors as columns, shape `[in_features, r]`.
    hra_u: Var,
    config: HraConfig,
    in_features: usize,
    frozen: bool,
}

impl HraLayer {
    /// Create a new HRA layer.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or `r > in_features`.
    pub fn new(in_features: usize, config: HraConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if config.r > in_features {
            return Err(PeftError::InvalidConfig(format!(
                "r ({}) cannot exceed in_features ({in_features})",
                config.r
            )));
        }

        let hra_u = if config.init_weights {
            // Each column appears twice in a row; paired reflections cancel.
            let half = config.r / 2;
            let bound = 1.0 / (half as f64).sqrt();
            Tensor::rand(-bound as f32, bound as f32, (in_features, half, 1), device)?
                .broadcast_as((in_features, half, 2))?
                .reshape((in_features, config.r))?
        } else {
            let bound = 1.0 / (config.r as f64).sqrt();
            Tensor::rand(-bound as f32, bound as f32, (in_features, config.r), device)?
        };

        Ok(Self {
            hra_u: Var::from_tensor(&hra_u)?,
            frozen: config.base.inference_mode,
            config,
            in_features,
        })
    }

    /// Number of reflections.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// The orthogonal matrix `H`, shape `[in_features, in_features]`.
    ///
    /// # Errors
    /// Returns error if tensor operations fail.
    pub fn householder_matrix(&self) -> Result<Tensor> {
        let u = self.hra_u.as_tensor();
        let eye = Tensor::eye(self.in_features, u.dtype(), u.device())?;

        if self.config.apply_gs {
            let basis = gram_schmidt(u)?;
            let projection = basis.matmul(&basis.t()?)?;
            return Ok(eye.sub(&projection.affine(2.0, 0.0)?)?);
        }

        let norms = u.sqr()?.sum_keepdim(0)?.sqrt()?;
        let unit = u.broadcast_div(&norms)?;
        let mut h = eye;
        for i in 0..self.config.r {
            let ui = unit.narrow(1, i, 1)?;
            let reflected = h.matmul(&ui)?.matmul(&ui.t()?)?;
            h = h.sub(&reflected.affine(2.0, 0.0)?)?;
        }
        Ok(h)
    }
}

/// Orthonormal columns spanning the columns of `u` (`[n, r]`).
fn gram_schmidt(u: &Tensor) -> Result<Tensor> {
    let (_, r) = u.dims2()?;
    let mut basis: Vec<Tensor> = Vec::with_capacity(r);
    for i in 0..r {
        let mut col = u.narrow(1, i, 1)?;
        for q in &basis {
            let coeff = q.t()?.matmul(&col)?;
            col = col.sub(&q.broadcast_mul(&coeff)?)?;
        }
        let norm = col.sqr()?.sum_keepdim(0)?.sqrt()?;
        basis.push(col.broadcast_div(&norm)?);
    }
    Ok(Tensor::cat(&basis, D::Minus1)?)
}

impl Adapter for HraLayer {
    type Config = HraConfig;

    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor> {
        let weight = self.merge(base.weight())?;
        linear_with_weight(input, &weight, base)
    }

    fn num_parameters(&self) -> usize {
        self.hra_u.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for HraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let h = self.householder_matrix()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.matmul(&h)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let h = self.householder_matrix()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.matmul(&h.t()?)?)
    }
}

impl Trainable for HraLayer {
    fn trainable_vars(&self) -> Vec<(String, Var)> {
        if self.frozen {
            return Vec::new();
        }
        vec![("hra_u".to_string(), self.hra_u.clone())]
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

impl BuildAdapter for HraLayer {
    fn build(
        in_features: usize,
        _out_features: usize,
        config: &HraConfig,
        device: &Device,
    ) -> Result<Self> {
        Self::new(in_features, config.clone(), device)
    }
}

impl SaveLoad for HraLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "hra_u".to_string(),
            self.hra_u.as_tensor().clone(),
        )]))
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        assign_var(&self.hra_u, &state_dict, "hra_u")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::max_abs_diff;
    use candle_core::Module;

    fn base_linear(in_features: usize, out_features: usize) -> Linear {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1.0, (out_features, in_features), &device).unwrap();
        let bias = Tensor::randn(0f32, 1.0, out_features, &device).unwrap();
        Linear::new(weight, Some(bias))
    }

    fn assert_orthogonal(h: &Tensor, n: usize) -> Result<()> {
        let eye = Tensor::eye(n, DType::F32, &Device::Cpu)?;
        assert!(max_abs_diff(&h.matmul(&h.t()?)?, &eye)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_hra_config_validation() {
        assert!(HraConfig::default().validate().is_ok());

        let odd = HraConfig {
            r: 3,
            ..Default::default()
        };
        assert!(odd.validate().is_err());

        let odd_random = HraConfig {
            r: 3,
            init_weights: false,
            ..Default::default()
        };
        assert!(odd_random.validate().is_ok());

        let zero = HraConfig {
            r: 0,
            init_weights: false,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_hra_identity_at_init() -> Result<()> {
        let device = Device::Cpu;
        let layer = HraLayer::new(16, HraConfig::default(), &device)?;
        let h = layer.householder_matrix()?;
        let eye = Tensor::eye(16, DType::F32, &device)?;
        assert!(max_abs_diff(&h, &eye)? < 1e-5);

        let base = base_linear(16, 4);
        let input = Tensor::randn(0f32, 1.0, (3, 16), &device)?;
        let output = layer.forward(&input, &base)?;
        assert!(max_abs_diff(&output, &base.forward(&input)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_hra_random_init_is_orthogonal() -> Result<()> {
        let device = Device::Cpu;
        let config = HraConfig {
            r: 5,
            init_weights: false,
            ..Default::default()
        };
        let layer = HraLayer::new(12, config, &device)?;
        assert_orthogonal(&layer.householder_matrix()?, 12)
    }

    #[test]
    fn test_hra_gram_schmidt_is_orthogonal() -> Result<()> {
        let device = Device::Cpu;
        let config = HraConfig {
            r: 4,
            apply_gs: true,
            init_weights: false,
            ..Default::default()
        };
        let layer = HraLayer::new(10, config, &device)?;
        let h = layer.householder_matrix()?;
        assert_orthogonal(&h, 10)?;
        // A single reflection is its own inverse.
        let eye = Tensor::eye(10, DType::F32, &device)?;
        assert!(max_abs_diff(&h.matmul(&h)?, &eye)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_hra_gram_schmidt_rejects_identity_init() {
        let config = HraConfig {
            r: 4,
            apply_gs: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(HraLayer::new(10, config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_hra_merge_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let config = HraConfig {
            r: 4,
            init_weights: false,
            ..Default::default()
        };
        let layer = HraLayer::new(8, config, &device)?;
        let base = base_linear(8, 6);
        let input = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;

        let merged = layer.merge(base.weight())?;
        let merged_layer = Linear::new(merged.clone(), base.bias().cloned());
        let expected = layer.forward(&input, &base)?;
        assert!(max_abs_diff(&expected, &merged_layer.forward(&input)?)? < 1e-4);

        let unmerged = layer.unmerge(&merged)?;
        assert!(max_abs_diff(&unmerged, base.weight())? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_hra_num_parameters() -> Result<()> {
        let layer = HraLayer::new(32, HraConfig::default(), &Device::Cpu)?;
        assert_eq!(layer.num_parameters(), 32 * 8);
        assert_eq!(layer.rank(), 8);
        Ok(())
    }

    #[test]
    fn test_hra_rank_exceeds_features() {
        let config = HraConfig {
            r: 8,
            ..Default::default()
        };
        assert!(HraLayer::new(4, config, &Device::Cpu).is_err());
    }
}

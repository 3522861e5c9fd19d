//! Core traits for PEFT adapters.

use candle_core::{Device, Tensor, Var};
use candle_nn::{Linear, VarMap};
use serde::{de::DeserializeOwned, Serialize};

use crate::config::{BaseAdapterConfig, PeftType};
use crate::error::PeftError;
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Tag written as `peft_type` in `adapter_config.json`.
    const PEFT_TYPE: PeftType;

    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;

    /// Targeting options shared by every adapter type.
    fn base(&self) -> &BaseAdapterConfig;
}

/// Core adapter trait for parameter-efficient fine-tuning.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass through the frozen base layer with this adapter applied.
    ///
    /// # Arguments
    /// * `input` - Input tensor of shape `[..., in_features]`
    /// * `base` - The frozen layer the adapter is attached to
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base: &Linear) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Arguments
    /// * `base_weight` - The original `[out_features, in_features]` weight
    ///
    /// # Returns
    /// New tensor with adapter weights merged
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Arguments
    /// * `merged_weight` - Weight tensor with adapter already merged
    ///
    /// # Returns
    /// Original base weight tensor
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Trait for trainable adapters.
pub trait Trainable: Adapter {
    /// Named trainable variables. Empty while the adapter is frozen.
    fn trainable_vars(&self) -> Vec<(String, Var)>;

    /// Register trainable parameters with the variable map under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter registration fails.
    fn register_parameters(&self, var_map: &mut VarMap, prefix: &str) -> Result<()> {
        let mut data = var_map
            .data()
            .lock()
            .map_err(|_| PeftError::WeightLoad("variable map lock poisoned".into()))?;
        for (name, var) in self.trainable_vars() {
            data.insert(format!("{prefix}.{name}"), var);
        }
        Ok(())
    }

    /// Freeze all adapter parameters (disable gradients).
    fn freeze(&mut self);

    /// Unfreeze all adapter parameters (enable gradients).
    fn unfreeze(&mut self);

    /// Check if the adapter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;

    /// Switch between training (dropout active) and evaluation mode.
    fn set_training(&mut self, training: bool);
}

/// Construction of an adapter from its configuration and the shape of the
/// layer it wraps.
pub trait BuildAdapter: Adapter + Sized {
    /// Build a fresh adapter for a `in_features -> out_features` linear layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not fit the layer.
    fn build(
        in_features: usize,
        out_features: usize,
        config: &Self::Config,
        device: &Device,
    ) -> Result<Self>;
}

/// Returns `(in_features, out_features)` of a linear layer.
///
/// # Errors
///
/// Returns an error if the weight is not two-dimensional.
pub fn linear_dims(layer: &Linear) -> Result<(usize, usize)> {
    let (out_features, in_features) = layer.weight().dims2()?;
    Ok((in_features, out_features))
}

/// Apply `weight` (and the base bias) to `input`, the way [`Linear`] does.
///
/// # Errors
///
/// Returns an error if shapes are incompatible.
pub fn linear_with_weight(input: &Tensor, weight: &Tensor, base: &Linear) -> Result<Tensor> {
    let out = input.broadcast_matmul(&weight.t()?)?;
    match base.bias() {
        Some(bias) => Ok(out.broadcast_add(bias)?),
        None => Ok(out),
    }
}

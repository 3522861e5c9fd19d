//! Model integration for PEFT adapters.
//!
//! This module provides functionality for:
//! - Wrapping named base layers with PEFT adapter management
//! - Pattern matching for module names (e.g., `*.attention`, `layer.*`)
//! - Per-module adapter injection, switching, merging and deletion

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor, Var};
use candle_nn::{Linear, VarMap};
use tracing::{debug, info};

use crate::error::{PeftError, Result};
use crate::io::{SaveLoad, WEIGHT_KEY_PREFIX};
use crate::traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};
use crate::tuner::TunerLinear;

/// Name given to an adapter when none is chosen.
pub const DEFAULT_ADAPTER_NAME: &str = "default";

/// Pattern for matching module names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePattern {
    /// Match exact module name, or any module whose last dotted
    /// components equal it (`q_proj` matches `layers.0.q_proj`)
    Exact(String),
    /// Match modules ending with suffix (e.g., `*.attention`)
    Suffix(String),
    /// Match modules starting with prefix (e.g., `layer.*`)
    Prefix(String),
    /// Match all modules
    All,
}

impl ModulePattern {
    /// Parse a pattern string into a `ModulePattern`.
    ///
    /// # Examples
    /// - `"encoder.layer.0"` -> `Exact`
    /// - `"*.attention"` -> `Suffix`
    /// - `"layer.*"` -> `Prefix`
    /// - `"*"` -> `All`
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        match pattern {
            "*" => Self::All,
            s if s.starts_with("*.") => Self::Suffix(s[2..].to_string()),
            s if s.ends_with(".*") => Self::Prefix(s[..s.len() - 2].to_string()),
            s => Self::Exact(s.to_string()),
        }
    }

    /// Check if a module name matches this pattern.
    #[must_use]
    pub fn matches(&self, module_name: &str) -> bool {
        match self {
            Self::Exact(name) => {
                module_name == name
                    || module_name
                        .strip_suffix(name.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            Self::Suffix(suffix) => module_name.ends_with(suffix.as_str()),
            Self::Prefix(prefix) => module_name.starts_with(prefix.as_str()),
            Self::All => true,
        }
    }
}

/// True if `module_name` is targeted by `targets` and not excluded.
#[must_use]
pub fn is_targeted(module_name: &str, targets: &[String], excludes: &[String]) -> bool {
    let hit = |patterns: &[String]| {
        patterns
            .iter()
            .any(|p| ModulePattern::parse(p).matches(module_name))
    };
    hit(targets) && !hit(excludes)
}

/// Trainable parameter counts of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterReport {
    /// Parameters of unfrozen adapters
    pub trainable: usize,
    /// Base layer parameters plus every adapter parameter
    pub total: usize,
}

impl ParameterReport {
    /// Trainable share of all parameters, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParameterReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// PEFT model wrapper for managing adapters across modules.
///
/// Holds the named base layers of a model; each one becomes a
/// [`TunerLinear`] that adapters are injected into.
pub struct PeftModel<A: Adapter> {
    /// Tuner layers by module name
    layers: BTreeMap<String, TunerLinear<A>>,
    /// Configuration of each adapter
    configs: HashMap<String, A::Config>,
    /// Adapter names in registration order
    adapter_names: Vec<String>,
    /// Adapters used by the forward pass
    active_adapters: Vec<String>,
    /// Device adapters are created on
    device: Device,
}

impl<A: BuildAdapter + Mergeable> PeftModel<A> {
    /// Wrap named base layers. Adapters are created on the device of the
    /// first layer.
    pub fn new<I, S>(base_layers: I) -> Self
    where
        I: IntoIterator<Item = (S, Linear)>,
        S: Into<String>,
    {
        let layers: BTreeMap<String, TunerLinear<A>> = base_layers
            .into_iter()
            .map(|(name, layer)| {
                let name = name.into();
                (name.clone(), TunerLinear::new(name, layer))
            })
            .collect();
        let device = layers
            .values()
            .next()
            .map_or(Device::Cpu, |layer| layer.base().weight().device().clone());
        Self {
            layers,
            configs: HashMap::new(),
            adapter_names: Vec::new(),
            active_adapters: Vec::new(),
            device,
        }
    }

    /// Device adapters are created on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Inject a new adapter into every targeted module.
    ///
    /// The first adapter added becomes active. Returns the number of
    /// modules that received the adapter.
    ///
    /// # Errors
    /// Returns an error if the name is taken, the config is invalid, no
    /// module is targeted, or an adapter does not fit its layer.
    pub fn add_adapter(&mut self, adapter_name: impl Into<String>, config: A::Config) -> Result<usize> {
        let adapter_name = adapter_name.into();
        if self.configs.contains_key(&adapter_name) {
            return Err(PeftError::AdapterExists { name: adapter_name });
        }
        config.validate()?;

        let base = config.base();
        let targets: Vec<String> = self
            .layers
            .keys()
            .filter(|name| is_targeted(name, &base.target_modules, &base.exclude_modules))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(PeftError::TargetNotFound {
                targets: base.target_modules.clone(),
            });
        }

        // Build every adapter before touching the layers so a failure leaves
        // the model unchanged.
        let mut built = Vec::with_capacity(targets.len());
        for module_name in &targets {
            let (in_features, out_features) = self.layer(module_name)?.dims()?;
            let adapter = A::build(in_features, out_features, &config, &self.device)?;
            built.push((module_name, adapter));
        }
        for (module_name, adapter) in built {
            if let Some(layer) = self.layers.get_mut(module_name.as_str()) {
                layer.add_adapter(adapter_name.clone(), adapter)?;
            }
        }

        info!(
            adapter = %adapter_name,
            peft_type = %<A::Config as AdapterConfig>::PEFT_TYPE,
            modules = targets.len(),
            "added adapter"
        );
        self.configs.insert(adapter_name.clone(), config);
        self.adapter_names.push(adapter_name.clone());
        if self.active_adapters.is_empty() {
            self.set_adapter(&adapter_name)?;
        }
        Ok(targets.len())
    }

    /// Make a single adapter active.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist.
    pub fn set_adapter(&mut self, adapter_name: &str) -> Result<()> {
        self.set_adapters(&[adapter_name])
    }

    /// Make several adapters active at once. Their outputs are combined.
    ///
    /// # Errors
    /// Returns an error if one of the adapters doesn't exist.
    pub fn set_adapters(&mut self, adapter_names: &[&str]) -> Result<()> {
        for name in adapter_names {
            self.ensure_adapter(name)?;
        }
        self.active_adapters = adapter_names.iter().map(|n| (*n).to_string()).collect();
        for layer in self.layers.values_mut() {
            layer.set_active(&self.active_adapters);
        }
        debug!(active = ?self.active_adapters, "set active adapters");
        Ok(())
    }

    /// Currently active adapter names.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        &self.active_adapters
    }

    /// Get all registered adapter names.
    #[must_use]
    pub fn adapter_names(&self) -> &[String] {
        &self.adapter_names
    }

    /// Configuration of an adapter.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist.
    pub fn adapter_config(&self, adapter_name: &str) -> Result<&A::Config> {
        self.configs
            .get(adapter_name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: adapter_name.to_string(),
            })
    }

    /// Mutable configuration of an adapter.
    pub(crate) fn adapter_config_mut(&mut self, adapter_name: &str) -> Result<&mut A::Config> {
        self.configs
            .get_mut(adapter_name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: adapter_name.to_string(),
            })
    }

    /// Names of all wrapped modules.
    #[must_use]
    pub fn module_names(&self) -> Vec<&str> {
        self.layers.keys().map(String::as_str).collect()
    }

    /// Names of modules carrying the adapter.
    #[must_use]
    pub fn adapted_modules(&self, adapter_name: &str) -> Vec<&str> {
        self.layers
            .iter()
            .filter(|(_, layer)| layer.has_adapter(adapter_name))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Check if a module has any adapters.
    #[must_use]
    pub fn has_adapter(&self, module_name: &str) -> bool {
        self.layers
            .get(module_name)
            .is_some_and(|layer| layer.adapters().next().is_some())
    }

    /// Tuner layer of a module.
    ///
    /// # Errors
    /// Returns an error if the module doesn't exist.
    pub fn layer(&self, module_name: &str) -> Result<&TunerLinear<A>> {
        self.layers
            .get(module_name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: format!("module '{module_name}' not found"),
            })
    }

    /// Mutable tuner layers, ordered by module name.
    pub fn layers_mut(&mut self) -> impl Iterator<Item = (&str, &mut TunerLinear<A>)> {
        self.layers.iter_mut().map(|(name, layer)| (name.as_str(), layer))
    }

    /// Get a reference to an adapter for a module.
    ///
    /// # Errors
    /// Returns an error if module or adapter not found
    pub fn get_adapter(&self, module_name: &str, adapter_name: &str) -> Result<&A> {
        self.layer(module_name)?
            .adapter(adapter_name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: format!("adapter '{adapter_name}' not found in module '{module_name}'"),
            })
    }

    /// Forward pass for a specific module.
    ///
    /// # Arguments
    /// * `module_name` - Name of the module
    /// * `input` - Input tensor of shape `[..., in_features]`
    ///
    /// # Errors
    /// Returns an error if the module is not found or the input does not fit.
    pub fn forward_module(&self, module_name: &str, input: &Tensor) -> Result<Tensor> {
        self.layer(module_name)?.forward(input)
    }

    /// Merge the active adapters into the base weights.
    ///
    /// # Errors
    /// Returns [`PeftError::NonFinite`] if `safe_merge` is set and a merged
    /// weight is broken. Every merged weight is computed before any layer is
    /// updated, so no module is merged when an error is returned.
    pub fn merge_adapter(&mut self, safe_merge: bool) -> Result<()> {
        let active = self.active_adapters.clone();
        let pending = self
            .layers
            .values()
            .map(|layer| layer.prepare_merge(&active, safe_merge))
            .collect::<Result<Vec<_>>>()?;
        for (layer, pending) in self.layers.values_mut().zip(pending) {
            if let Some(pending) = pending {
                layer.commit_merge(pending);
            }
        }
        info!(adapters = ?active, safe_merge, "merged adapters");
        Ok(())
    }

    /// Undo all merges.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        for layer in self.layers.values_mut() {
            if layer.is_merged() {
                layer.unmerge()?;
            }
        }
        Ok(())
    }

    /// True if any module has a merged adapter.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.layers.values().any(TunerLinear::is_merged)
    }

    /// Merge the active adapters and return the plain base layers.
    ///
    /// # Errors
    /// Returns an error if merging fails.
    pub fn merge_and_unload(self, safe_merge: bool) -> Result<BTreeMap<String, Linear>> {
        let active = self.active_adapters.clone();
        let mut out = BTreeMap::new();
        for (name, mut layer) in self.layers {
            layer.set_active(&active);
            out.insert(name, layer.merge_and_unload(safe_merge)?);
        }
        Ok(out)
    }

    /// Drop every adapter and return the original base layers.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn unload(self) -> Result<BTreeMap<String, Linear>> {
        let mut out = BTreeMap::new();
        for (name, layer) in self.layers {
            out.insert(name, layer.unload()?);
        }
        Ok(out)
    }

    /// Remove an adapter from every module.
    ///
    /// If it was active, the first remaining adapter becomes active.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist or is merged.
    pub fn delete_adapter(&mut self, adapter_name: &str) -> Result<()> {
        self.ensure_adapter(adapter_name)?;
        if self
            .layers
            .values()
            .any(|layer| layer.merged_adapters().iter().any(|m| m == adapter_name))
        {
            return Err(PeftError::AdapterMerged {
                name: adapter_name.to_string(),
            });
        }
        for layer in self.layers.values_mut() {
            layer.delete_adapter(adapter_name)?;
        }
        self.configs.remove(adapter_name);
        self.adapter_names.retain(|name| name != adapter_name);
        self.active_adapters.retain(|name| name != adapter_name);
        if self.active_adapters.is_empty() {
            if let Some(first) = self.adapter_names.first().cloned() {
                self.set_adapter(&first)?;
            }
        }
        info!(adapter = adapter_name, "deleted adapter");
        Ok(())
    }

    /// Bypass every adapter; merged adapters are unmerged first.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn disable_adapters(&mut self) -> Result<()> {
        for layer in self.layers.values_mut() {
            layer.set_disabled(true)?;
        }
        Ok(())
    }

    /// Stop bypassing adapters.
    ///
    /// # Errors
    /// Returns an error if a layer cannot be re-enabled.
    pub fn enable_adapters(&mut self) -> Result<()> {
        for layer in self.layers.values_mut() {
            layer.set_disabled(false)?;
        }
        Ok(())
    }

    /// True if adapters are bypassed.
    #[must_use]
    pub fn adapters_disabled(&self) -> bool {
        self.layers.values().any(TunerLinear::is_disabled)
    }

    /// Run `f` with adapters disabled, then restore the previous state,
    /// including merges that disabling undid.
    ///
    /// # Errors
    /// Returns the error of `f`, or an error if the state cannot be restored.
    pub fn with_adapters_disabled<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let was_disabled = self.adapters_disabled();
        let merged: Vec<(String, Vec<String>)> = self
            .layers
            .iter()
            .filter(|(_, layer)| layer.is_merged())
            .map(|(name, layer)| (name.clone(), layer.merged_adapters().to_vec()))
            .collect();

        self.disable_adapters()?;
        let result = f(&*self);

        if !was_disabled {
            self.enable_adapters()?;
        }
        for (module_name, names) in merged {
            if let Some(layer) = self.layers.get_mut(&module_name) {
                layer.merge(&names, false)?;
            }
        }
        result
    }

    fn ensure_adapter(&self, adapter_name: &str) -> Result<()> {
        if self.configs.contains_key(adapter_name) {
            Ok(())
        } else {
            Err(PeftError::AdapterNotFound {
                name: adapter_name.to_string(),
            })
        }
    }

    /// Get the number of modules with adapters.
    #[must_use]
    pub fn num_modules(&self) -> usize {
        self.layers
            .keys()
            .filter(|name| self.has_adapter(name))
            .count()
    }
}

impl<A: BuildAdapter + Mergeable + Trainable> PeftModel<A> {
    /// Trainable variables of every unfrozen adapter, keyed
    /// `<module>.<tensor>.<adapter>`.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .flat_map(|(module_name, layer)| {
                layer.adapters().flat_map(move |(adapter_name, adapter)| {
                    adapter
                        .trainable_vars()
                        .into_iter()
                        .map(move |(tensor, var)| (format!("{module_name}.{tensor}.{adapter_name}"), var))
                })
            })
            .collect()
    }

    /// Register the trainable variables of the active adapters in `var_map`
    /// under `<module>.<adapter>.<tensor>`. Returns the number registered.
    ///
    /// # Errors
    /// Returns an error if the variable map cannot be updated.
    pub fn register_active_parameters(&self, var_map: &mut VarMap) -> Result<usize> {
        let mut registered = 0;
        for (module_name, layer) in &self.layers {
            for (adapter_name, adapter) in layer.adapters() {
                if !self.active_adapters.iter().any(|active| active == adapter_name) {
                    continue;
                }
                adapter.register_parameters(var_map, &format!("{module_name}.{adapter_name}"))?;
                registered += adapter.trainable_vars().len();
            }
        }
        Ok(registered)
    }

    /// Freeze every adapter except `adapter_name`, which is unfrozen.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist.
    pub fn set_trainable(&mut self, adapter_name: &str) -> Result<()> {
        self.ensure_adapter(adapter_name)?;
        for layer in self.layers.values_mut() {
            for (name, adapter) in layer.adapters_mut() {
                if name == adapter_name {
                    adapter.unfreeze();
                } else {
                    adapter.freeze();
                }
            }
        }
        Ok(())
    }

    /// Switch every adapter between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        for layer in self.layers.values_mut() {
            for (_, adapter) in layer.adapters_mut() {
                adapter.set_training(training);
            }
        }
    }

    /// Get the total number of parameters of the active adapters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.layers
            .values()
            .flat_map(|layer| {
                layer
                    .active_adapters()
                    .iter()
                    .filter_map(|name| layer.adapter(name))
            })
            .map(Adapter::num_parameters)
            .sum()
    }

    /// Trainable versus total parameter counts.
    #[must_use]
    pub fn trainable_parameter_report(&self) -> ParameterReport {
        let mut report = ParameterReport {
            trainable: 0,
            total: 0,
        };
        for layer in self.layers.values() {
            report.total += layer.base().weight().elem_count();
            report.total += layer.base().bias().map_or(0, Tensor::elem_count);
            for (_, adapter) in layer.adapters() {
                report.total += adapter.num_parameters();
                if !adapter.is_frozen() {
                    report.trainable += adapter.num_parameters();
                }
            }
        }
        report
    }
}

impl<A: BuildAdapter + Mergeable + SaveLoad> PeftModel<A> {
    /// Tensors of one adapter across all modules, keyed
    /// `base_model.model.<module>.<tensor>`.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist.
    pub fn adapter_state_dict(&self, adapter_name: &str) -> Result<HashMap<String, Tensor>> {
        self.ensure_adapter(adapter_name)?;
        let mut out = HashMap::new();
        for (module_name, layer) in &self.layers {
            if let Some(adapter) = layer.adapter(adapter_name) {
                for (tensor, value) in adapter.state_dict()? {
                    out.insert(format!("{WEIGHT_KEY_PREFIX}{module_name}.{tensor}"), value);
                }
            }
        }
        Ok(out)
    }

    /// Load tensors produced by [`Self::adapter_state_dict`] into an
    /// existing adapter.
    ///
    /// # Errors
    /// Returns an error if a tensor is missing or has the wrong shape.
    pub fn load_adapter_state_dict(
        &mut self,
        adapter_name: &str,
        state_dict: &HashMap<String, Tensor>,
    ) -> Result<()> {
        self.ensure_adapter(adapter_name)?;
        for (module_name, layer) in &mut self.layers {
            let Some(adapter) = layer.adapter_mut(adapter_name) else {
                continue;
            };
            let prefix = format!("{WEIGHT_KEY_PREFIX}{module_name}.");
            let local: HashMap<String, Tensor> = state_dict
                .iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&prefix)
                        .map(|rest| (rest.to_string(), value.clone()))
                })
                .collect();
            adapter.load_state_dict(local)?;
        }
        Ok(())
    }
}

/// Create a PEFT model with an adapter injected into the targeted modules.
///
/// This is a convenience function for common use cases.
///
/// # Arguments
/// * `base_layers` - Named linear layers of the model
/// * `config` - Adapter configuration, including the target modules
/// * `adapter_name` - Name for the adapter
///
/// # Errors
/// Returns an error if no module is targeted or adapter creation fails
pub fn get_peft_model<A, I, S>(
    base_layers: I,
    config: A::Config,
    adapter_name: &str,
) -> Result<PeftModel<A>>
where
    A: BuildAdapter + Mergeable,
    I: IntoIterator<Item = (S, Linear)>,
    S: Into<String>,
{
    let mut model = PeftModel::new(base_layers);
    model.add_adapter(adapter_name, config)?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BaseAdapterConfig;
    use crate::linalg::max_abs_diff;
    use crate::{LoraConfig, LoraInitialization, LoraLayer};
    use candle_core::{DType, Device, Module};

    fn base_layers(names: &[&str], dim: usize) -> Vec<(String, Linear)> {
        let device = Device::Cpu;
        names
            .iter()
            .map(|name| {
                let weight = Tensor::randn(0f32, 1.0, (dim, dim), &device).unwrap();
                ((*name).to_string(), Linear::new(weight, None))
            })
            .collect()
    }

    fn lora_config(targets: &[&str]) -> LoraConfig {
        LoraConfig {
            r: 4,
            init_lora_weights: LoraInitialization::Random,
            base: BaseAdapterConfig::targeting(targets),
            ..Default::default()
        }
    }

    #[test]
    fn test_module_pattern_exact() {
        let pattern = ModulePattern::parse("encoder.layer.0");
        assert!(pattern.matches("encoder.layer.0"));
        assert!(!pattern.matches("encoder.layer.1"));
        assert!(!pattern.matches("decoder.layer.0"));
    }

    #[test]
    fn test_module_pattern_dotted_suffix() {
        let pattern = ModulePattern::parse("q_proj");
        assert!(pattern.matches("q_proj"));
        assert!(pattern.matches("layers.0.q_proj"));
        assert!(!pattern.matches("layers.0.xq_proj"));
    }

    #[test]
    fn test_module_pattern_suffix() {
        let pattern = ModulePattern::parse("*.attention");
        assert!(pattern.matches("layer.0.attention"));
        assert!(pattern.matches("encoder.layer.0.attention"));
        assert!(!pattern.matches("attention.output"));
    }

    #[test]
    fn test_module_pattern_prefix() {
        let pattern = ModulePattern::parse("encoder.*");
        assert!(pattern.matches("encoder.layer.0"));
        assert!(pattern.matches("encoder.attention"));
        assert!(!pattern.matches("decoder.layer.0"));
    }

    #[test]
    fn test_module_pattern_all() {
        let pattern = ModulePattern::parse("*");
        assert!(pattern.matches("anything"));
        assert!(pattern.matches("encoder.layer.0"));
        assert!(pattern.matches(""));
    }

    #[test]
    fn test_exclusions_win() {
        let targets = vec!["*".to_string()];
        let excludes = vec!["lin1".to_string()];
        assert!(is_targeted("lin0", &targets, &excludes));
        assert!(!is_targeted("lin1", &targets, &excludes));
    }

    #[test]
    fn test_add_adapter_with_pattern() -> Result<()> {
        let layers = base_layers(
            &[
                "encoder.layer.0.attention",
                "encoder.layer.0.mlp",
                "encoder.layer.1.attention",
                "decoder.layer.0.attention",
            ],
            8,
        );
        let mut model: PeftModel<LoraLayer> = PeftModel::new(layers);
        let count = model.add_adapter("lora", lora_config(&["*.attention"]))?;

        assert_eq!(count, 3);
        assert_eq!(model.active_adapters(), ["lora".to_string()].as_slice());
        assert!(model.has_adapter("encoder.layer.0.attention"));
        assert!(model.has_adapter("decoder.layer.0.attention"));
        assert!(!model.has_adapter("encoder.layer.0.mlp"));
        assert_eq!(model.num_modules(), 3);
        Ok(())
    }

    #[test]
    fn test_add_adapter_errors() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0"], 8));
        assert!(matches!(
            model.add_adapter("a", lora_config(&["missing"])),
            Err(PeftError::TargetNotFound { .. })
        ));
        model.add_adapter("a", lora_config(&["lin0"]))?;
        assert!(matches!(
            model.add_adapter("a", lora_config(&["lin0"])),
            Err(PeftError::AdapterExists { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_set_adapter_switches_output() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0"], 8));
        model.add_adapter("adapter1", lora_config(&["lin0"]))?;
        model.add_adapter("adapter2", lora_config(&["lin0"]))?;
        assert_eq!(model.active_adapters(), ["adapter1".to_string()].as_slice());

        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu)?;
        let out1 = model.forward_module("lin0", &x)?;
        model.set_adapter("adapter2")?;
        let out2 = model.forward_module("lin0", &x)?;
        assert!(max_abs_diff(&out1, &out2)? > 1e-4);

        assert!(model.set_adapter("missing").is_err());
        Ok(())
    }

    #[test]
    fn test_disable_restores_state() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0"], 8));
        model.add_adapter("a", lora_config(&["lin0"]))?;
        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu)?;
        let adapted = model.forward_module("lin0", &x)?;
        let base = model.layer("lin0")?.base().forward(&x)?;

        model.merge_adapter(false)?;
        let inside = model.with_adapters_disabled(|m| m.forward_module("lin0", &x))?;
        assert!(max_abs_diff(&inside, &base)? < 1e-4);

        assert!(model.is_merged());
        assert!(!model.adapters_disabled());
        assert!(max_abs_diff(&model.forward_module("lin0", &x)?, &adapted)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_delete_adapter() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0"], 8));
        model.add_adapter("a", lora_config(&["lin0"]))?;
        model.add_adapter("b", lora_config(&["lin0"]))?;

        model.merge_adapter(false)?;
        assert!(matches!(
            model.delete_adapter("a"),
            Err(PeftError::AdapterMerged { .. })
        ));
        model.unmerge_adapter()?;

        model.delete_adapter("a")?;
        assert_eq!(model.adapter_names(), ["b".to_string()].as_slice());
        assert_eq!(model.active_adapters(), ["b".to_string()].as_slice());
        assert!(model.get_adapter("lin0", "a").is_err());
        Ok(())
    }

    #[test]
    fn test_merge_and_unload() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0", "lin1"], 8));
        model.add_adapter("a", lora_config(&["lin0"]))?;
        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu)?;
        let adapted = model.forward_module("lin0", &x)?;

        let plain = model.merge_and_unload(true)?;
        assert_eq!(plain.len(), 2);
        assert!(max_abs_diff(&plain["lin0"].forward(&x)?, &adapted)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_register_active_parameters() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["lin0", "lin1"], 8));
        model.add_adapter("adapter1", lora_config(&["*"]))?;
        model.add_adapter("adapter2", lora_config(&["lin1"]))?;

        let mut var_map = VarMap::new();
        assert_eq!(model.register_active_parameters(&mut var_map)?, 4);
        let mut keys: Vec<String> = var_map.data().lock().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            [
                "lin0.adapter1.lora_A.weight",
                "lin0.adapter1.lora_B.weight",
                "lin1.adapter1.lora_A.weight",
                "lin1.adapter1.lora_B.weight",
            ]
        );

        model.set_adapter("adapter2")?;
        let mut var_map = VarMap::new();
        assert_eq!(model.register_active_parameters(&mut var_map)?, 2);
        assert!(var_map.data().lock().unwrap().keys().all(|k| k.starts_with("lin1.adapter2.")));
        Ok(())
    }

    #[test]
    fn test_failed_safe_merge_leaves_every_layer_unmerged() -> Result<()> {
        let device = Device::Cpu;
        let finite = Tensor::randn(0f32, 1.0, (8, 8), &device)?;
        let mut poisoned = vec![0.5f32; 64];
        poisoned[10] = f32::NAN;
        let poisoned = Tensor::from_vec(poisoned, (8, 8), &device)?;
        let mut model: PeftModel<LoraLayer> = PeftModel::new([
            ("a_lin", Linear::new(finite.clone(), None)),
            ("b_lin", Linear::new(poisoned, None)),
        ]);
        model.add_adapter("a", lora_config(&["*"]))?;

        let err = model.merge_adapter(true);
        assert!(matches!(err, Err(PeftError::NonFinite { ref module, .. }) if module == "b_lin"));
        assert!(!model.is_merged());
        let weight = model.layer("a_lin")?.base().weight().clone();
        assert!(max_abs_diff(&weight, &finite)? < 1e-7);

        // Without the check the broken weight is merged as requested.
        model.merge_adapter(false)?;
        assert!(model.is_merged());
        Ok(())
    }

    #[test]
    fn test_num_parameters() -> Result<()> {
        let mut model: PeftModel<LoraLayer> = PeftModel::new(base_layers(&["layer.0", "layer.1"], 16));
        model.add_adapter("lora", lora_config(&["*"]))?;

        // 2 modules, each with r * (in + out) = 4 * 32
        assert_eq!(model.num_parameters(), 2 * 4 * 32);

        let report = model.trainable_parameter_report();
        assert_eq!(report.trainable, 2 * 4 * 32);
        assert_eq!(report.total, 2 * 16 * 16 + 2 * 4 * 32);
        assert_eq!(model.trainable_vars().len(), 4);
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip() -> Result<()> {
        let layers = base_layers(&["lin0", "lin1"], 8);
        let mut model: PeftModel<LoraLayer> = PeftModel::new(layers.clone());
        model.add_adapter("a", lora_config(&["*"]))?;
        let state = model.adapter_state_dict("a")?;
        assert!(state.contains_key("base_model.model.lin0.lora_A.weight"));
        assert_eq!(state.len(), 4);

        let mut other: PeftModel<LoraLayer> = PeftModel::new(layers);
        other.add_adapter("a", lora_config(&["*"]))?;
        other.load_adapter_state_dict("a", &state)?;

        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu)?;
        assert!(max_abs_diff(&model.forward_module("lin1", &x)?, &other.forward_module("lin1", &x)?)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_get_peft_model() -> Result<()> {
        let layers = base_layers(&["layer.0.attention", "layer.0.mlp", "layer.1.attention"], 4);
        let model: PeftModel<LoraLayer> =
            get_peft_model(layers, lora_config(&["*.attention"]), DEFAULT_ADAPTER_NAME)?;

        assert_eq!(model.num_modules(), 2);
        assert!(model.has_adapter("layer.0.attention"));
        assert!(!model.has_adapter("layer.0.mlp"));
        let zeros = Tensor::zeros((1, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(model.forward_module("layer.1.attention", &zeros)?.dims(), &[1, 4]);
        Ok(())
    }
}

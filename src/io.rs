//! I/O utilities for saving and loading adapter weights and configurations.
//!
//! This module provides functionality for:
//! - Saving adapter weights to safetensors format
//! - Loading adapter weights from safetensors format
//! - Saving adapter configurations to JSON
//! - Loading adapter configurations from JSON
//! - Saving and loading a whole adapter of a [`PeftModel`] as a directory

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};
use tracing::{debug, info};

use crate::config::{from_tagged_json, to_tagged_json, AnyAdapterConfig};
use crate::error::{PeftError, Result};
use crate::model::{PeftModel, DEFAULT_ADAPTER_NAME};
use crate::traits::{AdapterConfig, BuildAdapter, Mergeable, Trainable};

/// File name of the adapter configuration inside an adapter directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// File name of the adapter weights inside an adapter directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Prefix of every weight key in `adapter_model.safetensors`.
pub const WEIGHT_KEY_PREFIX: &str = "base_model.model.";

/// Trait for adapters that can be saved and loaded.
pub trait SaveLoad {
    /// Get all adapter tensors as a map of name -> tensor.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be produced.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Load adapter tensors from a state dict.
    ///
    /// # Errors
    /// Returns an error if a key is missing or a shape does not match.
    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()>;
}

/// Copy `state_dict[key]` into `var`, checking the shape.
///
/// # Errors
/// Returns an error if the key is missing or the shapes differ.
pub fn assign_var(var: &Var, state_dict: &HashMap<String, Tensor>, key: &str) -> Result<()> {
    let tensor = state_dict
        .get(key)
        .ok_or_else(|| PeftError::WeightLoad(format!("missing tensor '{key}'")))?;
    if tensor.dims() != var.dims() {
        return Err(PeftError::ShapeMismatch {
            expected: var.dims().to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
    Ok(())
}

/// Save adapter weights to a safetensors file.
///
/// # Arguments
/// * `adapter` - The adapter implementing SaveLoad trait
/// * `path` - Path to save the safetensors file
///
/// # Errors
/// Returns an error if:
/// - Failed to get state dict from adapter
/// - Failed to serialize tensors to safetensors format
/// - Failed to write file to disk
pub fn save_adapter_weights<P: AsRef<Path>>(adapter: &dyn SaveLoad, path: P) -> Result<()> {
    write_tensors(&adapter.state_dict()?, path.as_ref())
}

/// Write a tensor map as safetensors with `format=pt` metadata.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub fn write_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    let mut contiguous = Vec::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        contiguous.push((name.as_str(), tensor.contiguous()?));
    }
    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));

    safetensors::tensor::serialize_to_file(contiguous, &metadata, path)
        .map_err(|e| PeftError::Io(format!("failed to save safetensors: {e}")))?;
    Ok(())
}

/// Load adapter weights from a safetensors file.
///
/// # Arguments
/// * `adapter` - The adapter to load weights into
/// * `path` - Path to the safetensors file
/// * `device` - Device to load tensors on
///
/// # Errors
/// Returns an error if:
/// - Failed to read file from disk
/// - Failed to parse safetensors format
/// - Failed to load tensors into adapter
pub fn load_adapter_weights<P: AsRef<Path>>(
    adapter: &mut dyn SaveLoad,
    path: P,
    device: &Device,
) -> Result<()> {
    let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
    adapter.load_state_dict(tensors)
}

/// Save adapter configuration to a JSON file, tagged with its `peft_type`.
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_adapter_config<C: AdapterConfig, P: AsRef<Path>>(config: &C, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(&to_tagged_json(config)?)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load adapter configuration from a JSON file.
///
/// # Errors
/// Returns an error if file reading, deserialization or validation fails,
/// or if the file holds another adapter type.
pub fn load_adapter_config<C: AdapterConfig, P: AsRef<Path>>(path: P) -> Result<C> {
    let json = fs::read_to_string(path)?;
    from_tagged_json(serde_json::from_str(&json)?)
}

/// Directory an adapter is saved to: `dir` for the default adapter,
/// `dir/<name>` otherwise.
#[must_use]
pub fn adapter_dir(dir: &Path, adapter_name: &str) -> PathBuf {
    if adapter_name == DEFAULT_ADAPTER_NAME {
        dir.to_path_buf()
    } else {
        dir.join(adapter_name)
    }
}

/// Save one adapter of a model as `adapter_config.json` +
/// `adapter_model.safetensors`.
///
/// Returns the directory that was written.
///
/// # Errors
/// Returns an error if the adapter does not exist or writing fails.
pub fn save_pretrained<A, P>(model: &PeftModel<A>, dir: P, adapter_name: &str) -> Result<PathBuf>
where
    A: BuildAdapter + Mergeable + Trainable + SaveLoad,
    P: AsRef<Path>,
{
    let target = adapter_dir(dir.as_ref(), adapter_name);
    fs::create_dir_all(&target)?;

    save_adapter_config(model.adapter_config(adapter_name)?, target.join(ADAPTER_CONFIG_FILENAME))?;
    let tensors = model.adapter_state_dict(adapter_name)?;
    write_tensors(&tensors, &target.join(ADAPTER_WEIGHTS_FILENAME))?;

    info!(
        adapter = adapter_name,
        tensors = tensors.len(),
        path = %target.display(),
        "saved adapter"
    );
    Ok(target)
}

/// Load an adapter directory into `model` under `adapter_name`.
///
/// # Errors
/// Returns an error if the files are missing, the config holds another
/// adapter type, or the weights do not fit the model.
pub fn load_pretrained<A, P>(model: &mut PeftModel<A>, dir: P, adapter_name: &str) -> Result<()>
where
    A: BuildAdapter + Mergeable + Trainable + SaveLoad,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    let config: A::Config = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
    let tensors = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILENAME), model.device())?;
    debug!(tensors = tensors.len(), path = %dir.display(), "read adapter weights");

    model.add_adapter(adapter_name, config)?;
    if let Err(err) = model.load_adapter_state_dict(adapter_name, &tensors) {
        model.delete_adapter(adapter_name)?;
        return Err(err);
    }
    info!(adapter = adapter_name, path = %dir.display(), "loaded adapter");
    Ok(())
}

/// Shape and size of one stored tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    /// Key in the safetensors file
    pub name: String,
    /// Stored dtype, e.g. `F32`
    pub dtype: String,
    /// Shape
    pub shape: Vec<usize>,
}

impl TensorInfo {
    /// Number of elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Contents of an adapter directory, read without building a model.
#[derive(Debug, Clone)]
pub struct AdapterDirInfo {
    /// The adapter configuration
    pub config: AnyAdapterConfig,
    /// Stored tensors, sorted by name
    pub tensors: Vec<TensorInfo>,
}

impl AdapterDirInfo {
    /// Total number of stored parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.tensors.iter().map(TensorInfo::elem_count).sum()
    }

    /// Distinct module names, i.e. tensor keys without the
    /// `base_model.model.` prefix and the tensor suffix.
    #[must_use]
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self
            .tensors
            .iter()
            .filter_map(|t| {
                let key = t.name.strip_prefix(WEIGHT_KEY_PREFIX).unwrap_or(&t.name);
                let end = key.find(".lora_").or_else(|| key.rfind('.'))?;
                Some(key[..end].to_string())
            })
            .collect();
        modules.dedup();
        modules
    }
}

/// Read the config and the tensor headers of an adapter directory.
///
/// # Errors
/// Returns an error if either file is missing or malformed.
pub fn inspect_adapter_dir<P: AsRef<Path>>(dir: P) -> Result<AdapterDirInfo> {
    let dir = dir.as_ref();
    let json = fs::read_to_string(dir.join(ADAPTER_CONFIG_FILENAME))?;
    let config: AnyAdapterConfig = serde_json::from_str(&json)?;
    config.validate()?;

    let bytes = fs::read(dir.join(ADAPTER_WEIGHTS_FILENAME))?;
    let file = safetensors::SafeTensors::deserialize(&bytes)
        .map_err(|e| PeftError::WeightLoad(format!("invalid safetensors file: {e}")))?;
    let mut tensors: Vec<TensorInfo> = file
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorInfo {
            name,
            dtype: format!("{:?}", view.dtype()),
            shape: view.shape().to_vec(),
        })
        .collect();
    tensors.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(tensors = tensors.len(), path = %dir.display(), "inspected adapter");
    Ok(AdapterDirInfo { config, tensors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;
    use tempfile::TempDir;

    use crate::LoraConfig;

    struct MockAdapter {
        weights: HashMap<String, Tensor>,
    }

    impl SaveLoad for MockAdapter {
        fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
            Ok(self.weights.clone())
        }

        fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
            self.weights = state_dict;
            Ok(())
        }
    }

    #[test]
    fn test_save_load_adapter_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let weights_path = temp_dir.path().join("adapter.safetensors");

        let mut weights = HashMap::new();
        weights.insert(
            "lora_A.weight".to_string(),
            Tensor::randn(0f32, 1f32, (8, 64), &device)?,
        );
        weights.insert(
            "lora_B.weight".to_string(),
            Tensor::randn(0f32, 1f32, (64, 8), &device)?,
        );

        let adapter = MockAdapter {
            weights: weights.clone(),
        };

        save_adapter_weights(&adapter, &weights_path)?;
        assert!(weights_path.exists());

        let mut loaded_adapter = MockAdapter {
            weights: HashMap::new(),
        };
        load_adapter_weights(&mut loaded_adapter, &weights_path, &device)?;

        assert_eq!(loaded_adapter.weights.len(), 2);
        assert_eq!(loaded_adapter.weights["lora_A.weight"].dims(), &[8, 64]);
        assert_eq!(loaded_adapter.weights["lora_B.weight"].dims(), &[64, 8]);

        Ok(())
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join(ADAPTER_CONFIG_FILENAME);

        let config = LoraConfig {
            r: 8,
            alpha: 16,
            dropout: 0.1,
            ..Default::default()
        };

        save_adapter_config(&config, &config_path)?;
        let raw = fs::read_to_string(&config_path)?;
        assert!(raw.contains("\"peft_type\": \"LORA\""));

        let loaded: LoraConfig = load_adapter_config(&config_path)?;
        assert_eq!(loaded.r, 8);
        assert!((loaded.dropout - 0.1).abs() < 1e-12);

        Ok(())
    }

    #[test]
    fn test_assign_var_shape_mismatch() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let var = Var::zeros((2, 3), candle_core::DType::F32, &device)?;
        let state = HashMap::from([(
            "w".to_string(),
            Tensor::zeros((3, 2), candle_core::DType::F32, &device)?,
        )]);
        assert!(matches!(
            assign_var(&var, &state, "w"),
            Err(PeftError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            assign_var(&var, &state, "missing"),
            Err(PeftError::WeightLoad(_))
        ));
        Ok(())
    }

    #[test]
    fn test_inspect_adapter_dir() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let config = LoraConfig {
            r: 2,
            ..Default::default()
        };
        save_adapter_config(&config, temp_dir.path().join(ADAPTER_CONFIG_FILENAME))?;
        let tensors = HashMap::from([
            (
                "base_model.model.layers.0.q_proj.lora_A.weight".to_string(),
                Tensor::zeros((2, 8), candle_core::DType::F32, &device)?,
            ),
            (
                "base_model.model.layers.0.q_proj.lora_B.weight".to_string(),
                Tensor::zeros((4, 2), candle_core::DType::F32, &device)?,
            ),
        ]);
        write_tensors(&tensors, &temp_dir.path().join(ADAPTER_WEIGHTS_FILENAME))?;

        let info = inspect_adapter_dir(temp_dir.path())?;
        assert_eq!(info.config.peft_type(), crate::config::PeftType::Lora);
        assert_eq!(info.tensors.len(), 2);
        assert_eq!(info.tensors[0].shape, vec![2, 8]);
        assert_eq!(info.num_parameters(), 24);
        assert_eq!(info.modules(), vec!["layers.0.q_proj".to_string()]);
        Ok(())
    }

    #[test]
    fn test_adapter_dir_layout() {
        let dir = Path::new("/tmp/out");
        assert_eq!(adapter_dir(dir, DEFAULT_ADAPTER_NAME), PathBuf::from("/tmp/out"));
        assert_eq!(adapter_dir(dir, "other"), PathBuf::from("/tmp/out/other"));
    }
}

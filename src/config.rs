//! Configuration types for PEFT adapters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapters::adalora::AdaLoraConfig;
use crate::adapters::boft::BoftConfig;
use crate::adapters::hra::HraConfig;
use crate::adapters::lora::LoraConfig;
use crate::adapters::miss::MissConfig;
use crate::adapters::oft::OftConfig;
use crate::error::{PeftError, Result};
use crate::traits::AdapterConfig;

/// Key under which the adapter type is stored in `adapter_config.json`.
pub const PEFT_TYPE_KEY: &str = "peft_type";

/// Adapter family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeftType {
    /// Low-Rank Adaptation
    Lora,
    /// Adaptive Low-Rank Adaptation
    #[serde(rename = "ADALORA")]
    AdaLora,
    /// Orthogonal Fine-Tuning
    Oft,
    /// Butterfly Orthogonal Fine-Tuning
    Boft,
    /// Householder Reflection Adaptation
    Hra,
    /// Matrix Shard Sharing
    Miss,
}

impl PeftType {
    /// Upper-case tag as written to disk.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lora => "LORA",
            Self::AdaLora => "ADALORA",
            Self::Oft => "OFT",
            Self::Boft => "BOFT",
            Self::Hra => "HRA",
            Self::Miss => "MISS",
        }
    }
}

impl fmt::Display for PeftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common configuration shared across adapter types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAdapterConfig {
    /// Target modules to apply adapters to (e.g., [`q_proj`, `v_proj`]).
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Modules to exclude from adaptation. Exclusions win over targets.
    #[serde(default)]
    pub exclude_modules: Vec<String>,

    /// Create adapters frozen, for inference only.
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}

impl BaseAdapterConfig {
    /// Targeting block for the given module patterns.
    #[must_use]
    pub fn targeting(modules: &[&str]) -> Self {
        Self {
            target_modules: modules.iter().map(|m| (*m).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Validate the targeting block.
    ///
    /// # Errors
    ///
    /// Returns an error if no target module is configured.
    pub fn validate(&self) -> Result<()> {
        if self.target_modules.is_empty() {
            return Err(PeftError::InvalidConfig(
                "target_modules cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BaseAdapterConfig {
    fn default() -> Self {
        Self {
            target_modules: default_target_modules(),
            exclude_modules: Vec::new(),
            inference_mode: false,
        }
    }
}

/// Serialize a config with its `peft_type` tag.
///
/// # Errors
///
/// Returns an error if the config does not serialize to a JSON object.
pub fn to_tagged_json<C: AdapterConfig>(config: &C) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    let object = value.as_object_mut().ok_or_else(|| {
        PeftError::InvalidConfig("adapter config must serialize to a JSON object".into())
    })?;
    object.insert(
        PEFT_TYPE_KEY.to_string(),
        serde_json::Value::String(C::PEFT_TYPE.as_str().to_string()),
    );
    Ok(value)
}

/// Deserialize a tagged config, checking that the tag matches `C`.
///
/// # Errors
///
/// Returns an error if the tag is missing or belongs to another adapter type.
pub fn from_tagged_json<C: AdapterConfig>(mut value: serde_json::Value) -> Result<C> {
    let object = value.as_object_mut().ok_or_else(|| {
        PeftError::InvalidConfig("adapter config must be a JSON object".into())
    })?;
    let tag = object
        .remove(PEFT_TYPE_KEY)
        .ok_or_else(|| PeftError::InvalidConfig("missing peft_type".into()))?;
    let peft_type: PeftType = serde_json::from_value(tag)?;
    if peft_type != C::PEFT_TYPE {
        return Err(PeftError::InvalidConfig(format!(
            "expected peft_type {}, found {peft_type}",
            C::PEFT_TYPE
        )));
    }
    let config: C = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}

/// Adapter config of any supported type, as read from an unknown directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "peft_type")]
pub enum AnyAdapterConfig {
    /// LoRA config
    #[serde(rename = "LORA")]
    Lora(LoraConfig),
    /// AdaLoRA config
    #[serde(rename = "ADALORA")]
    AdaLora(AdaLoraConfig),
    /// OFT config
    #[serde(rename = "OFT")]
    Oft(OftConfig),
    /// BOFT config
    #[serde(rename = "BOFT")]
    Boft(BoftConfig),
    /// HRA config
    #[serde(rename = "HRA")]
    Hra(HraConfig),
    /// MiSS config
    #[serde(rename = "MISS")]
    Miss(MissConfig),
}

impl AnyAdapterConfig {
    /// The adapter family.
    #[must_use]
    pub fn peft_type(&self) -> PeftType {
        match self {
            Self::Lora(_) => PeftType::Lora,
            Self::AdaLora(_) => PeftType::AdaLora,
            Self::Oft(_) => PeftType::Oft,
            Self::Boft(_) => PeftType::Boft,
            Self::Hra(_) => PeftType::Hra,
            Self::Miss(_) => PeftType::Miss,
        }
    }

    /// Shared targeting block.
    #[must_use]
    pub fn base(&self) -> &BaseAdapterConfig {
        match self {
            Self::Lora(c) => c.base(),
            Self::AdaLora(c) => c.base(),
            Self::Oft(c) => c.base(),
            Self::Boft(c) => c.base(),
            Self::Hra(c) => c.base(),
            Self::Miss(c) => c.base(),
        }
    }

    /// Validate the wrapped config.
    ///
    /// # Errors
    ///
    /// Returns the wrapped config's validation error.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Lora(c) => c.validate(),
            Self::AdaLora(c) => c.validate(),
            Self::Oft(c) => c.validate(),
            Self::Boft(c) => c.validate(),
            Self::Hra(c) => c.validate(),
            Self::Miss(c) => c.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_config_default() {
        let config = BaseAdapterConfig::default();
        assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
        assert!(!config.inference_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_config_empty_targets() {
        let config = BaseAdapterConfig {
            target_modules: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peft_type_serde() {
        let json = serde_json::to_string(&PeftType::AdaLora).unwrap();
        assert_eq!(json, "\"ADALORA\"");
        let parsed: PeftType = serde_json::from_str("\"MISS\"").unwrap();
        assert_eq!(parsed, PeftType::Miss);
        assert_eq!(PeftType::Hra.to_string(), "HRA");
    }

    #[test]
    fn test_tagged_round_trip() -> Result<()> {
        let config = LoraConfig {
            r: 4,
            ..Default::default()
        };
        let value = to_tagged_json(&config)?;
        assert_eq!(value[PEFT_TYPE_KEY], "LORA");
        assert_eq!(value["target_modules"][0], "q_proj");

        let parsed: LoraConfig = from_tagged_json(value)?;
        assert_eq!(parsed.r, 4);
        Ok(())
    }

    #[test]
    fn test_tag_mismatch_rejected() -> Result<()> {
        let value = to_tagged_json(&HraConfig::default())?;
        let parsed: Result<LoraConfig> = from_tagged_json(value);
        assert!(matches!(parsed, Err(PeftError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_any_config_dispatch() {
        let json = r#"{"peft_type": "OFT", "r": 4, "target_modules": ["lin0"]}"#;
        let config: AnyAdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.peft_type(), PeftType::Oft);
        assert_eq!(config.base().target_modules, vec!["lin0"]);
        assert!(config.validate().is_ok());
    }
}

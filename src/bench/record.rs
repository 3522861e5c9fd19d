//! Benchmark record types.
//!
//! A record is one JSON document describing a single fine-tuning run:
//! `run_info` (what was run), `train_info` (how it went, including the
//! per-step metric series) and `meta_info` (where it ran). Open objects keep
//! keys this crate does not know about so a record survives a round trip.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::training::TrainConfig;

/// Metric key of the validation accuracy.
pub const VALID_ACCURACY: &str = "valid accuracy";
/// Metric key of the final test accuracy.
pub const TEST_ACCURACY: &str = "test accuracy";
/// Metric key of the training loss.
pub const TRAIN_LOSS: &str = "train loss";
/// Metric key of the number of samples seen.
pub const TRAIN_SAMPLES: &str = "train samples";
/// Metric key of the training wall time.
pub const TRAIN_TIME: &str = "train time";
/// Metric key of the evaluation wall time.
pub const EVAL_TIME: &str = "eval time";
/// Metric key of the throughput.
pub const TOKENS_PER_SEC: &str = "tokens / sec";
/// Metric key of the total number of training tokens.
pub const TRAIN_TOTAL_TOKENS: &str = "train total tokens";

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainStatus {
    /// Finished all steps.
    #[default]
    Success,
    /// Stopped by an error, see `run_info.error_msg`.
    Failed,
    /// Stopped by the user.
    Canceled,
}

impl fmt::Display for TrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

/// A complete benchmark record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// What was run.
    pub run_info: RunInfo,
    /// Training outcome and metrics.
    pub train_info: TrainInfo,
    /// Environment of the run.
    #[serde(default)]
    pub meta_info: MetaInfo,
}

impl RunRecord {
    /// Record of a run that finished with the given training info.
    #[must_use]
    pub fn new(run_info: RunInfo, train_info: TrainInfo, meta_info: MetaInfo) -> Self {
        Self {
            run_info,
            train_info,
            meta_info,
        }
    }

    /// Record of a run that failed before producing results.
    #[must_use]
    pub fn failed(
        experiment_name: impl Into<String>,
        train_config: TrainConfig,
        peft_config: Option<Value>,
        error_msg: impl Into<String>,
    ) -> Self {
        let mut run_info = RunInfo::new(experiment_name, train_config, peft_config);
        run_info.error_msg = error_msg.into();
        let train_info = TrainInfo {
            status: TrainStatus::Failed,
            ..TrainInfo::default()
        };
        Self::new(run_info, train_info, MetaInfo::current())
    }

    /// Experiment name, e.g. `lora/llama-3.2-3B-rank32`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.run_info.experiment_name
    }

    /// True when the run finished and recorded no error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.train_info.status == TrainStatus::Success && self.run_info.error_msg.is_empty()
    }

    /// `peft_type` of the adapter config, if any.
    #[must_use]
    pub fn peft_type(&self) -> Option<&str> {
        self.run_info
            .peft_config
            .as_ref()
            .and_then(|config| config.get("peft_type"))
            .and_then(Value::as_str)
    }
}

/// Run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Start of the run.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Total wall time in seconds.
    #[serde(default)]
    pub total_time: f64,
    /// Experiment name.
    pub experiment_name: String,
    /// Branch of the adapter library the run used.
    #[serde(default)]
    pub peft_branch: Option<String>,
    /// Training hyperparameters.
    #[serde(default)]
    pub train_config: TrainConfig,
    /// Adapter config including `peft_type`.
    #[serde(default)]
    pub peft_config: Option<Value>,
    /// Empty when the run succeeded.
    #[serde(default)]
    pub error_msg: String,
    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunInfo {
    /// Run info stamped with the current time.
    #[must_use]
    pub fn new(
        experiment_name: impl Into<String>,
        train_config: TrainConfig,
        peft_config: Option<Value>,
    ) -> Self {
        Self {
            created_at: Some(Utc::now()),
            total_time: 0.0,
            experiment_name: experiment_name.into(),
            peft_branch: None,
            train_config,
            peft_config,
            error_msg: String::new(),
            extra: Map::new(),
        }
    }
}

/// Training outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainInfo {
    /// Mean reserved accelerator memory in bytes.
    #[serde(default)]
    pub accelerator_memory_reserved_avg: f64,
    /// Peak accelerator memory in bytes.
    #[serde(default)]
    pub accelerator_memory_max: u64,
    /// 99th percentile of reserved accelerator memory in bytes.
    #[serde(default)]
    pub accelerator_memory_reserved_99th: f64,
    /// Training wall time in seconds.
    #[serde(default)]
    pub train_time: f64,
    /// Size of the saved adapter in bytes.
    #[serde(default)]
    pub file_size: u64,
    /// Trainable parameter count.
    #[serde(default)]
    pub num_trainable_params: u64,
    /// Total parameter count including the frozen base.
    #[serde(default)]
    pub num_total_params: u64,
    /// Outcome.
    #[serde(default)]
    pub status: TrainStatus,
    /// Metric series in step order.
    #[serde(default)]
    pub metrics: Vec<StepMetrics>,
    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TrainInfo {
    /// Value of `key` in the last entry that has it.
    #[must_use]
    pub fn last_metric(&self, key: &str) -> Option<f64> {
        self.metrics.iter().rev().find_map(|m| m.get(key))
    }

    /// Largest value of `key` over all entries.
    #[must_use]
    pub fn max_metric(&self, key: &str) -> Option<f64> {
        self.metrics
            .iter()
            .filter_map(|m| m.get(key))
            .fold(None, |best, v| Some(best.map_or(v, |b: f64| b.max(v))))
    }

    /// Fraction of parameters that are trainable.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn trainable_fraction(&self) -> Option<f64> {
        (self.num_total_params > 0)
            .then(|| self.num_trainable_params as f64 / self.num_total_params as f64)
    }
}

/// One entry of the metric series.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Optimizer step the entry was logged at.
    pub step: usize,
    /// Named values, e.g. `"train loss"`.
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl StepMetrics {
    /// Empty entry for `step`.
    #[must_use]
    pub fn new(step: usize) -> Self {
        Self {
            step,
            values: BTreeMap::new(),
        }
    }

    /// Set `key` to `value`, builder style.
    #[must_use]
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    /// Set `key` to `value`.
    pub fn insert(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), Value::from(value));
    }

    /// Numeric value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// `"train loss"`.
    #[must_use]
    pub fn train_loss(&self) -> Option<f64> {
        self.get(TRAIN_LOSS)
    }

    /// `"valid accuracy"`.
    #[must_use]
    pub fn valid_accuracy(&self) -> Option<f64> {
        self.get(VALID_ACCURACY)
    }

    /// `"test accuracy"`.
    #[must_use]
    pub fn test_accuracy(&self) -> Option<f64> {
        self.get(TEST_ACCURACY)
    }
}

/// Commit and date of a model or dataset.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Commit hash.
    #[serde(default)]
    pub sha: Option<String>,
    /// Commit date as written by the hub.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Host description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    /// OS name.
    #[serde(default)]
    pub system: String,
    /// OS release.
    #[serde(default)]
    pub release: String,
    /// OS version string.
    #[serde(default)]
    pub version: String,
    /// CPU architecture.
    #[serde(default)]
    pub machine: String,
    /// CPU name.
    #[serde(default)]
    pub processor: String,
    /// Accelerator name.
    #[serde(default)]
    pub accelerator: String,
}

/// Environment metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    /// Base model revision.
    #[serde(default)]
    pub model_info: ArtifactInfo,
    /// Dataset name to revision.
    #[serde(default)]
    pub dataset_info: BTreeMap<String, ArtifactInfo>,
    /// Generation settings used for evaluation.
    #[serde(default)]
    pub generation_config: Value,
    /// `<pkg>-version` / `<pkg>-commit-hash` entries.
    #[serde(default)]
    pub package_info: BTreeMap<String, Option<String>>,
    /// Host description.
    #[serde(default)]
    pub system_info: SystemInfo,
    /// Tensor framework description.
    #[serde(default)]
    pub pytorch_info: String,
    /// Keys not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetaInfo {
    /// Metadata of the running process.
    #[must_use]
    pub fn current() -> Self {
        let package_info = BTreeMap::from([(
            format!("{}-version", env!("CARGO_PKG_NAME")),
            Some(env!("CARGO_PKG_VERSION").to_string()),
        )]);
        Self {
            package_info,
            system_info: SystemInfo {
                system: std::env::consts::OS.to_string(),
                machine: std::env::consts::ARCH.to_string(),
                accelerator: "cpu".to_string(),
                ..SystemInfo::default()
            },
            pytorch_info: "candle".to_string(),
            ..Self::default()
        }
    }
}

//! # peftkit
//!
//! PEFT (Parameter-Efficient Fine-Tuning) adapters on top of candle, plus
//! tooling for the benchmark records of fine-tuning runs.
//!
//! This crate provides modular implementations of various PEFT methods:
//! - **`LoRA`** (Low-Rank Adaptation)
//! - **`AdaLoRA`** (Adaptive Low-Rank Adaptation) with its rank allocator
//! - **OFT** (Orthogonal Fine-Tuning)
//! - **BOFT** (Butterfly Orthogonal Fine-Tuning)
//! - **HRA** (Householder Reflection Adaptation)
//! - **`MiSS`** (Matrix Shard Sharing)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::Linear;
//! use peftkit::{get_peft_model, BaseAdapterConfig, LoraConfig, LoraLayer};
//!
//! # fn main() -> peftkit::Result<()> {
//! let device = Device::Cpu;
//! let weight = Tensor::randn(0f32, 0.02, (768, 768), &device)?;
//! let config = LoraConfig {
//!     r: 8,
//!     alpha: 16,
//!     base: BaseAdapterConfig::targeting(&["q_proj"]),
//!     ..Default::default()
//! };
//! let model = get_peft_model::<LoraLayer, _, _>(
//!     [("layers.0.q_proj", Linear::new(weight, None))],
//!     config,
//!     "default",
//! )?;
//!
//! let input = Tensor::zeros((1, 10, 768), DType::F32, &device)?;
//! let output = model.forward_module("layers.0.q_proj", &input)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! All adapters implement the [`Adapter`] trait, which provides a common interface
//! for forward passes, and [`Mergeable`] for folding them into the base weight.
//! [`PeftModel`] holds named base layers and any number of named adapters.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod bench;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod linalg;
pub mod model;
pub mod training;
pub mod traits;
pub mod tuner;

pub use adapters::adalora::{AdaLoraConfig, AdaLoraLayer};
pub use adapters::boft::{BoftConfig, BoftLayer};
pub use adapters::hra::{HraConfig, HraLayer};
pub use adapters::lora::{LoraConfig, LoraInitialization, LoraLayer};
pub use adapters::miss::{MissConfig, MissInit, MissLayer};
pub use adapters::oft::{OftConfig, OftLayer};
pub use adapters::rank_allocator::{BudgetSchedule, RankAllocator, RankPattern};
pub use config::{AnyAdapterConfig, BaseAdapterConfig, PeftType};
pub use error::{PeftError, Result};
pub use io::{
    inspect_adapter_dir, load_adapter_config, load_adapter_weights, load_pretrained,
    save_adapter_config, save_adapter_weights, save_pretrained, SaveLoad,
    ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use model::{get_peft_model, ModulePattern, ParameterReport, PeftModel, DEFAULT_ADAPTER_NAME};
pub use training::{
    count_trainable_parameters, format_parameter_count, AdapterTrainer, AdapterTrainingConfig,
    AdapterTrainingState, LrSchedule, TrainConfig, TrainingLog,
};
pub use traits::{Adapter, AdapterConfig, BuildAdapter, Mergeable, Trainable};
pub use tuner::TunerLinear;

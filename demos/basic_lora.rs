//! Basic LoRA adapter usage example.
//!
//! This example demonstrates:
//! - Creating a LoRA configuration that targets two projections
//! - Injecting it into named base layers
//! - Running the adapted forward pass
//! - Merging the adapter into the base weights

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::Linear;
use peftkit::{get_peft_model, BaseAdapterConfig, LoraConfig, LoraInitialization, LoraLayer};

fn main() -> Result<()> {
    println!("=== Basic LoRA Example ===\n");

    let device = Device::Cpu;
    let hidden = 256;

    let layers = ["layers.0.q_proj", "layers.0.k_proj", "layers.0.v_proj"]
        .into_iter()
        .map(|name| {
            let weight = Tensor::randn(0f32, 0.02, (hidden, hidden), &device)?;
            Ok((name, Linear::new(weight, None)))
        })
        .collect::<candle_core::Result<Vec<_>>>()?;

    // Random init so the adapter visibly changes the output.
    let config = LoraConfig {
        r: 8,
        alpha: 16,
        init_lora_weights: LoraInitialization::Random,
        base: BaseAdapterConfig::targeting(&["q_proj", "v_proj"]),
        ..Default::default()
    };
    println!("LoRA Configuration:");
    println!("  Rank (r): {}", config.r);
    println!("  Alpha: {}", config.alpha);
    println!("  Targets: {:?}\n", config.base.target_modules);

    let mut model = get_peft_model::<LoraLayer, _, _>(layers, config, "default")?;
    println!("Adapted modules: {:?}", model.adapted_modules("default"));
    println!("{}\n", model.trainable_parameter_report());

    let input = Tensor::randn(0f32, 1f32, (2, 10, hidden), &device)?;
    let adapted = model.forward_module("layers.0.q_proj", &input)?;
    let base = model.with_adapters_disabled(|m| m.forward_module("layers.0.q_proj", &input))?;
    let delta: f32 = adapted.sub(&base)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
    println!("Output shape: {:?}", adapted.shape());
    println!("Max |adapted - base|: {delta:.6}\n");

    model.merge_adapter(true)?;
    let merged = model.forward_module("layers.0.q_proj", &input)?;
    let diff: f32 = merged.sub(&adapted)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
    println!("Merged forward matches adapted forward (max diff {diff:.2e})");
    model.unmerge_adapter()?;

    let unloaded = model.merge_and_unload(false)?;
    let q_proj = &unloaded["layers.0.q_proj"];
    let plain = q_proj.forward(&input)?;
    let diff: f32 = plain.sub(&adapted)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
    println!("Unloaded layer matches adapted forward (max diff {diff:.2e})");

    Ok(())
}

//! Several adapters on one model.
//!
//! Two OFT adapters with different block sizes are added to the same
//! modules. The example switches between them, stacks both with
//! `set_adapters` and finally deletes one.

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use peftkit::{BaseAdapterConfig, OftConfig, OftLayer, PeftModel};

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar()?)
}

fn main() -> Result<()> {
    println!("=== Multi-Adapter Example ===\n");

    let device = Device::Cpu;
    let hidden = 64;
    let layers = (0..2)
        .map(|i| {
            let weight = Tensor::randn(0f32, 0.1, (hidden, hidden), &device)?;
            Ok((format!("blocks.{i}.mlp.fc"), Linear::new(weight, None)))
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    let mut model: PeftModel<OftLayer> = PeftModel::new(layers);

    for (name, block_size) in [("style", 8), ("domain", 16)] {
        let config = OftConfig {
            r: 0,
            oft_block_size: block_size,
            init_weights: false,
            base: BaseAdapterConfig::targeting(&["fc"]),
            ..Default::default()
        };
        let modules = model.add_adapter(name, config)?;
        println!("Added '{name}' (block size {block_size}) to {modules} modules");
    }
    println!("Adapters: {:?}", model.adapter_names());
    println!("Active:   {:?}\n", model.active_adapters());

    let input = Tensor::randn(0f32, 1.0, (4, hidden), &device)?;
    let module = "blocks.0.mlp.fc";

    let style = model.forward_module(module, &input)?;
    model.set_adapter("domain")?;
    let domain = model.forward_module(module, &input)?;
    model.set_adapters(&["style", "domain"])?;
    let stacked = model.forward_module(module, &input)?;
    let base = model.with_adapters_disabled(|m| m.forward_module(module, &input))?;

    println!("|style - base|   = {:.4}", max_diff(&style, &base)?);
    println!("|domain - base|  = {:.4}", max_diff(&domain, &base)?);
    println!("|stacked - base| = {:.4}\n", max_diff(&stacked, &base)?);

    model.delete_adapter("style")?;
    println!("After deleting 'style':");
    println!("  Adapters: {:?}", model.adapter_names());
    println!("  Active:   {:?}", model.active_adapters());
    println!("  {}", model.trainable_parameter_report());

    Ok(())
}

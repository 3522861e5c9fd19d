//! Saving and loading adapters.
//!
//! A HRA adapter is saved with `save_pretrained`, inspected on disk, then
//! loaded into a fresh model built from the same base weights.

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use peftkit::{
    get_peft_model, inspect_adapter_dir, load_pretrained, save_pretrained, BaseAdapterConfig,
    HraConfig, HraLayer, PeftModel,
};

fn main() -> Result<()> {
    println!("=== Save/Load Example ===\n");

    let device = Device::Cpu;
    let weights = ["encoder.0.query", "encoder.0.value"]
        .into_iter()
        .map(|name| Ok((name, Tensor::randn(0f32, 0.1, (32, 48), &device)?)))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let base_layers = || {
        weights
            .iter()
            .map(|(name, w)| (*name, Linear::new(w.clone(), None)))
            .collect::<Vec<_>>()
    };

    let config = HraConfig {
        r: 4,
        init_weights: false,
        base: BaseAdapterConfig::targeting(&["query", "value"]),
        ..Default::default()
    };
    let model = get_peft_model::<HraLayer, _, _>(base_layers(), config, "default")?;

    let temp = tempfile::tempdir()?;
    let dir = save_pretrained(&model, temp.path(), "default")?;
    println!("Saved adapter to {}", dir.display());

    let info = inspect_adapter_dir(&dir)?;
    println!("  Type: {}", info.config.peft_type());
    println!("  Modules: {:?}", info.modules());
    for tensor in &info.tensors {
        println!("  {} {:?} ({})", tensor.name, tensor.shape, tensor.dtype);
    }
    println!("  Parameters: {}\n", info.num_parameters());

    let mut restored: PeftModel<HraLayer> = PeftModel::new(base_layers());
    load_pretrained(&mut restored, &dir, "default")?;

    let input = Tensor::randn(0f32, 1.0, (3, 48), &device)?;
    for module in ["encoder.0.query", "encoder.0.value"] {
        let before = model.forward_module(module, &input)?;
        let after = restored.forward_module(module, &input)?;
        let diff: f32 = before.sub(&after)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
        println!("{module}: max diff after reload {diff:.2e}");
    }

    Ok(())
}

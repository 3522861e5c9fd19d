//! Saving adapters to disk and loading them back into a fresh model.

use std::fs;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use peftkit::{
    inspect_adapter_dir, load_pretrained, save_pretrained, AnyAdapterConfig, BaseAdapterConfig,
    BoftConfig, BoftLayer, BuildAdapter, Mergeable, MissConfig, MissLayer, OftConfig, OftLayer,
    PeftModel, PeftType, SaveLoad, Trainable, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
use tempfile::TempDir;

fn weights() -> Result<Vec<(&'static str, Tensor)>> {
    let device = Device::Cpu;
    Ok(vec![
        ("blocks.0.attn.qkv", Tensor::randn(0f32, 0.2, (24, 16), &device)?),
        ("blocks.0.mlp.fc1", Tensor::randn(0f32, 0.2, (32, 16), &device)?),
    ])
}

fn model_from<A: BuildAdapter + Mergeable>(weights: &[(&'static str, Tensor)]) -> PeftModel<A> {
    PeftModel::new(
        weights
            .iter()
            .map(|(name, w)| (*name, Linear::new(w.clone(), None))),
    )
}

fn roundtrip<A>(config: A::Config, adapter_name: &str) -> Result<TempDir>
where
    A: BuildAdapter + Mergeable + Trainable + SaveLoad,
{
    let weights = weights()?;
    let mut model = model_from::<A>(&weights);
    model.add_adapter(adapter_name, config)?;

    let temp = TempDir::new()?;
    let dir = save_pretrained(&model, temp.path(), adapter_name)?;
    assert!(dir.join(ADAPTER_CONFIG_FILENAME).exists());
    assert!(dir.join(ADAPTER_WEIGHTS_FILENAME).exists());

    let mut restored = model_from::<A>(&weights);
    load_pretrained(&mut restored, &dir, adapter_name)?;

    let input = Tensor::randn(0f32, 1.0, (5, 16), &Device::Cpu)?;
    for (module, _) in &weights {
        let want = model.forward_module(module, &input)?;
        let got = restored.forward_module(module, &input)?;
        let diff: f32 = want.sub(&got)?.abs()?.flatten_all()?.max(0)?.to_scalar()?;
        assert!(diff < 1e-6, "{module} differs after reload: {diff}");
    }
    Ok(temp)
}

#[test]
fn test_oft_roundtrip() -> Result<()> {
    roundtrip::<OftLayer>(
        OftConfig {
            r: 4,
            init_weights: false,
            base: BaseAdapterConfig::targeting(&["qkv", "fc1"]),
            ..Default::default()
        },
        "default",
    )?;
    Ok(())
}

#[test]
fn test_boft_roundtrip_named_adapter() -> Result<()> {
    let temp = roundtrip::<BoftLayer>(
        BoftConfig {
            boft_block_num: 0,
            boft_block_size: 4,
            boft_n_butterfly_factor: 2,
            init_weights: false,
            base: BaseAdapterConfig::targeting(&["qkv", "fc1"]),
            ..Default::default()
        },
        "butterfly",
    )?;
    // Non-default adapters are written to a subdirectory.
    assert!(temp.path().join("butterfly").join(ADAPTER_CONFIG_FILENAME).exists());
    Ok(())
}

#[test]
fn test_inspect_saved_miss_adapter() -> Result<()> {
    let weights = weights()?;
    let mut model = model_from::<MissLayer>(&weights);
    model.add_adapter(
        "default",
        MissConfig {
            r: 8,
            base: BaseAdapterConfig::targeting(&["fc1"]),
            ..Default::default()
        },
    )?;
    let temp = TempDir::new()?;
    let dir = save_pretrained(&model, temp.path(), "default")?;

    let info = inspect_adapter_dir(&dir)?;
    assert_eq!(info.config.peft_type(), PeftType::Miss);
    assert!(matches!(info.config, AnyAdapterConfig::Miss(_)));
    assert_eq!(info.modules(), vec!["blocks.0.mlp.fc1".to_string()]);
    assert_eq!(info.tensors.len(), 1);
    assert_eq!(info.tensors[0].shape, vec![8, 32]);
    assert_eq!(info.num_parameters(), 8 * 32);
    Ok(())
}

#[test]
fn test_load_rejects_other_adapter_type() -> Result<()> {
    let weights = weights()?;
    let mut model = model_from::<OftLayer>(&weights);
    model.add_adapter(
        "default",
        OftConfig {
            r: 4,
            base: BaseAdapterConfig::targeting(&["qkv"]),
            ..Default::default()
        },
    )?;
    let temp = TempDir::new()?;
    let dir = save_pretrained(&model, temp.path(), "default")?;

    let mut other = model_from::<BoftLayer>(&weights);
    assert!(load_pretrained(&mut other, &dir, "default").is_err());
    assert!(other.adapter_names().is_empty());
    Ok(())
}

#[test]
fn test_load_rejects_mismatched_shapes() -> Result<()> {
    let weights = weights()?;
    let mut model = model_from::<MissLayer>(&weights);
    model.add_adapter(
        "default",
        MissConfig {
            r: 4,
            base: BaseAdapterConfig::targeting(&["fc1"]),
            ..Default::default()
        },
    )?;
    let temp = TempDir::new()?;
    let dir = save_pretrained(&model, temp.path(), "default")?;

    // Same config, different output width: the stored block no longer fits.
    let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
    let config = fs::read_to_string(&config_path)?;
    let mut other = PeftModel::<MissLayer>::new([(
        "blocks.0.mlp.fc1",
        Linear::new(Tensor::zeros((40, 16), candle_core::DType::F32, &Device::Cpu)?, None),
    )]);
    assert!(config.contains("MISS"));
    assert!(load_pretrained(&mut other, &dir, "default").is_err());
    assert!(!other.has_adapter("blocks.0.mlp.fc1"));
    Ok(())
}

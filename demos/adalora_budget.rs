//! AdaLoRA training with rank budgeting.
//!
//! Trains an AdaLoRA adapter on a toy regression target. After each
//! optimizer step the rank allocator scores the singular values and masks
//! the least important ones until the target budget is reached.

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use peftkit::{
    get_peft_model, AdaLoraConfig, AdaLoraLayer, AdapterTrainer, AdapterTrainingConfig,
    BaseAdapterConfig, LrSchedule, RankAllocator,
};

const TOTAL_STEPS: usize = 60;

fn main() -> Result<()> {
    println!("=== AdaLoRA Budget Example ===\n");

    let device = Device::Cpu;
    let (inp, out) = (32, 16);
    let layers = ["attn.q", "attn.v"]
        .into_iter()
        .map(|name| Ok((name, Linear::new(Tensor::randn(0f32, 0.1, (out, inp), &device)?, None))))
        .collect::<candle_core::Result<Vec<_>>>()?;

    let config = AdaLoraConfig {
        init_r: 8,
        target_r: 2,
        tinit: 10,
        tfinal: 10,
        delta_t: 5,
        total_step: TOTAL_STEPS,
        base: BaseAdapterConfig::targeting(&["q", "v"]),
        ..Default::default()
    };
    let mut model = get_peft_model::<AdaLoraLayer, _, _>(layers, config, "default")?;
    model.set_training(true);

    let mut allocator = RankAllocator::new(&model, "default")?;
    let schedule = *allocator.schedule();
    println!(
        "Budget: {} -> {} ranks, masking between steps {} and {}\n",
        schedule.init_bgt,
        schedule.target_bgt,
        schedule.tinit,
        schedule.final_start()
    );

    let mut trainer = AdapterTrainer::for_model(
        &model,
        AdapterTrainingConfig {
            learning_rate: 1e-2,
            lr_schedule: LrSchedule::WarmupCosine {
                warmup_steps: 5,
                total_steps: TOTAL_STEPS,
                min_lr: 1e-4,
            },
            ..Default::default()
        },
    )?;

    let input = Tensor::randn(0f32, 1.0, (64, inp), &device)?;
    let target = Tensor::randn(0f32, 1.0, (64, out), &device)?;

    for step in 1..=TOTAL_STEPS {
        let q = model.forward_module("attn.q", &input)?;
        let v = model.forward_module("attn.v", &input)?;
        let mse = candle_nn::loss::mse(&q.add(&v)?, &target)?;
        let loss = mse.add(&model.orthogonal_regularization("default")?)?;
        let Some(grads) = trainer.step(&loss, 64)? else {
            continue;
        };
        if let Some(pattern) = model.update_and_allocate(&mut allocator, step, &grads)? {
            let kept: Vec<usize> = pattern
                .values()
                .map(|keep| keep.iter().filter(|k| **k).count())
                .collect();
            println!("step {step:>3}: loss {:.4}, kept ranks {kept:?}", mse.to_scalar::<f32>()?);
        }
    }

    println!();
    for module in model.adapted_modules("default") {
        let layer = model.get_adapter(module, "default")?;
        println!("{module}: rank {} of {}", layer.current_rank(), layer.init_rank());
    }
    println!("{}", model.trainable_parameter_report());
    Ok(())
}

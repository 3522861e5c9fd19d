//! Budget-driven rank allocation for AdaLoRA.
//!
//! The allocator tracks a smoothed sensitivity (`ē`) and its uncertainty
//! (`ū`) for every AdaLoRA parameter. Each rank of each layer gets a score
//! from the `(A row, E entry, B column)` triplet, and the lowest scoring ranks
//! across the whole model are pruned until the scheduled budget is met.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor};
use tracing::{debug, info};

use crate::adapters::adalora::{AdaLoraConfig, AdaLoraLayer};
use crate::error::{PeftError, Result};
use crate::model::PeftModel;
use crate::traits::Trainable;

/// Kept ranks per module.
pub type RankPattern = BTreeMap<String, Vec<bool>>;

/// Cubic budget schedule between `tinit` and `total_step - tfinal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSchedule {
    /// Sum of `init_r` over all layers
    pub init_bgt: usize,
    /// `target_r` times the number of layers
    pub target_bgt: usize,
    /// Warmup steps
    pub tinit: usize,
    /// Final fine-tuning steps
    pub tfinal: usize,
    /// Total training steps
    pub total_step: usize,
    /// Steps between two maskings
    pub delta_t: usize,
}

impl BudgetSchedule {
    /// Schedule for `layers` AdaLoRA layers.
    #[must_use]
    pub fn new(config: &AdaLoraConfig, layers: usize) -> Self {
        Self {
            init_bgt: config.init_r * layers,
            target_bgt: config.target_r * layers,
            tinit: config.tinit,
            tfinal: config.tfinal,
            total_step: config.total_step,
            delta_t: config.delta_t.max(1),
        }
    }

    /// First step of the final fine-tuning phase.
    #[must_use]
    pub fn final_start(&self) -> usize {
        self.total_step.saturating_sub(self.tfinal)
    }

    /// Budget at `step` and whether ranks are masked at this step.
    #[must_use]
    pub fn budget(&self, step: usize) -> (usize, bool) {
        if step <= self.tinit {
            return (self.init_bgt, false);
        }
        if step > self.final_start() {
            return (self.target_bgt, true);
        }
        let span = self.final_start().saturating_sub(self.tinit).max(1);
        let mul_coeff = 1.0 - (step - self.tinit) as f64 / span as f64;
        let spread = (self.init_bgt - self.target_bgt) as f64;
        let budget = (spread * mul_coeff.powi(3) + self.target_bgt as f64).floor() as usize;
        (budget, step % self.delta_t == 0)
    }
}

/// Importance tracker and pruner for one AdaLoRA adapter.
pub struct RankAllocator {
    /// Adapter being allocated
    adapter_name: String,
    beta1: f64,
    beta2: f64,
    schedule: BudgetSchedule,
    /// Smoothed sensitivity per `<module>.<tensor>`
    exp_avg_ipt: HashMap<String, Tensor>,
    /// Smoothed uncertainty per `<module>.<tensor>`
    exp_avg_unc: HashMap<String, Tensor>,
}

impl RankAllocator {
    /// Allocator for `adapter_name`.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist, is frozen, or another
    /// AdaLoRA adapter of the model is trainable too.
    pub fn new(model: &PeftModel<AdaLoraLayer>, adapter_name: &str) -> Result<Self> {
        let config = model.adapter_config(adapter_name)?;
        let mut trainable: Vec<&str> = Vec::new();
        for module_name in model.module_names() {
            for (name, adapter) in model.layer(module_name)?.adapters() {
                if !adapter.is_frozen() && !trainable.contains(&name) {
                    trainable.push(name);
                }
            }
        }
        if trainable.len() > 1 {
            return Err(PeftError::InvalidConfig(format!(
                "only one AdaLoRA adapter can be trained at a time, found {trainable:?}"
            )));
        }
        if trainable != [adapter_name] {
            return Err(PeftError::InvalidConfig(format!(
                "adapter '{adapter_name}' is not trainable"
            )));
        }

        let layers = model.adapted_modules(adapter_name).len();
        let schedule = BudgetSchedule::new(config, layers);
        debug!(
            adapter = adapter_name,
            init_bgt = schedule.init_bgt,
            target_bgt = schedule.target_bgt,
            "created rank allocator"
        );
        Ok(Self {
            adapter_name: adapter_name.to_string(),
            beta1: config.beta1,
            beta2: config.beta2,
            schedule,
            exp_avg_ipt: HashMap::new(),
            exp_avg_unc: HashMap::new(),
        })
    }

    /// The budget schedule.
    #[must_use]
    pub fn schedule(&self) -> &BudgetSchedule {
        &self.schedule
    }

    /// Fold the gradients of this step into the importance estimates.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn update_ipt(&mut self, model: &PeftModel<AdaLoraLayer>, grads: &GradStore) -> Result<()> {
        for module_name in model.adapted_modules(&self.adapter_name) {
            let adapter = model.get_adapter(module_name, &self.adapter_name)?;
            for (tensor_name, var) in adapter.trainable_vars() {
                let Some(grad) = grads.get(var.as_tensor()) else {
                    continue;
                };
                let key = format!("{module_name}.{tensor_name}");
                let ipt = var.as_tensor().detach().mul(grad)?.abs()?;

                let avg = match self.exp_avg_ipt.get(&key) {
                    Some(prev) => prev
                        .affine(self.beta1, 0.0)?
                        .add(&ipt.affine(1.0 - self.beta1, 0.0)?)?,
                    None => ipt.affine(1.0 - self.beta1, 0.0)?,
                };
                let deviation = ipt.sub(&avg)?.abs()?;
                let unc = match self.exp_avg_unc.get(&key) {
                    Some(prev) => prev
                        .affine(self.beta2, 0.0)?
                        .add(&deviation.affine(1.0 - self.beta2, 0.0)?)?,
                    None => deviation.affine(1.0 - self.beta2, 0.0)?,
                };
                self.exp_avg_ipt.insert(key.clone(), avg);
                self.exp_avg_unc.insert(key, unc);
            }
        }
        Ok(())
    }

    /// Forget all importance estimates.
    pub fn reset_ipt(&mut self) {
        self.exp_avg_ipt.clear();
        self.exp_avg_unc.clear();
    }

    /// `ē ⊙ ū` of one parameter, if it has been seen.
    fn element_score(&self, key: &str) -> Result<Option<Tensor>> {
        match (self.exp_avg_ipt.get(key), self.exp_avg_unc.get(key)) {
            (Some(avg), Some(unc)) => Ok(Some(avg.mul(unc)?)),
            _ => Ok(None),
        }
    }

    /// Per-rank triplet score of one layer.
    fn triplet_scores(&self, module_name: &str, rank: usize) -> Result<Vec<f32>> {
        let mut total = vec![0f32; rank];
        let parts = [("lora_E", None), ("lora_A", Some(1)), ("lora_B", Some(0))];
        for (tensor_name, mean_dim) in parts {
            let Some(score) = self.element_score(&format!("{module_name}.{tensor_name}"))? else {
                continue;
            };
            let per_rank = match mean_dim {
                Some(dim) => score.mean(dim)?,
                None => score.flatten_all()?,
            };
            let values: Vec<f32> = per_rank.to_dtype(DType::F32)?.to_vec1()?;
            for (acc, value) in total.iter_mut().zip(values) {
                *acc += value;
            }
        }
        Ok(total)
    }

    /// Prune the lowest scoring ranks across all layers down to `budget`
    /// and return the resulting pattern.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn mask_to_budget(
        &self,
        model: &mut PeftModel<AdaLoraLayer>,
        budget: usize,
    ) -> Result<RankPattern> {
        let mut scores: Vec<(String, Vec<f32>)> = Vec::new();
        for module_name in model.adapted_modules(&self.adapter_name) {
            let rank = model.get_adapter(module_name, &self.adapter_name)?.init_rank();
            scores.push((module_name.to_string(), self.triplet_scores(module_name, rank)?));
        }

        let to_prune = self.schedule.init_bgt.saturating_sub(budget);
        let threshold = if to_prune == 0 {
            None
        } else {
            let mut all: Vec<f32> = scores.iter().flat_map(|(_, s)| s.iter().copied()).collect();
            all.sort_by(f32::total_cmp);
            all.get(to_prune - 1).copied()
        };

        let mut pattern = RankPattern::new();
        for (module_name, layer_scores) in scores {
            let keep: Vec<bool> = layer_scores
                .iter()
                .map(|score| threshold.map_or(true, |t| *score > t))
                .collect();
            pattern.insert(module_name, keep);
        }
        self.apply_pattern(model, &pattern)?;
        debug!(budget, kept = count_kept(&pattern), "masked ranks to budget");
        Ok(pattern)
    }

    /// Apply a stored pattern to the layers of the adapter.
    ///
    /// # Errors
    /// Returns an error if a mask does not fit its layer.
    pub fn apply_pattern(
        &self,
        model: &mut PeftModel<AdaLoraLayer>,
        pattern: &RankPattern,
    ) -> Result<()> {
        for (module_name, layer) in model.layers_mut() {
            let (Some(keep), Some(adapter)) =
                (pattern.get(module_name), layer.adapter_mut(&self.adapter_name))
            else {
                continue;
            };
            adapter.apply_rank_mask(keep)?;
        }
        Ok(())
    }

    /// One allocation step, to be called after the optimizer step.
    ///
    /// Before the final phase the importance is updated and ranks are
    /// masked on schedule. At its first step the final pattern is fixed and
    /// stored in the adapter config; afterwards that pattern is re-applied.
    /// Returns the pattern when ranks were masked.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn update_and_allocate(
        &mut self,
        model: &mut PeftModel<AdaLoraLayer>,
        step: usize,
        grads: &GradStore,
    ) -> Result<Option<RankPattern>> {
        let final_start = self.schedule.final_start();
        if step < final_start {
            self.update_ipt(model, grads)?;
            let (budget, mask) = self.schedule.budget(step);
            if !mask {
                return Ok(None);
            }
            let pattern = self.mask_to_budget(model, budget)?;
            model.adapter_config_mut(&self.adapter_name)?.rank_pattern = Some(pattern.clone());
            Ok(Some(pattern))
        } else if step == final_start {
            self.update_ipt(model, grads)?;
            let pattern = self.mask_to_budget(model, self.schedule.target_bgt)?;
            model.adapter_config_mut(&self.adapter_name)?.rank_pattern = Some(pattern.clone());
            self.reset_ipt();
            info!(
                adapter = %self.adapter_name,
                step,
                kept = count_kept(&pattern),
                "fixed final rank pattern"
            );
            Ok(Some(pattern))
        } else {
            let stored = model.adapter_config(&self.adapter_name)?.rank_pattern.clone();
            if let Some(pattern) = stored {
                self.apply_pattern(model, &pattern)?;
            }
            Ok(None)
        }
    }
}

fn count_kept(pattern: &RankPattern) -> usize {
    pattern
        .values()
        .map(|keep| keep.iter().filter(|k| **k).count())
        .sum()
}

impl PeftModel<AdaLoraLayer> {
    /// Orthogonality penalty of an AdaLoRA adapter, averaged over its `A` and
    /// `B` matrices and scaled by `orth_reg_weight`. Add it to the loss.
    ///
    /// # Errors
    /// Returns an error if the adapter doesn't exist.
    pub fn orthogonal_regularization(&self, adapter_name: &str) -> Result<Tensor> {
        let weight = self.adapter_config(adapter_name)?.orth_reg_weight;
        let mut total: Option<Tensor> = None;
        let mut matrices = 0usize;
        for module_name in self.adapted_modules(adapter_name) {
            let penalty = self.get_adapter(module_name, adapter_name)?.orthogonal_penalty()?;
            total = Some(match total {
                Some(acc) => acc.add(&penalty)?,
                None => penalty,
            });
            matrices += 2;
        }
        match total {
            Some(sum) => Ok(sum.affine(weight / matrices as f64, 0.0)?),
            None => Ok(Tensor::new(0f32, self.device())?),
        }
    }

    /// Shorthand for [`RankAllocator::update_and_allocate`].
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn update_and_allocate(
        &mut self,
        allocator: &mut RankAllocator,
        step: usize,
        grads: &GradStore,
    ) -> Result<Option<RankPattern>> {
        allocator.update_and_allocate(self, step, grads)
    }
}

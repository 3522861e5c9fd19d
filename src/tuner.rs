//! A frozen linear layer carrying any number of named adapters.
//!
//! [`TunerLinear`] keeps track of which adapters are active and which are
//! merged into the base weight, and routes the forward pass accordingly.

use std::collections::BTreeMap;

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use tracing::{debug, warn};

use crate::error::{PeftError, Result};
use crate::linalg::all_finite;
use crate::traits::{linear_dims, linear_with_weight, Mergeable};

/// Base linear layer plus its adapters.
pub struct TunerLinear<A> {
    /// Qualified module name, used in errors and logs
    module_name: String,
    /// Base layer; holds the merged weight while adapters are merged
    base: Linear,
    /// Adapters by name
    adapters: BTreeMap<String, A>,
    /// Adapters used by the forward pass, in activation order
    active: Vec<String>,
    /// Adapters merged into `base`, in merge order
    merged: Vec<String>,
    /// Bypass every adapter
    disabled: bool,
}

/// A merged weight computed by [`TunerLinear::prepare_merge`], not yet
/// written back to the layer.
pub(crate) struct PendingMerge {
    weight: Tensor,
    names: Vec<String>,
}

impl<A: Mergeable> TunerLinear<A> {
    /// Wrap a base layer.
    #[must_use]
    pub fn new(module_name: impl Into<String>, base: Linear) -> Self {
        Self {
            module_name: module_name.into(),
            base,
            adapters: BTreeMap::new(),
            active: Vec::new(),
            merged: Vec::new(),
            disabled: false,
        }
    }

    /// Qualified module name.
    #[must_use]
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// The base layer (with merged adapters folded in, if any).
    #[must_use]
    pub fn base(&self) -> &Linear {
        &self.base
    }

    /// `(in_features, out_features)` of the base layer.
    ///
    /// # Errors
    /// Returns an error if the base weight is not two-dimensional.
    pub fn dims(&self) -> Result<(usize, usize)> {
        linear_dims(&self.base)
    }

    /// Attach an adapter. It is not activated.
    ///
    /// # Errors
    /// Returns [`PeftError::AdapterExists`] if the name is taken.
    pub fn add_adapter(&mut self, name: impl Into<String>, adapter: A) -> Result<()> {
        let name = name.into();
        if self.adapters.contains_key(&name) {
            return Err(PeftError::AdapterExists { name });
        }
        self.adapters.insert(name, adapter);
        Ok(())
    }

    /// True if the adapter is attached to this layer.
    #[must_use]
    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Adapter by name.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&A> {
        self.adapters.get(name)
    }

    /// Mutable adapter by name.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut A> {
        self.adapters.get_mut(name)
    }

    /// All adapters, ordered by name.
    pub fn adapters(&self) -> impl Iterator<Item = (&str, &A)> {
        self.adapters.iter().map(|(name, adapter)| (name.as_str(), adapter))
    }

    /// All adapters, mutable.
    pub fn adapters_mut(&mut self) -> impl Iterator<Item = (&str, &mut A)> {
        self.adapters
            .iter_mut()
            .map(|(name, adapter)| (name.as_str(), adapter))
    }

    /// Names of the active adapters.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        &self.active
    }

    /// Names of the merged adapters, in merge order.
    #[must_use]
    pub fn merged_adapters(&self) -> &[String] {
        &self.merged
    }

    /// True if any adapter is merged into the base weight.
    #[must_use]
    pub fn is_merged(&self) -> bool {
        !self.merged.is_empty()
    }

    /// True if adapters are bypassed.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Activate the given adapters. Names not attached to this layer are
    /// ignored, so one call can address every layer of a model.
    pub fn set_active(&mut self, names: &[String]) {
        self.active = names
            .iter()
            .filter(|name| self.adapters.contains_key(name.as_str()))
            .cloned()
            .collect();
    }

    /// Bypass (or stop bypassing) every adapter. Disabling unmerges first.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        if disabled && self.is_merged() {
            self.unmerge()?;
        }
        self.disabled = disabled;
        Ok(())
    }

    /// Forward pass.
    ///
    /// # Errors
    /// Returns an error if the input does not fit the layer.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if self.disabled || self.is_merged() || self.active.is_empty() {
            return Ok(self.base.forward(input)?);
        }
        if let [name] = self.active.as_slice() {
            return self.require(name)?.forward(input, &self.base);
        }
        let weight = self.active_merged_weight()?;
        linear_with_weight(input, &weight, &self.base)
    }

    /// Base weight with every active adapter merged, without modifying the layer.
    fn active_merged_weight(&self) -> Result<Tensor> {
        let mut weight = self.base.weight().clone();
        for name in &self.active {
            weight = self.require(name)?.merge(&weight)?;
        }
        Ok(weight)
    }

    /// Merge adapters into the base weight. Already merged adapters are
    /// skipped; adapters not attached to this layer are ignored.
    ///
    /// # Errors
    /// Returns [`PeftError::NonFinite`] when `safe_merge` is set and the
    /// merged weight contains NaN or infinite values. The layer is left
    /// unchanged on any error.
    pub fn merge(&mut self, names: &[String], safe_merge: bool) -> Result<()> {
        if let Some(pending) = self.prepare_merge(names, safe_merge)? {
            self.commit_merge(pending);
        }
        Ok(())
    }

    /// Compute the weight after merging `names` without touching the layer.
    /// Returns `None` when there is nothing to merge.
    pub(crate) fn prepare_merge(
        &self,
        names: &[String],
        safe_merge: bool,
    ) -> Result<Option<PendingMerge>> {
        let mut weight = self.base.weight().clone();
        let mut merging: Vec<String> = Vec::new();
        for name in names {
            if self.merged.contains(name) || merging.contains(name) {
                warn!(module = %self.module_name, adapter = %name, "adapter already merged");
                continue;
            }
            let Some(adapter) = self.adapters.get(name) else {
                continue;
            };
            weight = adapter.merge(&weight)?;
            if safe_merge && !all_finite(&weight)? {
                return Err(PeftError::NonFinite {
                    name: name.clone(),
                    module: self.module_name.clone(),
                });
            }
            merging.push(name.clone());
        }
        Ok((!merging.is_empty()).then_some(PendingMerge {
            weight,
            names: merging,
        }))
    }

    pub(crate) fn commit_merge(&mut self, pending: PendingMerge) {
        self.base = Linear::new(pending.weight, self.base.bias().cloned());
        for name in pending.names {
            debug!(module = %self.module_name, adapter = %name, "merged adapter");
            self.merged.push(name);
        }
    }

    /// Undo every merge, most recent first.
    ///
    /// # Errors
    /// Returns an error if an adapter cannot be unmerged.
    pub fn unmerge(&mut self) -> Result<()> {
        if self.merged.is_empty() {
            warn!(module = %self.module_name, "already unmerged");
        }
        while let Some(name) = self.merged.pop() {
            let restored = self.require(&name)?.unmerge(self.base.weight())?;
            self.base = Linear::new(restored, self.base.bias().cloned());
            debug!(module = %self.module_name, adapter = %name, "unmerged adapter");
        }
        Ok(())
    }

    /// Remove an adapter. If it was the last active one, the first remaining
    /// adapter becomes active.
    ///
    /// # Errors
    /// Returns [`PeftError::AdapterMerged`] if the adapter is merged.
    pub fn delete_adapter(&mut self, name: &str) -> Result<Option<A>> {
        if self.merged.iter().any(|merged| merged == name) {
            return Err(PeftError::AdapterMerged {
                name: name.to_string(),
            });
        }
        let removed = self.adapters.remove(name);
        if removed.is_some() {
            self.active.retain(|active| active != name);
            if self.active.is_empty() {
                if let Some(first) = self.adapters.keys().next() {
                    self.active.push(first.clone());
                }
            }
        }
        Ok(removed)
    }

    /// Fold the active adapters into the weight and return the plain layer.
    ///
    /// # Errors
    /// Returns an error if merging fails.
    pub fn merge_and_unload(mut self, safe_merge: bool) -> Result<Linear> {
        let active = self.active.clone();
        self.merge(&active, safe_merge)?;
        Ok(self.base)
    }

    /// Drop every adapter and return the original base layer.
    ///
    /// # Errors
    /// Returns an error if unmerging fails.
    pub fn unload(mut self) -> Result<Linear> {
        if self.is_merged() {
            self.unmerge()?;
        }
        Ok(self.base)
    }

    fn require(&self, name: &str) -> Result<&A> {
        self.adapters
            .get(name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: name.to_string(),
            })
    }
}

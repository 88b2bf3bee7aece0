//! One AdamW optimizer and one one-cycle schedule per named sub-network.
//!
//! Gradients from a backward pass are held by the coordinator until the next
//! [`OptimizerCoordinator::zero_grad`]. [`OptimizerCoordinator::step`] pulls
//! only the named module's gradients and replaces only that module, so every
//! other field of the model is left untouched.

use crate::config::OptimizerParams;
use crate::model::{with_sub_network, ModuleName, SubNetwork, TtsModel};
use anyhow::{anyhow, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::marker::PhantomData;

/// One-cycle learning-rate schedule with cosine annealing.
///
/// Phase one rises from `initial` to `max` over the first `pct_start` of the
/// run; phase two falls from `max` to `min` over the rest. `lr()` is the rate
/// for the current step; [`Self::advance`] moves to the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct OneCycleSchedule {
    initial: f64,
    max: f64,
    min: f64,
    warmup_end: f64,
    last_step: f64,
    step: usize,
}

fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

impl OneCycleSchedule {
    pub fn new(initial: f64, max: f64, min: f64, total_steps: usize, pct_start: f64) -> Self {
        let total = total_steps.max(1) as f64;
        Self {
            initial,
            max,
            min,
            warmup_end: pct_start * total - 1.0,
            last_step: total - 1.0,
            step: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        let step = self.step as f64;
        let (start, end, from, to) = if step <= self.warmup_end {
            (self.initial, self.max, 0.0, self.warmup_end)
        } else {
            (self.max, self.min, self.warmup_end, self.last_step)
        };
        let span = to - from;
        let pct = if span > 0.0 {
            ((step - from) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        cosine_anneal(start, end, pct)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub fn step_count(&self) -> usize {
        self.step
    }
}

/// Hyperparameters for a single module's optimizer.
#[derive(Debug, Clone)]
pub struct SlotSettings {
    pub schedule: OneCycleSchedule,
    pub betas: [f32; 2],
    pub eps: f32,
    pub weight_decay: f32,
}

impl SlotSettings {
    /// Settings for `name`; fine-tuned modules get their own rate and momentum.
    pub fn for_module(
        name: ModuleName,
        params: &OptimizerParams,
        total_steps: usize,
    ) -> Self {
        if name.is_fine_tuned() {
            Self {
                schedule: OneCycleSchedule::new(
                    params.ft_lr,
                    params.ft_lr * 2.0,
                    0.0,
                    total_steps,
                    params.pct_start,
                ),
                betas: [0.0, 0.99],
                eps: params.eps,
                weight_decay: 1e-4,
            }
        } else {
            let initial = params.lr / params.div_factor;
            Self {
                schedule: OneCycleSchedule::new(
                    initial,
                    params.lr,
                    initial / params.final_div_factor,
                    total_steps,
                    params.pct_start,
                ),
                betas: params.betas,
                eps: params.eps,
                weight_decay: params.weight_decay,
            }
        }
    }
}

/// Type-erased per-module optimizer state.
trait SlotOps<B: AutodiffBackend> {
    fn step(&mut self, model: &mut TtsModel<B>, grads: &mut B::Gradients);
    fn freeze(&mut self);
    fn is_frozen(&self) -> bool;
    fn lr(&self) -> f64;
    fn set_step(&mut self, step: usize);
    fn step_count(&self) -> usize;
    fn encode_state(&self) -> Result<Vec<u8>>;
    fn load_state(&mut self, bytes: Vec<u8>, device: &B::Device) -> Result<()>;
}

struct ModuleSlot<B, M, O> {
    name: ModuleName,
    // Held in an Option so `load_record`, which consumes the optimizer, can swap it.
    optimizer: Option<O>,
    schedule: OneCycleSchedule,
    frozen: bool,
    _marker: PhantomData<(B, M)>,
}

fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
}

impl<B, M, O> SlotOps<B> for ModuleSlot<B, M, O>
where
    B: AutodiffBackend,
    M: SubNetwork<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    fn step(&mut self, model: &mut TtsModel<B>, grads: &mut B::Gradients) {
        if self.frozen {
            return;
        }
        let Some(optimizer) = self.optimizer.as_mut() else {
            return;
        };
        let module = M::get(model).clone();
        let module_grads = GradientsParams::from_module(grads, &module);
        *M::get_mut(model) = optimizer.step(self.schedule.lr(), module, module_grads);
        self.schedule.advance();
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn lr(&self) -> f64 {
        if self.frozen {
            0.0
        } else {
            self.schedule.lr()
        }
    }

    fn set_step(&mut self, step: usize) {
        self.schedule.set_step(step);
    }

    fn step_count(&self) -> usize {
        self.schedule.step_count()
    }

    fn encode_state(&self) -> Result<Vec<u8>> {
        let optimizer = self
            .optimizer
            .as_ref()
            .ok_or_else(|| anyhow!("optimizer for {} is unavailable", self.name))?;
        Recorder::<B>::record(&recorder(), optimizer.to_record(), ())
            .map_err(|e| anyhow!("failed to encode optimizer state for {}: {e:?}", self.name))
    }

    fn load_state(&mut self, bytes: Vec<u8>, device: &B::Device) -> Result<()> {
        let record = Recorder::<B>::load::<O::Record>(&recorder(), bytes, device)
            .map_err(|e| anyhow!("failed to decode optimizer state for {}: {e:?}", self.name))?;
        let optimizer = self
            .optimizer
            .take()
            .ok_or_else(|| anyhow!("optimizer for {} is unavailable", self.name))?;
        self.optimizer = Some(optimizer.load_record(record));
        Ok(())
    }
}

fn new_slot<B, M>(name: ModuleName, settings: SlotSettings) -> Box<dyn SlotOps<B>>
where
    B: AutodiffBackend,
    M: SubNetwork<B> + AutodiffModule<B> + 'static,
{
    let optimizer = AdamWConfig::new()
        .with_beta_1(settings.betas[0])
        .with_beta_2(settings.betas[1])
        .with_epsilon(settings.eps)
        .with_weight_decay(settings.weight_decay)
        .init::<B, M>();
    Box::new(ModuleSlot::<B, M, _> {
        name,
        optimizer: Some(optimizer),
        schedule: settings.schedule,
        frozen: false,
        _marker: PhantomData,
    })
}

/// Optimizers for every module of a [`TtsModel`], keyed by [`ModuleName`].
pub struct OptimizerCoordinator<B: AutodiffBackend> {
    slots: BTreeMap<ModuleName, Box<dyn SlotOps<B>>>,
    grads: Option<B::Gradients>,
}

impl<B: AutodiffBackend> OptimizerCoordinator<B> {
    /// `total_steps` is `epochs * batches_per_epoch`.
    pub fn new(params: &OptimizerParams, total_steps: usize) -> Self {
        let slots = ModuleName::ALL
            .into_iter()
            .map(|name| {
                let settings = SlotSettings::for_module(name, params, total_steps);
                (name, with_sub_network!(name, new_slot(name, settings)))
            })
            .collect();
        Self { slots, grads: None }
    }

    /// Drop gradients from the previous backward pass.
    pub fn zero_grad(&mut self) {
        self.grads = None;
    }

    /// Backpropagate `loss` and hold the gradients for subsequent steps.
    pub fn backward(&mut self, loss: Tensor<B, 1>) {
        self.grads = Some(loss.backward());
    }

    /// Update only `name`'s parameters from the held gradients.
    ///
    /// A no-op for frozen modules or when no gradients are held.
    pub fn step(&mut self, name: ModuleName, model: &mut TtsModel<B>) {
        let (Some(slot), Some(grads)) = (self.slots.get_mut(&name), self.grads.as_mut()) else {
            return;
        };
        slot.step(model, grads);
    }

    /// Stop updating `name` for the rest of the run.
    pub fn freeze(&mut self, name: ModuleName) {
        if let Some(slot) = self.slots.get_mut(&name) {
            slot.freeze();
        }
    }

    pub fn is_frozen(&self, name: ModuleName) -> bool {
        self.slots.get(&name).is_some_and(|slot| slot.is_frozen())
    }

    /// Learning rate the next `step(name)` will use; zero when frozen.
    pub fn lr(&self, name: ModuleName) -> f64 {
        self.slots.get(&name).map_or(0.0, |slot| slot.lr())
    }

    /// Schedule position of `name`.
    pub fn step_count(&self, name: ModuleName) -> usize {
        self.slots.get(&name).map_or(0, |slot| slot.step_count())
    }

    /// Move every schedule to `step`, used when resuming.
    pub fn set_step(&mut self, step: usize) {
        for slot in self.slots.values_mut() {
            slot.set_step(step);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = ModuleName> + '_ {
        self.slots.keys().copied()
    }

    /// Serialize `name`'s optimizer moments.
    pub fn encode_state(&self, name: ModuleName) -> Result<Vec<u8>> {
        self.slots
            .get(&name)
            .ok_or_else(|| anyhow!("no optimizer for {name}"))?
            .encode_state()
    }

    /// Restore `name`'s optimizer moments from [`Self::encode_state`] bytes.
    pub fn load_state(&mut self, name: ModuleName, bytes: Vec<u8>, device: &B::Device) -> Result<()> {
        self.slots
            .get_mut(&name)
            .ok_or_else(|| anyhow!("no optimizer for {name}"))?
            .load_state(bytes, device)
    }
}

//! Saving and restoring full training state.
//!
//! Weights and optimizer moments are stored per module in a
//! [`CheckpointArchive`]. Restoring honours two override lists: ignored
//! modules keep their initial weights and optimizer, frozen modules are
//! restored and then never stepped.

use crate::model::{ModuleName, TtsModel};
use crate::perf::{self, Metric};
use crate::state::TrainingState;
use crate::train::optim::OptimizerCoordinator;
use crate::weights::{ArchiveMeta, CheckpointArchive};
use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;
use std::path::{Path, PathBuf};

/// File name of the checkpoint overwritten every `save_interval_steps`.
pub const INTERIM_CHECKPOINT: &str = "current_model.safetensors";

/// File name of the checkpoint written at the end of `epoch`.
pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("epoch_{epoch:05}.safetensors")
}

/// Checkpoint paths under a log directory.
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    log_dir: PathBuf,
}

impl CheckpointPaths {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn interim(&self) -> PathBuf {
        self.log_dir.join(INTERIM_CHECKPOINT)
    }

    pub fn epoch(&self, epoch: usize) -> PathBuf {
        self.log_dir.join(epoch_checkpoint_name(epoch))
    }
}

/// Override lists resolved to module names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePolicy {
    pub load_only_params: bool,
    pub ignore: Vec<ModuleName>,
    pub freeze: Vec<ModuleName>,
}

fn parse_modules(names: &[String], list: &str) -> Vec<ModuleName> {
    let mut modules = Vec::new();
    for raw in names {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        match name.parse::<ModuleName>() {
            Ok(module) if !modules.contains(&module) => modules.push(module),
            Ok(_) => {}
            Err(_) => tracing::warn!(module = name, list, "unknown module name, ignoring"),
        }
    }
    modules
}

impl RestorePolicy {
    /// Resolve raw module lists from the configuration.
    pub fn from_lists(load_only_params: bool, ignore: &[String], freeze: &[String]) -> Self {
        Self {
            load_only_params,
            ignore: parse_modules(ignore, "ignore_modules"),
            freeze: parse_modules(freeze, "freeze_modules"),
        }
    }
}

/// What a restore did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Modules whose weights came from the checkpoint.
    pub restored: Vec<ModuleName>,
    /// Modules left at initialization by request.
    pub ignored: Vec<ModuleName>,
    /// Modules with no entry in the checkpoint.
    pub missing: Vec<ModuleName>,
    /// Modules that will not be stepped.
    pub frozen: Vec<ModuleName>,
    /// Checkpoint entries that match no module.
    pub unknown: Vec<String>,
    /// Whether optimizer moments were restored.
    pub optimizer_restored: bool,
    /// Epoch to resume from.
    pub epoch: usize,
    /// Optimization steps already taken.
    pub iters: usize,
}

impl LoadReport {
    pub fn state(&self) -> TrainingState {
        TrainingState::resumed(self.epoch, self.iters)
    }
}

/// Write every module's weights and optimizer state to `path`.
pub fn save_checkpoint<B: AutodiffBackend>(
    path: &Path,
    model: &TtsModel<B>,
    optimizer: &OptimizerCoordinator<B>,
    state: &TrainingState,
    val_loss: f32,
) -> Result<()> {
    let _span = perf::span(Metric::CheckpointSave);
    let mut archive = CheckpointArchive {
        meta: ArchiveMeta {
            iters: state.iters,
            epoch: state.epoch,
            val_loss,
        },
        ..CheckpointArchive::default()
    };
    for name in ModuleName::ALL {
        archive
            .net
            .insert(name.to_string(), model.encode_module(name)?);
        archive
            .optimizer
            .insert(name.to_string(), optimizer.encode_state(name)?);
    }
    archive.write(path)?;
    tracing::info!(path = %path.display(), iters = state.iters, epoch = state.epoch, "saved checkpoint");
    Ok(())
}

/// Restore `model` and `optimizer` from `path` according to `policy`.
pub fn load_checkpoint<B: AutodiffBackend>(
    path: &Path,
    model: &mut TtsModel<B>,
    optimizer: &mut OptimizerCoordinator<B>,
    policy: &RestorePolicy,
    device: &B::Device,
) -> Result<LoadReport> {
    let _span = perf::span(Metric::CheckpointLoad);
    let mut archive = CheckpointArchive::read(path)?;
    let mut report = LoadReport::default();

    report.unknown = archive
        .net
        .keys()
        .filter(|key| key.parse::<ModuleName>().is_err())
        .cloned()
        .collect();
    for key in &report.unknown {
        tracing::warn!(entry = %key, "checkpoint entry matches no module");
    }

    for name in ModuleName::ALL {
        if policy.ignore.contains(&name) {
            report.ignored.push(name);
            continue;
        }
        match archive.net.remove(name.as_str()) {
            Some(bytes) => {
                model.load_module(name, bytes, device)?;
                report.restored.push(name);
            }
            None => {
                tracing::warn!(module = %name, "module not found in checkpoint, keeping initial weights");
                report.missing.push(name);
            }
        }
    }

    if !policy.load_only_params {
        for name in ModuleName::ALL {
            if policy.ignore.contains(&name) {
                continue;
            }
            match archive.optimizer.remove(name.as_str()) {
                Some(bytes) => optimizer.load_state(name, bytes, device)?,
                None => tracing::warn!(module = %name, "optimizer state not found in checkpoint"),
            }
        }
        report.optimizer_restored = true;
        report.epoch = archive.meta.epoch;
        report.iters = archive.meta.iters;
        optimizer.set_step(report.iters);
    }

    for &name in &policy.freeze {
        optimizer.freeze(name);
        report.frozen.push(name);
    }

    tracing::info!(
        path = %path.display(),
        restored = report.restored.len(),
        epoch = report.epoch,
        iters = report.iters,
        "loaded checkpoint"
    );
    Ok(report)
}

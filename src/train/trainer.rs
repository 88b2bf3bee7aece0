//! Epoch loop tying loaders, the step executor, validation and checkpoints
//! together for every worker.

use crate::config::Config;
use crate::data::{DataLoader, LoaderMode, MelDataset};
use crate::download::download_if_necessary;
use crate::model::{ModelDims, TtsModel};
use crate::runtime::{launch, WorkerContext};
use crate::text::Vocabulary;
use crate::train::checkpoint::{load_checkpoint, save_checkpoint, CheckpointPaths, RestorePolicy};
use crate::train::optim::OptimizerCoordinator;
use crate::train::report::{LossAccumulator, Reporter, ScalarFileSink};
use crate::train::step::{BatchOutcome, StepExecutor};
use crate::train::validate::{ValidationLosses, Validator};
use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// File name the configuration is copied to inside `log_dir`.
pub const CONFIG_COPY: &str = "config.yml";

/// Outcome of a finished run, as seen by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub rank: usize,
    /// Epoch the run stopped at (equal to `epochs` after a full run).
    pub epoch: usize,
    pub iters: usize,
    pub best_loss: f32,
    pub trained_batches: usize,
    pub skipped_batches: usize,
    pub last_validation: Option<ValidationLosses>,
}

/// Validate `config`, resolve the pretrained checkpoint and run `workers`
/// workers on `device`. Returns the master's summary.
pub fn train<B: AutodiffBackend>(
    config: &Config,
    config_path: &Path,
    workers: usize,
    device: &B::Device,
) -> Result<TrainSummary> {
    let vocab = config.validate()?;
    let pretrained = download_if_necessary(config.pretrained_model.trim())
        .with_context(|| format!("failed to resolve {}", config.pretrained_model))?;
    let workers = workers.max(1);
    tracing::info!(
        workers,
        log_dir = %config.log_dir,
        pretrained = %pretrained.display(),
        "starting training"
    );

    let summaries = launch(workers, |ctx| {
        let run = WorkerRun {
            config,
            config_path,
            pretrained: &pretrained,
            vocab: vocab.clone(),
        };
        run.execute::<B>(ctx, device)
    })?;
    summaries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no worker reported a summary"))
}

struct WorkerRun<'a> {
    config: &'a Config,
    config_path: &'a Path,
    pretrained: &'a Path,
    vocab: Vocabulary,
}

impl WorkerRun<'_> {
    fn reporter(&self, ctx: &WorkerContext) -> Result<Reporter> {
        if !ctx.is_master() {
            return Ok(Reporter::null());
        }
        let log_dir = Path::new(&self.config.log_dir);
        fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let copy = log_dir.join(CONFIG_COPY);
        if fs::canonicalize(self.config_path).ok() != fs::canonicalize(&copy).ok() {
            fs::copy(self.config_path, &copy).with_context(|| {
                format!("failed to copy {} into {}", self.config_path.display(), log_dir.display())
            })?;
        }
        Ok(Reporter::new(ScalarFileSink::create(log_dir)?))
    }

    fn loaders(&self, ctx: &WorkerContext) -> Result<(DataLoader, DataLoader)> {
        let config = self.config;
        let data = &config.data_params;
        let train_set = MelDataset::new(&data.train_data, config, self.vocab.clone())
            .with_context(|| format!("failed to open training list {}", data.train_data))?;
        let val_set = MelDataset::new(&data.val_data, config, self.vocab.clone())
            .with_context(|| format!("failed to open validation list {}", data.val_data))?;
        let train = DataLoader::new(
            Arc::new(train_set),
            config.batch_size,
            ctx.rank,
            ctx.world_size,
            LoaderMode::Train,
            config.seed,
        );
        let val = DataLoader::new(
            Arc::new(val_set),
            config.batch_size,
            ctx.rank,
            ctx.world_size,
            LoaderMode::Validation,
            config.seed,
        );
        Ok((train, val))
    }

    fn execute<B: AutodiffBackend>(self, ctx: WorkerContext, device: &B::Device) -> Result<TrainSummary> {
        let config = self.config;
        let seed = ctx.seed(config.seed);
        let mut reporter = self.reporter(&ctx)?;
        let (train_loader, val_loader) = self.loaders(&ctx)?;
        if train_loader.is_empty() {
            tracing::warn!(rank = ctx.rank, "training shard holds less than one batch");
        }

        let dims = ModelDims::from_config(config, self.vocab.n_token());
        let mut model = TtsModel::<B>::new(&dims, config.seed, device);
        let total_steps = config.epochs * train_loader.len();
        let mut optimizer = OptimizerCoordinator::<B>::new(&config.optimizer_params, total_steps);

        let policy = RestorePolicy::from_lists(
            config.load_only_params,
            config.ignore_modules(),
            config.freeze_modules(),
        );
        let report = load_checkpoint(self.pretrained, &mut model, &mut optimizer, &policy, device)?;
        let mut state = report.state();
        if ctx.is_master() {
            tracing::info!(
                epoch = state.epoch,
                iters = state.iters,
                frozen = ?report.frozen,
                ignored = ?report.ignored,
                "restored pretrained model"
            );
        }

        let mut executor = StepExecutor::<B>::new(config, seed, device);
        let mut validator = Validator::<B::InnerBackend>::new(config, seed, device);
        let paths = CheckpointPaths::new(&config.log_dir);
        let mut summary = TrainSummary {
            rank: ctx.rank,
            epoch: state.epoch,
            iters: state.iters,
            best_loss: state.best_loss,
            trained_batches: 0,
            skipped_batches: 0,
            last_validation: None,
        };
        let mut last_val_loss = f32::INFINITY;

        for epoch in state.epoch..config.epochs {
            state.epoch = epoch;
            let mut running = LossAccumulator::default();
            let batches = train_loader.len();

            for (i, batch) in train_loader.epoch(epoch).enumerate() {
                let batch = batch.with_context(|| format!("failed to load batch {i} of epoch {epoch}"))?;
                match executor.train_batch(&mut model, &mut optimizer, &ctx, &batch, state.iters)? {
                    BatchOutcome::Trained(terms) => {
                        state.iters += 1;
                        summary.trained_batches += 1;
                        running.add(&terms.scalars());
                        if ctx.is_master() && state.iters % config.save_interval_steps == 0 {
                            save_checkpoint(&paths.interim(), &model, &optimizer, &state, last_val_loss)?;
                        }
                    }
                    BatchOutcome::Skipped(_) => summary.skipped_batches += 1,
                }

                if (i + 1) % config.log_interval == 0 && running.count() > 0 {
                    if ctx.is_master() {
                        tracing::info!(
                            "Epoch [{}/{}], Step [{}/{}], Mel Loss: {:.5}, Gen Loss: {:.5}, Disc Loss: {:.5}, Dur Loss: {:.5}, CE Loss: {:.5}, Norm Loss: {:.5}, F0 Loss: {:.5}",
                            epoch + 1,
                            config.epochs,
                            i + 1,
                            batches,
                            running.mean("train/mel_loss"),
                            running.mean("train/gen_loss"),
                            running.mean("train/d_loss"),
                            running.mean("train/dur_loss"),
                            running.mean("train/ce_loss"),
                            running.mean("train/norm_loss"),
                            running.mean("train/F0_loss"),
                        );
                    }
                    reporter.scalars(&running.drain(), state.iters)?;
                }
            }

            let validation = validator.run(&model.valid(), &val_loader, epoch, &ctx)?;
            last_val_loss = validation.mel;
            summary.last_validation = Some(validation);
            if ctx.is_master() {
                tracing::info!(
                    epoch = epoch + 1,
                    mel = validation.mel,
                    dur = validation.dur,
                    f0 = validation.f0,
                    "validation"
                );
                reporter.scalars(&validation.scalars(), epoch + 1)?;
                reporter.flush()?;
            }

            if (epoch + 1) % config.save_freq == 0 {
                if state.observe_validation(validation.mel) && ctx.is_master() {
                    tracing::info!(best_loss = state.best_loss, "new best validation loss");
                }
                if ctx.is_master() {
                    save_checkpoint(&paths.epoch(epoch), &model, &optimizer, &state, validation.mel)?;
                }
            }
        }

        state.epoch = state.epoch.max(config.epochs);
        reporter.flush()?;
        summary.epoch = state.epoch;
        summary.iters = state.iters;
        summary.best_loss = state.best_loss;
        Ok(summary)
    }
}

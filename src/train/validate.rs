//! Held-out evaluation and cross-worker reduction.

use crate::config::Config;
use crate::data::DataLoader;
use crate::losses::{l1, MultiResolutionStftLoss};
use crate::model::TtsModel;
use crate::perf::{self, Metric};
use crate::runtime::WorkerContext;
use crate::train::sampler::SegmentSampler;
use crate::train::step::{duration_losses, forward_pass, scalar, DecoderAlignment};
use anyhow::Result;
use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Validation losses averaged over batches, then over workers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidationLosses {
    pub mel: f32,
    pub dur: f32,
    pub f0: f32,
    /// Batches this worker evaluated.
    pub batches: usize,
    /// Batches this worker skipped.
    pub skipped: usize,
}

impl ValidationLosses {
    pub fn scalars(&self) -> [(&'static str, f32); 3] {
        [
            ("eval/mel_loss", self.mel),
            ("eval/dur_loss", self.dur),
            ("eval/F0_loss", self.f0),
        ]
    }
}

/// Per-worker sums before reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocalSums {
    pub mel: f64,
    pub dur: f64,
    pub f0: f64,
    pub count: usize,
}

impl LocalSums {
    /// `(mel, dur, f0)` averaged over this worker's batches; zero when none ran.
    pub fn averages(&self) -> (f64, f64, f64) {
        let n = self.count.max(1) as f64;
        (self.mel / n, self.dur / n, self.f0 / n)
    }

    /// Average of per-worker averages, identical on every worker.
    pub fn reduce(&self, ctx: &WorkerContext) -> Result<(f64, f64, f64)> {
        let (mel, dur, f0) = self.averages();
        Ok((
            ctx.all_reduce_mean("loss_test", mel)?,
            ctx.all_reduce_mean("loss_align", dur)?,
            ctx.all_reduce_mean("loss_f", f0)?,
        ))
    }
}

/// Evaluates an inference-mode model over one worker's validation shard.
pub struct Validator<B: Backend> {
    device: B::Device,
    sampler: SegmentSampler,
    stft_loss: MultiResolutionStftLoss<B>,
    rng: StdRng,
}

impl<B: Backend> Validator<B> {
    pub fn new(config: &Config, seed: u64, device: &B::Device) -> Self {
        Self {
            device: device.clone(),
            sampler: SegmentSampler::new(
                config.frame_scale(),
                config.preprocess_params.spect_params.hop_length,
            ),
            stft_loss: MultiResolutionStftLoss::new(&config.loss_params.stft_resolutions, device),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Accumulate losses over this worker's shard without reducing.
    pub fn accumulate(&mut self, model: &TtsModel<B>, loader: &DataLoader, epoch: usize) -> Result<(LocalSums, usize)> {
        let mut sums = LocalSums::default();
        let mut skipped = 0;
        for batch in loader.epoch(epoch) {
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable validation batch");
                    skipped += 1;
                    continue;
                }
            };
            let pass = match forward_pass(
                model,
                &batch,
                &self.sampler,
                &mut self.rng,
                None,
                DecoderAlignment::Hard,
                &self.device,
            )? {
                Ok(pass) => pass,
                Err(reason) => {
                    tracing::debug!(%reason, "skipping validation batch");
                    skipped += 1;
                    continue;
                }
            };
            let (_, dur) = duration_losses(pass.duration_logits, &pass.durations, &batch.input_lengths);
            let mel = self.stft_loss.forward(pass.predicted_wave, pass.wave);
            let f0 = l1(pass.f0_real, pass.f0_fake).div_scalar(10.0);

            sums.mel += f64::from(scalar(mel));
            sums.dur += f64::from(scalar(dur));
            sums.f0 += f64::from(scalar(f0));
            sums.count += 1;
            perf::add_count(Metric::ValidationBatches, 1);
        }
        Ok((sums, skipped))
    }

    /// Full pass: accumulate locally, then reduce across workers.
    pub fn run(
        &mut self,
        model: &TtsModel<B>,
        loader: &DataLoader,
        epoch: usize,
        ctx: &WorkerContext,
    ) -> Result<ValidationLosses> {
        let _span = perf::span(Metric::Validation);
        let (sums, skipped) = self.accumulate(model, loader, epoch)?;
        let (mel, dur, f0) = sums.reduce(ctx)?;
        Ok(ValidationLosses {
            mel: mel as f32,
            dur: dur as f32,
            f0: f0 as f32,
            batches: sums.count,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::launch;

    #[test]
    fn reduction_is_average_of_worker_averages() {
        // Worker sums {2, 9, 0} over counts {1, 3, 0}: averages {2, 3, 0}.
        let inputs = [(2.0, 1), (9.0, 3), (0.0, 0)];
        let results = launch(3, |ctx| {
            let (sum, count) = inputs[ctx.rank];
            let sums = LocalSums {
                mel: sum,
                dur: sum * 2.0,
                f0: 0.0,
                count,
            };
            sums.reduce(&ctx)
        })
        .expect("launch");
        for (mel, dur, f0) in results {
            assert!((mel - 5.0 / 3.0).abs() < 1e-12);
            assert!((dur - 10.0 / 3.0).abs() < 1e-12);
            assert_eq!(f0, 0.0);
        }
    }
}

//! One minibatch through the full graph and the two-phase update.
//!
//! A batch moves through `load -> align -> sample -> discriminator update ->
//! generator update -> commit`. Alignment and sampling may decide to skip the
//! batch; that is an ordinary [`BatchOutcome::Skipped`], not an error. Every
//! batch, trained or skipped, passes the `discriminator` and `generator` sync
//! points so workers stay in lockstep.

use crate::align::monotonic_alignment;
use crate::config::{Config, LossParams};
use crate::data::Batch;
use crate::error::{SkipReason, TrainError};
use crate::losses::{
    bce_with_logits, cross_entropy, discriminator_loss, generator_loss, l1, log_norm, smooth_l1,
    MultiResolutionStftLoss,
};
use crate::model::{ModuleName, TtsModel};
use crate::modules::mask::valid_mask;
use crate::perf::{self, Metric};
use crate::runtime::WorkerContext;
use crate::train::optim::OptimizerCoordinator;
use crate::train::sampler::{window_len, Segment, SegmentSampler};
use anyhow::{anyhow, Result};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;

/// Sync point after the discriminator phase.
pub const SYNC_DISCRIMINATOR: &str = "discriminator";
/// Sync point after the generator phase.
pub const SYNC_GENERATOR: &str = "generator";

/// Scalar loss terms of one trained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTerms {
    pub mel: f32,
    pub gen: f32,
    pub disc: f32,
    pub ce: f32,
    pub dur: f32,
    pub s2s: f32,
    pub mono: f32,
    pub f0: f32,
    pub norm: f32,
    pub total: f32,
}

impl LossTerms {
    /// Reported scalars keyed by their dashboard tags.
    pub fn scalars(&self) -> [(&'static str, f32); 9] {
        [
            ("train/mel_loss", self.mel),
            ("train/gen_loss", self.gen),
            ("train/d_loss", self.disc),
            ("train/ce_loss", self.ce),
            ("train/dur_loss", self.dur),
            ("train/norm_loss", self.norm),
            ("train/F0_loss", self.f0),
            ("train/s2s_loss", self.s2s),
            ("train/mono_loss", self.mono),
        ]
    }
}

/// Result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Trained(LossTerms),
    Skipped(SkipReason),
}

/// Which alignment feeds the decoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecoderAlignment {
    /// Soft or hard with equal probability.
    CoinFlip,
    /// Always the hard path.
    Hard,
}

/// Everything the loss terms need from one forward pass.
pub(crate) struct ForwardPass<B: Backend> {
    pub attention: Tensor<B, 3>,
    pub alignment: Tensor<B, 3>,
    pub s2s_logits: Tensor<B, 3>,
    pub duration_logits: Tensor<B, 3>,
    /// Hard-path frame counts per text position, row-major `[batch, text]`.
    pub durations: Vec<f32>,
    pub wave: Tensor<B, 2>,
    pub f0_real: Tensor<B, 2>,
    pub norm_real: Tensor<B, 2>,
    pub f0_fake: Tensor<B, 2>,
    pub norm_fake: Tensor<B, 2>,
    pub predicted_wave: Tensor<B, 2>,
}

/// Lengths must be positive and fit the padded extents.
pub(crate) fn check_lengths(batch: &Batch, frame_scale: usize) -> Result<(), SkipReason> {
    if batch.is_empty() {
        return Err(SkipReason::InvalidLengths("empty batch".into()));
    }
    if batch.waves.len() != batch.len() || batch.mel_lengths.len() != batch.len() {
        return Err(SkipReason::InvalidLengths("per-example arrays disagree".into()));
    }
    let (max_text, max_mel) = (batch.max_text_len(), batch.max_mel_len());
    for (i, (&text, &mel)) in batch.input_lengths.iter().zip(&batch.mel_lengths).enumerate() {
        if text == 0 || text > max_text {
            return Err(SkipReason::InvalidLengths(format!(
                "example {i}: text length {text} outside 1..={max_text}"
            )));
        }
        if mel < frame_scale || mel > max_mel {
            return Err(SkipReason::InvalidLengths(format!(
                "example {i}: mel length {mel} outside {frame_scale}..={max_mel}"
            )));
        }
    }
    Ok(())
}

fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("tensor readback failed: {e:?}"))
}

pub(crate) fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f32 {
    tensor.into_scalar().elem::<f32>()
}

/// Stack per-example time windows of a `[batch, channels, time]` tensor.
fn gather_windows<B: Backend>(
    tensor: Tensor<B, 3>,
    ranges: impl Iterator<Item = Range<usize>>,
) -> Tensor<B, 3> {
    let parts = ranges
        .enumerate()
        .map(|(b, range)| {
            tensor
                .clone()
                .narrow(0, b, 1)
                .narrow(2, range.start, range.len())
        })
        .collect();
    Tensor::cat(parts, 0)
}

fn wave_windows<B: Backend>(
    waves: &[Vec<f32>],
    segments: &[Segment],
    device: &B::Device,
) -> Tensor<B, 2> {
    let len = segments.first().map_or(0, |s| s.wave.len());
    let mut flat = Vec::with_capacity(waves.len() * len);
    for (wave, segment) in waves.iter().zip(segments) {
        flat.extend_from_slice(&wave[segment.wave.clone()]);
    }
    Tensor::from_data(TensorData::new(flat, [segments.len(), len]), device)
}

/// Align, sample and run the generator side of the model.
///
/// Returns `Ok(Err(reason))` when the batch must be skipped.
pub(crate) fn forward_pass<B: Backend>(
    model: &TtsModel<B>,
    batch: &Batch,
    sampler: &SegmentSampler,
    rng: &mut StdRng,
    window_cap: Option<usize>,
    decoder_alignment: DecoderAlignment,
    device: &B::Device,
) -> Result<Result<ForwardPass<B>, SkipReason>> {
    let frame_scale = model.text_aligner.frame_scale();
    if let Err(reason) = check_lengths(batch, frame_scale) {
        return Ok(Err(reason));
    }
    let inputs = batch.to_device::<B>(device);
    let max_text = batch.max_text_len();

    let align_span = perf::span(Metric::Align);
    let aligned = model
        .text_aligner
        .forward(inputs.mels.clone(), inputs.texts.clone(), &batch.input_lengths);
    let [_, _, frames] = aligned.attention.dims();
    let attention_host = host_values(aligned.attention.clone())?;
    if attention_host.iter().any(|v| !v.is_finite()) {
        return Ok(Err(SkipReason::NonFiniteAttention));
    }
    let frame_lengths: Vec<usize> = batch
        .mel_lengths
        .iter()
        .map(|&len| (len / frame_scale).min(frames))
        .collect();
    let mask = valid_mask::<B>(&batch.input_lengths, &frame_lengths, max_text, frames, device);
    let alignment = monotonic_alignment(aligned.attention.clone().detach(), mask)?;
    drop(align_span);

    let path = host_values(alignment.clone())?;
    let durations: Vec<f32> = path
        .chunks(frames.max(1))
        .map(|row| row.iter().sum())
        .collect();

    let text_encoding = model
        .text_encoder
        .forward(inputs.texts.clone(), &batch.input_lengths);
    let use_soft = match decoder_alignment {
        DecoderAlignment::CoinFlip => rng.gen::<bool>(),
        DecoderAlignment::Hard => false,
    };
    let decoder_alignment = if use_soft {
        aligned.attention.clone()
    } else {
        alignment.clone()
    };
    let asr = text_encoding.clone().matmul(decoder_alignment);

    let style_full = model.style_encoder.forward(inputs.mels.clone());
    let (duration_logits, prosody) = model.predictor.forward(
        text_encoding,
        style_full,
        &batch.input_lengths,
        alignment.clone(),
    );

    let window = window_len(&batch.mel_lengths, frame_scale, window_cap);
    let wave_lengths: Vec<usize> = batch.waves.iter().map(Vec::len).collect();
    let segments = match sampler.sample(rng, window, &batch.mel_lengths, &wave_lengths) {
        Ok(segments) => segments,
        Err(reason) => return Ok(Err(reason)),
    };

    let en = gather_windows(asr, segments.iter().map(|s| s.frames.clone()));
    let p_en = gather_windows(prosody, segments.iter().map(|s| s.frames.clone()));
    let gt = gather_windows(inputs.mels, segments.iter().map(|s| s.mel.clone())).detach();
    let wave = wave_windows::<B>(&batch.waves, &segments, device);

    let style = model.style_encoder.forward(gt.clone());
    let f0_real = model.pitch_extractor.forward(gt.clone()).detach();
    let norm_real = log_norm(gt).detach();
    let (f0_fake, norm_fake) = model.predictor.f0n_train(p_en, style.clone());
    let predicted_wave = model
        .decoder
        .forward(en, f0_fake.clone(), norm_fake.clone(), style);

    Ok(Ok(ForwardPass {
        attention: aligned.attention,
        alignment,
        s2s_logits: aligned.s2s_logits,
        duration_logits,
        durations,
        wave,
        f0_real,
        norm_real,
        f0_fake,
        norm_fake,
        predicted_wave,
    }))
}

/// Duration classification and regression losses, averaged over the batch.
///
/// Position `x` of example `b` is a multi-label target with the first
/// `durations[b][x]` bins set. The L1 term compares summed sigmoids against
/// the durations over the interior positions `1..len-1`, so examples with
/// fewer than three tokens contribute nothing to it.
pub(crate) fn duration_losses<B: Backend>(
    duration_logits: Tensor<B, 3>,
    durations: &[f32],
    input_lengths: &[usize],
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let [batch, text_len, max_dur] = duration_logits.dims();
    let device = duration_logits.device();
    let mut ce = Tensor::<B, 1>::zeros([1], &device);
    let mut dur = Tensor::<B, 1>::zeros([1], &device);
    for (b, &len) in input_lengths.iter().enumerate().take(batch) {
        let len = len.min(text_len);
        if len == 0 {
            continue;
        }
        let row = &durations[b * text_len..b * text_len + len];
        let logits = duration_logits
            .clone()
            .narrow(0, b, 1)
            .narrow(1, 0, len)
            .reshape([len, max_dur]);

        let mut target = vec![0.0f32; len * max_dur];
        for (x, &d) in row.iter().enumerate() {
            let filled = (d.max(0.0) as usize).min(max_dur);
            target[x * max_dur..x * max_dur + filled].fill(1.0);
        }
        let target = Tensor::<B, 2>::from_data(TensorData::new(target, [len, max_dur]), &device);
        ce = ce + bce_with_logits(logits.clone(), target);

        if len >= 3 {
            let predicted = sigmoid(logits).sum_dim(1).reshape([len]).narrow(0, 1, len - 2);
            let expected = Tensor::<B, 1>::from_data(
                TensorData::new(row[1..len - 1].to_vec(), [len - 2]),
                &device,
            );
            dur = dur + l1(predicted, expected);
        }
    }
    let n = batch.max(1) as f32;
    (ce.div_scalar(n), dur.div_scalar(n))
}

/// Token cross-entropy of the aligner, averaged over the batch.
fn s2s_loss<B: Backend>(s2s_logits: Tensor<B, 3>, batch: &Batch) -> Tensor<B, 1> {
    let [n, text_len, n_token] = s2s_logits.dims();
    let device = s2s_logits.device();
    let mut total = Tensor::<B, 1>::zeros([1], &device);
    for (b, &len) in batch.input_lengths.iter().enumerate().take(n) {
        let len = len.min(text_len);
        if len == 0 {
            continue;
        }
        let logits = s2s_logits
            .clone()
            .narrow(0, b, 1)
            .narrow(1, 0, len)
            .reshape([len, n_token]);
        let targets = &batch.texts[b * text_len..b * text_len + len];
        total = total + cross_entropy(logits, targets);
    }
    total.div_scalar(n.max(1) as f32)
}

/// Runs batches for one worker.
pub struct StepExecutor<B: AutodiffBackend> {
    device: B::Device,
    sampler: SegmentSampler,
    stft_loss: MultiResolutionStftLoss<B>,
    lambdas: LossParams,
    max_len: usize,
    rng: StdRng,
}

impl<B: AutodiffBackend> StepExecutor<B> {
    /// `seed` should already be offset by the worker rank.
    pub fn new(config: &Config, seed: u64, device: &B::Device) -> Self {
        Self {
            device: device.clone(),
            sampler: SegmentSampler::new(
                config.frame_scale(),
                config.preprocess_params.spect_params.hop_length,
            ),
            stft_loss: MultiResolutionStftLoss::new(&config.loss_params.stft_resolutions, device),
            lambdas: config.loss_params.clone(),
            max_len: config.max_len,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Loss weights, exposed so callers can adjust a term between batches.
    pub fn lambdas_mut(&mut self) -> &mut LossParams {
        &mut self.lambdas
    }

    /// Train on one batch. `step` is the number of optimization steps taken so
    /// far and is only used to label a divergence error.
    pub fn train_batch(
        &mut self,
        model: &mut TtsModel<B>,
        optimizer: &mut OptimizerCoordinator<B>,
        ctx: &WorkerContext,
        batch: &Batch,
        step: usize,
    ) -> Result<BatchOutcome> {
        let pass = match forward_pass(
            model,
            batch,
            &self.sampler,
            &mut self.rng,
            Some(self.max_len),
            DecoderAlignment::CoinFlip,
            &self.device,
        )? {
            Ok(pass) => pass,
            Err(reason) => {
                tracing::debug!(rank = ctx.rank, %reason, "skipping batch");
                perf::add_count(Metric::BatchesSkipped, 1);
                ctx.sync_point(SYNC_DISCRIMINATOR)?;
                ctx.sync_point(SYNC_GENERATOR)?;
                return Ok(BatchOutcome::Skipped(reason));
            }
        };

        let disc = {
            let _span = perf::span(Metric::DiscriminatorPhase);
            optimizer.zero_grad();
            let fake = pass.predicted_wave.clone().detach();
            let d_loss = discriminator_loss(
                &model.mpd.forward(pass.wave.clone()),
                &model.mpd.forward(fake.clone()),
            ) + discriminator_loss(
                &model.msd.forward(pass.wave.clone()),
                &model.msd.forward(fake),
            );
            let value = scalar(d_loss.clone());
            optimizer.backward(d_loss);
            for name in ModuleName::DISCRIMINATORS {
                optimizer.step(name, model);
            }
            value
        };
        ctx.sync_point(SYNC_DISCRIMINATOR)?;

        let terms = {
            let _span = perf::span(Metric::GeneratorPhase);
            optimizer.zero_grad();
            let mel = self
                .stft_loss
                .forward(pass.predicted_wave.clone(), pass.wave.clone());
            let gen = generator_loss(
                &model.mpd.forward(pass.wave.clone()),
                &model.mpd.forward(pass.predicted_wave.clone()),
            ) + generator_loss(
                &model.msd.forward(pass.wave.clone()),
                &model.msd.forward(pass.predicted_wave.clone()),
            );
            let (ce, dur) =
                duration_losses(pass.duration_logits, &pass.durations, &batch.input_lengths);
            let s2s = s2s_loss(pass.s2s_logits, batch);
            let mono = l1(pass.attention, pass.alignment).mul_scalar(10.0);
            let f0 = smooth_l1(pass.f0_real, pass.f0_fake).div_scalar(10.0);
            let norm = smooth_l1(pass.norm_real, pass.norm_fake);

            let lambdas = &self.lambdas;
            let total = mel.clone().mul_scalar(lambdas.lambda_mel)
                + f0.clone().mul_scalar(lambdas.lambda_f0)
                + ce.clone().mul_scalar(lambdas.lambda_ce)
                + norm.clone().mul_scalar(lambdas.lambda_norm)
                + dur.clone().mul_scalar(lambdas.lambda_dur)
                + gen.clone().mul_scalar(lambdas.lambda_gen)
                + mono.clone().mul_scalar(lambdas.lambda_mono)
                + s2s.clone().mul_scalar(lambdas.lambda_s2s);

            let total_value = scalar(total.clone());
            if !total_value.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    step,
                    value: total_value,
                }
                .into());
            }
            let terms = LossTerms {
                mel: scalar(mel),
                gen: scalar(gen),
                disc,
                ce: scalar(ce),
                dur: scalar(dur),
                s2s: scalar(s2s),
                mono: scalar(mono),
                f0: scalar(f0),
                norm: scalar(norm),
                total: total_value,
            };

            optimizer.backward(total);
            for name in ModuleName::GENERATOR {
                optimizer.step(name, model);
            }
            terms
        };
        ctx.sync_point(SYNC_GENERATOR)?;
        perf::add_count(Metric::BatchesTrained, 1);
        Ok(BatchOutcome::Trained(terms))
    }
}

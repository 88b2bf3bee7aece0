//! Multi-period and multi-scale waveform discriminators.

use super::ModelDims;
use crate::modules::{Conv1d, ParamInit};
use burn::module::Module;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::Linear;

/// Scores and intermediate features, one entry per sub-discriminator.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput<B: Backend> {
    /// `[batch, frames]` realness scores.
    pub scores: Vec<Tensor<B, 2>>,
    /// Hidden activations used for feature matching.
    pub features: Vec<Tensor<B, 3>>,
}

/// Right-pad with zeros so the signal holds at least `min_len` samples.
fn ensure_len<B: Backend>(wave: Tensor<B, 2>, min_len: usize) -> Tensor<B, 2> {
    let [batch, samples] = wave.dims();
    if samples >= min_len {
        return wave;
    }
    let zeros = Tensor::zeros([batch, min_len - samples], &wave.device());
    Tensor::cat(vec![wave, zeros], 1)
}

/// Views the signal as `[batch, samples / period, period]`.
#[derive(Module, Debug)]
pub struct PeriodDiscriminator<B: Backend> {
    hidden: Linear<B>,
    out: Linear<B>,
    period: usize,
}

impl<B: Backend> PeriodDiscriminator<B> {
    fn forward(&self, wave: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let wave = ensure_len(wave, self.period);
        let [batch, samples] = wave.dims();
        let frames = samples / self.period;
        let folded = wave
            .narrow(1, 0, frames * self.period)
            .reshape([batch, frames, self.period]);
        let features = leaky_relu(self.hidden.forward(folded), 0.1);
        let score = self.out.forward(features.clone()).reshape([batch, frames]);
        (score, features)
    }
}

#[derive(Module, Debug)]
pub struct MultiPeriodDiscriminator<B: Backend> {
    discriminators: Vec<PeriodDiscriminator<B>>,
}

impl<B: Backend> MultiPeriodDiscriminator<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        let discriminators = dims
            .mpd_periods
            .iter()
            .map(|&period| PeriodDiscriminator {
                hidden: init.linear(period, dims.disc_channels, device),
                out: init.linear(dims.disc_channels, 1, device),
                period,
            })
            .collect();
        Self { discriminators }
    }

    /// Score a `[batch, samples]` waveform.
    pub fn forward(&self, wave: Tensor<B, 2>) -> DiscriminatorOutput<B> {
        let (scores, features) = self
            .discriminators
            .iter()
            .map(|d| d.forward(wave.clone()))
            .unzip();
        DiscriminatorOutput { scores, features }
    }
}

/// Average-pools the signal by `scale` and applies two convolutions.
#[derive(Module, Debug)]
pub struct ScaleDiscriminator<B: Backend> {
    conv: Conv1d<B>,
    out: Conv1d<B>,
    scale: usize,
}

impl<B: Backend> ScaleDiscriminator<B> {
    fn forward(&self, wave: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 3>) {
        let wave = ensure_len(wave, self.scale);
        let [batch, samples] = wave.dims();
        let frames = samples / self.scale;
        let pooled = wave
            .narrow(1, 0, frames * self.scale)
            .reshape([batch, frames, self.scale])
            .mean_dim(2)
            .reshape([batch, 1, frames]);
        let features = leaky_relu(self.conv.forward(pooled), 0.1);
        let score = self.out.forward(features.clone()).reshape([batch, frames]);
        (score, features)
    }
}

#[derive(Module, Debug)]
pub struct MultiScaleDiscriminator<B: Backend> {
    discriminators: Vec<ScaleDiscriminator<B>>,
}

impl<B: Backend> MultiScaleDiscriminator<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        let discriminators = dims
            .msd_scales
            .iter()
            .map(|&scale| ScaleDiscriminator {
                conv: init.conv1d(1, dims.disc_channels, 15, 1, device),
                out: init.conv1d(dims.disc_channels, 1, 3, 1, device),
                scale,
            })
            .collect();
        Self { discriminators }
    }

    /// Score a `[batch, samples]` waveform.
    pub fn forward(&self, wave: Tensor<B, 2>) -> DiscriminatorOutput<B> {
        let (scores, features) = self
            .discriminators
            .iter()
            .map(|d| d.forward(wave.clone()))
            .unzip();
        DiscriminatorOutput { scores, features }
    }
}

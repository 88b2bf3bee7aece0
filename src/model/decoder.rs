//! Waveform decoder and the frozen pitch extractor.

use super::ModelDims;
use crate::modules::ParamInit;
use burn::module::Module;
use burn::tensor::activation::{leaky_relu, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::Linear;

/// Maps each aligner frame plus its pitch/energy samples to `frame_scale * hop` samples.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    proj: Linear<B>,
    out: Linear<B>,
    frame_scale: usize,
    samples_per_frame: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        let samples_per_frame = dims.frame_scale * dims.hop_length;
        Self {
            proj: init.linear(
                dims.hidden_dim + 2 * dims.frame_scale + dims.style_dim,
                dims.hidden_dim,
                device,
            ),
            out: init.linear(dims.hidden_dim, samples_per_frame, device),
            frame_scale: dims.frame_scale,
            samples_per_frame,
        }
    }

    /// `asr` is `[batch, hidden, frames]`; `f0`/`energy` are `[batch, frames * frame_scale]`.
    /// Returns `[batch, frames * frame_scale * hop]` samples.
    pub fn forward(
        &self,
        asr: Tensor<B, 3>,
        f0: Tensor<B, 2>,
        energy: Tensor<B, 2>,
        style: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [batch, _, frames] = asr.dims();
        let [_, style_dim] = style.dims();
        let joint = Tensor::cat(
            vec![
                asr.swap_dims(1, 2),
                f0.reshape([batch, frames, self.frame_scale]),
                energy.reshape([batch, frames, self.frame_scale]),
                style.reshape([batch, 1, style_dim]).repeat_dim(1, frames),
            ],
            2,
        );
        let hidden = leaky_relu(self.proj.forward(joint), 0.2);
        tanh(self.out.forward(hidden)).reshape([batch, frames * self.samples_per_frame])
    }
}

/// Per-frame pitch estimate `[batch, time]` from mels `[batch, n_mels, time]`.
///
/// Never stepped by the trainer; its output is used as a detached target.
#[derive(Module, Debug)]
pub struct PitchExtractor<B: Backend> {
    proj: Linear<B>,
}

impl<B: Backend> PitchExtractor<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            proj: init.linear(dims.n_mels, 1, device),
        }
    }

    pub fn forward(&self, mels: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _, time] = mels.dims();
        self.proj.forward(mels.swap_dims(1, 2)).reshape([batch, time])
    }
}

//! Text-to-mel attention aligner.

use super::ModelDims;
use crate::modules::ParamInit;
use burn::module::Module;
use burn::tensor::activation::{softmax, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_nn::{Embedding, Linear};

/// Soft attention and token predictions from the aligner.
#[derive(Debug, Clone)]
pub struct AlignerOutput<B: Backend> {
    /// `[batch, text, frames]`; every frame is a distribution over text positions.
    pub attention: Tensor<B, 3>,
    /// `[batch, text, n_token]` token logits per text position.
    pub s2s_logits: Tensor<B, 3>,
}

/// Groups `frame_scale` mel frames into one aligner frame and attends over the text.
#[derive(Module, Debug)]
pub struct TextAligner<B: Backend> {
    mel_proj: Linear<B>,
    embed: Embedding<B>,
    s2s_proj: Linear<B>,
    frame_scale: usize,
    hidden_dim: usize,
}

impl<B: Backend> TextAligner<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            mel_proj: init.linear(dims.n_mels * dims.frame_scale, dims.hidden_dim, device),
            embed: init.embedding(dims.n_token, dims.hidden_dim, device),
            s2s_proj: init.linear(dims.hidden_dim, dims.n_token, device),
            frame_scale: dims.frame_scale,
            hidden_dim: dims.hidden_dim,
        }
    }

    /// Mel frames per aligner frame.
    pub fn frame_scale(&self) -> usize {
        self.frame_scale
    }

    /// Aligner frames produced for `mel_frames` input frames.
    pub fn frames(&self, mel_frames: usize) -> usize {
        mel_frames / self.frame_scale
    }

    /// `mels` is `[batch, n_mels, time]`, `texts` is `[batch, text]`.
    pub fn forward(
        &self,
        mels: Tensor<B, 3>,
        texts: Tensor<B, 2, Int>,
        input_lengths: &[usize],
    ) -> AlignerOutput<B> {
        let [batch, n_mels, _] = mels.dims();
        let [_, text_len] = texts.dims();
        let frames = self.frames(mels.dims()[2]);
        let device = mels.device();

        let grouped = mels
            .narrow(2, 0, frames * self.frame_scale)
            .swap_dims(1, 2)
            .reshape([batch, frames, n_mels * self.frame_scale]);
        let hidden = tanh(self.mel_proj.forward(grouped));
        let embedded = self.embed.forward(texts);

        let scores = embedded
            .matmul(hidden.clone().swap_dims(1, 2))
            .div_scalar((self.hidden_dim as f32).sqrt());

        // Large negative bias on padded text rows.
        let bias: Vec<f32> = input_lengths
            .iter()
            .flat_map(|&len| (0..text_len).map(move |x| if x < len { 0.0 } else { -1e4 }))
            .collect();
        let bias = Tensor::<B, 3>::from_data(TensorData::new(bias, [batch, text_len, 1]), &device);
        let attention = softmax(scores + bias, 1);

        let context = attention.clone().matmul(hidden);
        AlignerOutput {
            attention,
            s2s_logits: self.s2s_proj.forward(context),
        }
    }
}

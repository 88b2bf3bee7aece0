//! Text and style encoders.

use super::ModelDims;
use crate::modules::{Conv1d, ParamInit};
use burn::module::Module;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_nn::{Embedding, Linear};

/// Token embedding followed by a masked convolution, producing `[batch, hidden, text]`.
#[derive(Module, Debug)]
pub struct TextEncoder<B: Backend> {
    embed: Embedding<B>,
    conv: Conv1d<B>,
}

impl<B: Backend> TextEncoder<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            embed: init.embedding(dims.n_token, dims.hidden_dim, device),
            conv: init.conv1d(dims.hidden_dim, dims.hidden_dim, 5, 1, device),
        }
    }

    pub fn forward(&self, texts: Tensor<B, 2, Int>, input_lengths: &[usize]) -> Tensor<B, 3> {
        let [batch, text_len] = texts.dims();
        let device = texts.device();
        let keep: Vec<f32> = input_lengths
            .iter()
            .flat_map(|&len| (0..text_len).map(move |x| if x < len { 1.0 } else { 0.0 }))
            .collect();
        let keep = Tensor::<B, 3>::from_data(TensorData::new(keep, [batch, 1, text_len]), &device);

        let x = self.embed.forward(texts).swap_dims(1, 2) * keep.clone();
        leaky_relu(self.conv.forward(x), 0.2) * keep
    }
}

/// Mel convolution, time average and projection to a style vector `[batch, style]`.
#[derive(Module, Debug)]
pub struct StyleEncoder<B: Backend> {
    conv: Conv1d<B>,
    proj: Linear<B>,
}

impl<B: Backend> StyleEncoder<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        Self {
            conv: init.conv1d(dims.n_mels, dims.hidden_dim, 3, 1, device),
            proj: init.linear(dims.hidden_dim, dims.style_dim, device),
        }
    }

    pub fn forward(&self, mels: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _, _] = mels.dims();
        let hidden = leaky_relu(self.conv.forward(mels), 0.2);
        let [_, channels, _] = hidden.dims();
        let pooled = hidden.mean_dim(2).reshape([batch, channels]);
        self.proj.forward(pooled)
    }
}

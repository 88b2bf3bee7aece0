//! Duration and prosody predictor.

use super::ModelDims;
use crate::modules::ParamInit;
use burn::module::Module;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_nn::Linear;

/// Predicts per-token duration logits and frame-level pitch/energy.
#[derive(Module, Debug)]
pub struct ProsodyPredictor<B: Backend> {
    text_proj: Linear<B>,
    duration_proj: Linear<B>,
    f0n_proj: Linear<B>,
    frame_scale: usize,
}

/// Broadcast `[batch, style]` along a new time axis of length `len`.
fn repeat_style<B: Backend>(style: Tensor<B, 2>, len: usize) -> Tensor<B, 3> {
    let [batch, dim] = style.dims();
    style.reshape([batch, 1, dim]).repeat_dim(1, len)
}

impl<B: Backend> ProsodyPredictor<B> {
    pub fn new(dims: &ModelDims, init: &mut ParamInit, device: &B::Device) -> Self {
        let joint = dims.hidden_dim + dims.style_dim;
        Self {
            text_proj: init.linear(joint, dims.hidden_dim, device),
            duration_proj: init.linear(dims.hidden_dim, dims.max_dur, device),
            f0n_proj: init.linear(joint, 2 * dims.frame_scale, device),
            frame_scale: dims.frame_scale,
        }
    }

    /// Returns duration logits `[batch, text, max_dur]` and the prosody
    /// representation expanded to frames through `alignment` `[batch, text, frames]`,
    /// shaped `[batch, hidden, frames]`.
    pub fn forward(
        &self,
        text_encoding: Tensor<B, 3>,
        style: Tensor<B, 2>,
        input_lengths: &[usize],
        alignment: Tensor<B, 3>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, _, text_len] = text_encoding.dims();
        let device = text_encoding.device();
        let keep: Vec<f32> = input_lengths
            .iter()
            .flat_map(|&len| (0..text_len).map(move |x| if x < len { 1.0 } else { 0.0 }))
            .collect();
        let keep = Tensor::<B, 3>::from_data(TensorData::new(keep, [batch, text_len, 1]), &device);

        let joint = Tensor::cat(
            vec![text_encoding.swap_dims(1, 2), repeat_style(style, text_len)],
            2,
        );
        let hidden = leaky_relu(self.text_proj.forward(joint), 0.2) * keep;
        let durations = self.duration_proj.forward(hidden.clone());
        let expanded = hidden.swap_dims(1, 2).matmul(alignment);
        (durations, expanded)
    }

    /// Pitch and energy curves `[batch, frames * frame_scale]` for a window of
    /// prosody frames `[batch, hidden, frames]`.
    pub fn f0n_train(&self, prosody: Tensor<B, 3>, style: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, _, frames] = prosody.dims();
        let joint = Tensor::cat(vec![prosody.swap_dims(1, 2), repeat_style(style, frames)], 2);
        let curves = self.f0n_proj.forward(joint);
        let len = frames * self.frame_scale;
        let f0 = curves
            .clone()
            .narrow(2, 0, self.frame_scale)
            .reshape([batch, len]);
        let energy = curves
            .narrow(2, self.frame_scale, self.frame_scale)
            .reshape([batch, len]);
        (f0, energy)
    }
}

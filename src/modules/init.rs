//! Deterministic parameter initialisation.
//!
//! Every worker builds its model from the same seed, so weights are drawn from a
//! host RNG rather than the backend's global generator.

use crate::modules::Conv1d;
use burn::module::Param;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded source of initial weights.
#[derive(Debug)]
pub struct ParamInit {
    rng: StdRng,
}

impl ParamInit {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform samples in `[-bound, bound]`.
    pub fn uniform<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        bound: f32,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let len = shape.iter().product();
        let values: Vec<f32> = (0..len)
            .map(|_| self.rng.gen_range(-bound..=bound))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Linear layer with fan-in scaled uniform weights.
    pub fn linear<B: Backend>(
        &mut self,
        d_input: usize,
        d_output: usize,
        device: &B::Device,
    ) -> Linear<B> {
        let bound = 1.0 / (d_input.max(1) as f32).sqrt();
        let mut linear = LinearConfig::new(d_input, d_output).init(device);
        linear.weight = Param::from_tensor(self.uniform([d_input, d_output], bound, device));
        linear.bias = Some(Param::from_tensor(self.uniform([d_output], bound, device)));
        linear
    }

    pub fn embedding<B: Backend>(
        &mut self,
        n_embedding: usize,
        d_model: usize,
        device: &B::Device,
    ) -> Embedding<B> {
        let mut embedding = EmbeddingConfig::new(n_embedding, d_model).init(device);
        embedding.weight = Param::from_tensor(self.uniform([n_embedding, d_model], 0.1, device));
        embedding
    }

    pub fn conv1d<B: Backend>(
        &mut self,
        channels_in: usize,
        channels_out: usize,
        kernel_size: usize,
        stride: usize,
        device: &B::Device,
    ) -> Conv1d<B> {
        let bound = 1.0 / ((channels_in * kernel_size).max(1) as f32).sqrt();
        let weight = self.uniform([channels_out, channels_in, kernel_size], bound, device);
        let bias = self.uniform([channels_out], bound, device);
        Conv1d::new(weight, bias, stride, kernel_size / 2)
    }
}

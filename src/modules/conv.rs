//! 1D convolution with explicit weights.

use burn::module::{Module, Param};
use burn::tensor::{backend::Backend, module::conv1d, ops::ConvOptions, Tensor};

/// Same-padded 1D convolution over `[batch, channels, time]`.
#[derive(Module, Debug)]
pub struct Conv1d<B: Backend> {
    /// Weight tensor `[out, in, kernel]`.
    pub weight: Param<Tensor<B, 3>>,
    /// Bias `[out]`.
    pub bias: Param<Tensor<B, 1>>,
    stride: usize,
    padding: usize,
}

impl<B: Backend> Conv1d<B> {
    pub fn new(weight: Tensor<B, 3>, bias: Tensor<B, 1>, stride: usize, padding: usize) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            stride: stride.max(1),
            padding,
        }
    }

    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        conv1d(
            input,
            self.weight.val(),
            Some(self.bias.val()),
            ConvOptions::new([self.stride], [self.padding], [1], 1),
        )
    }
}

//! Loss functions used by the generator and discriminator phases.
//!
//! Every function returns a one-element tensor so terms can be weighted and
//! summed before a single backward pass.

use crate::audio::mel::{log_mel_mean, log_mel_std};
use crate::model::DiscriminatorOutput;
use crate::modules::stft::StftKernel;
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

/// Mean Huber loss with unit threshold.
pub fn smooth_l1<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    let diff = (a - b).abs();
    let quad = diff.clone().clamp_max(1.0);
    (quad.clone() * (diff - quad.mul_scalar(0.5))).mean()
}

pub fn l1<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).abs().mean()
}

/// Numerically stable binary cross-entropy on logits.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let softplus = logits.clone().abs().neg().exp().log1p();
    (logits.clone().clamp_min(0.0) - logits * targets + softplus).mean()
}

/// Mean cross-entropy of `logits` `[n, classes]` against class ids.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: &[i64]) -> Tensor<B, 1> {
    let [rows, classes] = logits.dims();
    let mut one_hot = vec![0.0f32; rows * classes];
    for (row, &target) in targets.iter().take(rows).enumerate() {
        if let Ok(class) = usize::try_from(target) {
            if class < classes {
                one_hot[row * classes + class] = 1.0;
            }
        }
    }
    let one_hot = Tensor::<B, 2>::from_data(
        TensorData::new(one_hot, [rows, classes]),
        &logits.device(),
    );
    (log_softmax(logits, 1) * one_hot)
        .sum_dim(1)
        .mean()
        .neg()
}

/// Log of the per-frame L2 energy of denormalised mels `[batch, n_mels, time]`,
/// returned as `[batch, time]`.
pub fn log_norm<B: Backend>(mels: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, _, time] = mels.dims();
    mels.mul_scalar(log_mel_std())
        .add_scalar(log_mel_mean())
        .exp()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .log()
        .reshape([batch, time])
}

/// Least-squares adversarial loss for the discriminators.
pub fn discriminator_loss<B: Backend>(
    real: &DiscriminatorOutput<B>,
    fake: &DiscriminatorOutput<B>,
) -> Tensor<B, 1> {
    let mut total: Option<Tensor<B, 1>> = None;
    for (dr, dg) in real.scores.iter().zip(&fake.scores) {
        let term = dr.clone().neg().add_scalar(1.0).powf_scalar(2.0).mean()
            + dg.clone().powf_scalar(2.0).mean();
        total = Some(match total {
            Some(acc) => acc + term,
            None => term,
        });
    }
    total.unwrap_or_else(|| zero(real))
}

/// Least-squares adversarial loss for the generator plus feature matching.
pub fn generator_loss<B: Backend>(
    real: &DiscriminatorOutput<B>,
    fake: &DiscriminatorOutput<B>,
) -> Tensor<B, 1> {
    let mut total: Option<Tensor<B, 1>> = None;
    let mut add = |term: Tensor<B, 1>| {
        total = Some(match total.take() {
            Some(acc) => acc + term,
            None => term,
        });
    };
    for dg in &fake.scores {
        add(dg.clone().neg().add_scalar(1.0).powf_scalar(2.0).mean());
    }
    for (fr, fg) in real.features.iter().zip(&fake.features) {
        add(l1(fr.clone(), fg.clone()).mul_scalar(2.0));
    }
    total.unwrap_or_else(|| zero(fake))
}

fn zero<B: Backend>(output: &DiscriminatorOutput<B>) -> Tensor<B, 1> {
    let device = output
        .scores
        .first()
        .map(|score| score.device())
        .unwrap_or_default();
    Tensor::zeros([1], &device)
}

/// Spectral convergence plus log-magnitude distance averaged over resolutions.
#[derive(Debug, Clone)]
pub struct MultiResolutionStftLoss<B: Backend> {
    kernels: Vec<StftKernel<B>>,
}

impl<B: Backend> MultiResolutionStftLoss<B> {
    /// `resolutions` holds `(n_fft, hop, win)` triples.
    pub fn new(resolutions: &[[usize; 3]], device: &B::Device) -> Self {
        Self {
            kernels: resolutions
                .iter()
                .map(|&[n_fft, hop, win]| StftKernel::new(n_fft, hop, win, device))
                .collect(),
        }
    }

    /// Distance between `[batch, samples]` signals.
    pub fn forward(&self, predicted: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
        let device = predicted.device();
        let mut total = Tensor::<B, 1>::zeros([1], &device);
        for kernel in &self.kernels {
            let mag_p = kernel.magnitude(predicted.clone());
            let mag_t = kernel.magnitude(target.clone());
            let convergence = (mag_t.clone() - mag_p.clone()).powf_scalar(2.0).sum().sqrt()
                / mag_t.clone().powf_scalar(2.0).sum().sqrt();
            let log_mag = l1(mag_t.log(), mag_p.log());
            total = total + convergence + log_mag;
        }
        total.div_scalar(self.kernels.len().max(1) as f32)
    }
}

//! Differentiable STFT magnitude via DFT-kernel convolution.

use burn::tensor::backend::Backend;
use burn::tensor::{module::conv1d, ops::ConvOptions, Tensor, TensorData};
use std::f32::consts::PI;

/// Fixed real/imaginary DFT kernels for one resolution.
#[derive(Debug, Clone)]
pub struct StftKernel<B: Backend> {
    real: Tensor<B, 3>,
    imag: Tensor<B, 3>,
    n_fft: usize,
    hop_length: usize,
}

impl<B: Backend> StftKernel<B> {
    /// Kernels `[n_fft / 2 + 1, 1, n_fft]` with a centred Hann window of `win_length`.
    pub fn new(n_fft: usize, hop_length: usize, win_length: usize, device: &B::Device) -> Self {
        let win_length = win_length.min(n_fft).max(1);
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for n in 0..win_length {
            window[offset + n] = 0.5 * (1.0 - (2.0 * PI * n as f32 / win_length as f32).cos());
        }

        let n_freqs = n_fft / 2 + 1;
        let mut real = Vec::with_capacity(n_freqs * n_fft);
        let mut imag = Vec::with_capacity(n_freqs * n_fft);
        for k in 0..n_freqs {
            for (n, w) in window.iter().enumerate() {
                let phase = 2.0 * PI * ((k * n) % n_fft) as f32 / n_fft as f32;
                real.push(w * phase.cos());
                imag.push(-w * phase.sin());
            }
        }

        Self {
            real: Tensor::from_data(TensorData::new(real, [n_freqs, 1, n_fft]), device),
            imag: Tensor::from_data(TensorData::new(imag, [n_freqs, 1, n_fft]), device),
            n_fft,
            hop_length: hop_length.max(1),
        }
    }

    /// Magnitude `[batch, freqs, frames]` of a `[batch, samples]` signal.
    pub fn magnitude(&self, signal: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, samples] = signal.dims();
        let signal = signal.reshape([batch, 1, samples]);
        let options = || ConvOptions::new([self.hop_length], [self.n_fft / 2], [1], 1);
        let real = conv1d(signal.clone(), self.real.clone(), None, options());
        let imag = conv1d(signal, self.imag.clone(), None, options());
        (real.powf_scalar(2.0) + imag.powf_scalar(2.0))
            .clamp_min(1e-7)
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::StftKernel;
    use burn::tensor::{Tensor, TensorData};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn sinusoid_peaks_at_its_bin() {
        let device = NdArrayDevice::default();
        let n_fft = 32;
        let signal: Vec<f32> = (0..128)
            .map(|i| (2.0 * std::f32::consts::PI * 4.0 * i as f32 / n_fft as f32).sin())
            .collect();
        let signal = Tensor::<TestBackend, 2>::from_data(TensorData::new(signal, [1, 128]), &device);
        let kernel = StftKernel::new(n_fft, 8, n_fft, &device);
        let mag = kernel.magnitude(signal);
        let [_, freqs, frames] = mag.dims();
        assert_eq!(freqs, 17);
        assert_eq!(frames, 128 / 8 + 1);
        // A frame fully inside the signal.
        let column = mag
            .narrow(2, 8, 1)
            .reshape([freqs])
            .into_data()
            .to_vec::<f32>()
            .expect("vec");
        let peak = column
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin);
        assert_eq!(peak, Some(4));
    }
}

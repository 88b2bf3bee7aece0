//! Log-mel spectrogram extraction.
//!
//! Centered STFT with reflect padding, a Hann window of `win_length` placed in
//! the middle of an `n_fft` frame, a triangular HTK filterbank from 0 Hz to
//! Nyquist, then `log(1e-5 + mel)` normalised with a fixed mean and std.

use anyhow::Result;
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use std::f32::consts::PI;

const LOG_MEL_MEAN: f32 = -4.0;
const LOG_MEL_STD: f32 = 4.0;

/// Mean used to normalise log-mel values.
pub fn log_mel_mean() -> f32 {
    LOG_MEL_MEAN
}

/// Std used to normalise log-mel values.
pub fn log_mel_std() -> f32 {
    LOG_MEL_STD
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// Reusable mel extractor for one STFT configuration.
#[derive(Debug, Clone)]
pub struct MelExtractor {
    n_fft: usize,
    hop_length: usize,
    n_mels: usize,
    window: Vec<f32>,
    /// `[n_mels][n_freqs]` triangular filters.
    filters: Vec<Vec<f32>>,
}

impl MelExtractor {
    pub fn new(
        sample_rate: u32,
        n_fft: usize,
        win_length: usize,
        hop_length: usize,
        n_mels: usize,
    ) -> Result<Self> {
        if n_fft == 0 || hop_length == 0 || n_mels == 0 {
            anyhow::bail!("n_fft, hop_length and n_mels must be positive");
        }
        if win_length == 0 || win_length > n_fft {
            anyhow::bail!("win_length {win_length} must be in 1..={n_fft}");
        }

        // Periodic Hann window centred inside the FFT frame.
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for n in 0..win_length {
            window[offset + n] = 0.5 * (1.0 - (2.0 * PI * n as f32 / win_length as f32).cos());
        }

        Ok(Self {
            n_fft,
            hop_length,
            n_mels,
            window,
            filters: filterbank(sample_rate, n_fft, n_mels),
        })
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Number of frames produced for `len` samples.
    pub fn frames(&self, len: usize) -> usize {
        len / self.hop_length + 1
    }

    /// Normalised log-mel spectrogram as `[n_mels][frames]`.
    pub fn log_mel(&self, signal: &[f32]) -> Result<Vec<Vec<f32>>> {
        if signal.is_empty() {
            anyhow::bail!("cannot extract mel from an empty signal");
        }
        let padded = reflect_pad(signal, self.n_fft / 2);
        let frames = self.frames(signal.len());
        let n_freqs = self.n_fft / 2 + 1;

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.n_fft);
        let mut input = vec![0.0f32; self.n_fft];
        let mut output = vec![Complex::new(0.0f32, 0.0); n_freqs];
        let mut mel = vec![vec![0.0f32; frames]; self.n_mels];
        let mut power = vec![0.0f32; n_freqs];

        for frame in 0..frames {
            let start = frame * self.hop_length;
            for (i, slot) in input.iter_mut().enumerate() {
                *slot = padded[start + i] * self.window[i];
            }
            fft.process(&mut input, &mut output)
                .map_err(|e| anyhow::anyhow!("FFT failed: {e}"))?;
            for (bin, value) in output.iter().enumerate() {
                power[bin] = value.norm_sqr();
            }
            for (band, filter) in self.filters.iter().enumerate() {
                let energy: f32 = filter.iter().zip(&power).map(|(w, p)| w * p).sum();
                mel[band][frame] = ((1e-5 + energy).ln() - LOG_MEL_MEAN) / LOG_MEL_STD;
            }
        }
        Ok(mel)
    }
}

/// Reflect-pad both ends; falls back to zeros when the signal is too short to mirror.
fn reflect_pad(signal: &[f32], pad: usize) -> Vec<f32> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);
    if len > pad {
        padded.extend((1..=pad).rev().map(|i| signal[i]));
        padded.extend_from_slice(signal);
        padded.extend((0..pad).map(|i| signal[len - 2 - i]));
    } else {
        padded.extend(std::iter::repeat(0.0).take(pad));
        padded.extend_from_slice(signal);
        padded.extend(std::iter::repeat(0.0).take(pad));
    }
    padded
}

fn filterbank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f32 / 2.0;
    let freqs: Vec<f32> = (0..n_freqs)
        .map(|i| nyquist * i as f32 / (n_freqs - 1).max(1) as f32)
        .collect();
    let mel_max = hz_to_mel(nyquist);
    let points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (left, center, right) = (points[m], points[m + 1], points[m + 2]);
            freqs
                .iter()
                .map(|&f| {
                    let up = (f - left) / (center - left);
                    let down = (right - f) / (right - center);
                    up.min(down).max(0.0)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_matches_centered_stft() {
        let extractor = MelExtractor::new(1600, 64, 48, 16, 8).expect("extractor");
        let signal: Vec<f32> = (0..160).map(|i| (i as f32 * 0.3).sin()).collect();
        let mel = extractor.log_mel(&signal).expect("mel");
        assert_eq!(mel.len(), 8);
        assert_eq!(mel[0].len(), 11);
        assert!(mel.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn silence_maps_to_floor() {
        let extractor = MelExtractor::new(1600, 64, 64, 16, 4).expect("extractor");
        let mel = extractor.log_mel(&[0.0; 64]).expect("mel");
        let floor = ((1e-5f32).ln() - LOG_MEL_MEAN) / LOG_MEL_STD;
        for value in mel.iter().flatten() {
            assert!((value - floor).abs() < 1e-4);
        }
    }

    #[test]
    fn reflect_pad_mirrors_without_edge() {
        assert_eq!(
            reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
    }

    #[test]
    fn rejects_window_longer_than_fft() {
        assert!(MelExtractor::new(1600, 32, 64, 16, 4).is_err());
    }
}

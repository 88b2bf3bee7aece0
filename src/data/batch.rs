//! Padded minibatches.

use super::Utterance;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// Host-side minibatch, sorted by descending mel length.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Raw waveforms, one per example, unpadded.
    pub waves: Vec<Vec<f32>>,
    /// Row-major `[batch, max_text_len]` token ids, zero padded.
    pub texts: Vec<i64>,
    pub input_lengths: Vec<usize>,
    /// Row-major `[batch, n_mels, max_mel_len]` log-mels, zero padded.
    pub mels: Vec<f32>,
    pub mel_lengths: Vec<usize>,
    pub n_mels: usize,
}

/// Tensor view of a [`Batch`] on a device.
#[derive(Debug, Clone)]
pub struct DeviceBatch<B: Backend> {
    pub texts: Tensor<B, 2, Int>,
    pub mels: Tensor<B, 3>,
}

impl Batch {
    /// Collate utterances into a padded batch.
    pub fn collate(mut items: Vec<Utterance>, n_mels: usize) -> Self {
        items.sort_by(|a, b| b.mel_len().cmp(&a.mel_len()));
        let batch = items.len();
        let max_text = items.iter().map(|u| u.tokens.len()).max().unwrap_or(0);
        let max_mel = items.iter().map(Utterance::mel_len).max().unwrap_or(0);

        let mut texts = vec![0i64; batch * max_text];
        let mut mels = vec![0.0f32; batch * n_mels * max_mel];
        let mut input_lengths = Vec::with_capacity(batch);
        let mut mel_lengths = Vec::with_capacity(batch);
        let mut waves = Vec::with_capacity(batch);

        for (b, item) in items.into_iter().enumerate() {
            texts[b * max_text..b * max_text + item.tokens.len()].copy_from_slice(&item.tokens);
            let frames = item.mel_len();
            for (band, values) in item.mel.iter().take(n_mels).enumerate() {
                let row = (b * n_mels + band) * max_mel;
                mels[row..row + frames].copy_from_slice(&values[..frames]);
            }
            input_lengths.push(item.tokens.len());
            mel_lengths.push(frames);
            waves.push(item.wave);
        }

        Self {
            waves,
            texts,
            input_lengths,
            mels,
            mel_lengths,
            n_mels,
        }
    }

    pub fn len(&self) -> usize {
        self.input_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_lengths.is_empty()
    }

    /// Padded text length.
    pub fn max_text_len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.texts.len() / self.len()
        }
    }

    /// Padded mel length.
    pub fn max_mel_len(&self) -> usize {
        if self.is_empty() || self.n_mels == 0 {
            0
        } else {
            self.mels.len() / (self.len() * self.n_mels)
        }
    }

    /// Upload token ids and mels.
    pub fn to_device<B: Backend>(&self, device: &B::Device) -> DeviceBatch<B> {
        let batch = self.len();
        let texts = Tensor::from_data(
            TensorData::new(self.texts.clone(), [batch, self.max_text_len()]),
            device,
        );
        let mels = Tensor::from_data(
            TensorData::new(self.mels.clone(), [batch, self.n_mels, self.max_mel_len()]),
            device,
        );
        DeviceBatch { texts, mels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utterance(tokens: usize, frames: usize, value: f32) -> Utterance {
        Utterance {
            wave: vec![value; frames * 4],
            tokens: (0..tokens as i64).collect(),
            mel: vec![vec![value; frames]; 2],
        }
    }

    #[test]
    fn collate_pads_and_sorts_longest_first() {
        let batch = Batch::collate(vec![utterance(3, 4, 1.0), utterance(5, 6, 2.0)], 2);
        assert_eq!(batch.mel_lengths, vec![6, 4]);
        assert_eq!(batch.input_lengths, vec![5, 3]);
        assert_eq!(batch.max_text_len(), 5);
        assert_eq!(batch.max_mel_len(), 6);
        // Second example's first band: four values then padding.
        let row = 2 * 6;
        assert_eq!(&batch.mels[row..row + 6], &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(&batch.texts[5..10], &[0, 1, 2, 0, 0]);
        assert_eq!(batch.waves[1].len(), 16);
    }
}

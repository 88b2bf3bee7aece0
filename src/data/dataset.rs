//! Utterance list parsing and per-item feature extraction.

use crate::audio::{MelExtractor, WavIo};
use crate::config::Config;
use crate::text::Vocabulary;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One loaded training example.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Zero-padded waveform the mel was computed from.
    pub wave: Vec<f32>,
    /// Token ids framed by pad tokens.
    pub tokens: Vec<i64>,
    /// Normalised log-mel, `[n_mels][frames]` with an even frame count.
    pub mel: Vec<Vec<f32>>,
}

impl Utterance {
    pub fn mel_len(&self) -> usize {
        self.mel.first().map(Vec::len).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    wav: String,
    text: String,
}

/// Parse `wav|phonemes|speaker` lines, ignoring blank lines and extra columns.
fn parse_list(path: &Path) -> Result<Vec<ListEntry>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read list file {}", path.display()))?;
    let mut entries = Vec::new();
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('|');
        let (Some(wav), Some(text)) = (fields.next(), fields.next()) else {
            anyhow::bail!("{}:{}: expected `wav|text|speaker`", path.display(), line_no + 1);
        };
        entries.push(ListEntry {
            wav: wav.to_string(),
            text: text.to_string(),
        });
    }
    Ok(entries)
}

/// Lazily loaded list of utterances.
#[derive(Debug)]
pub struct MelDataset {
    entries: Vec<ListEntry>,
    root: PathBuf,
    vocab: Vocabulary,
    extractor: MelExtractor,
    sample_rate: u32,
    pad_samples: usize,
}

impl MelDataset {
    /// Open the list at `list_path` using the audio settings from `config`.
    pub fn new(list_path: impl AsRef<Path>, config: &Config, vocab: Vocabulary) -> Result<Self> {
        let spect = &config.preprocess_params.spect_params;
        let extractor = MelExtractor::new(
            config.preprocess_params.sr,
            spect.n_fft,
            spect.win_length,
            spect.hop_length,
            config.model_params.n_mels,
        )?;
        Ok(Self {
            entries: parse_list(list_path.as_ref())?,
            root: PathBuf::from(&config.data_params.root_path),
            vocab,
            extractor,
            sample_rate: config.preprocess_params.sr,
            pad_samples: config.preprocess_params.pad_samples,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_mels(&self) -> usize {
        self.extractor.n_mels()
    }

    /// Load and featurise one utterance.
    pub fn get(&self, index: usize) -> Result<Utterance> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("utterance index {index} out of range"))?;
        let path = self.root.join(&entry.wav);
        let (samples, sample_rate) = WavIo::read_mono(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if sample_rate != self.sample_rate {
            anyhow::bail!(
                "{} has sample rate {sample_rate}, expected {}",
                path.display(),
                self.sample_rate
            );
        }

        let mut wave = vec![0.0f32; self.pad_samples];
        wave.extend_from_slice(&samples);
        wave.extend(std::iter::repeat(0.0).take(self.pad_samples));

        let mut mel = self.extractor.log_mel(&wave)?;
        let frames = mel.first().map(Vec::len).unwrap_or(0);
        let even = frames - frames % 2;
        for band in &mut mel {
            band.truncate(even);
        }

        Ok(Utterance {
            wave,
            tokens: self.vocab.encode(&entry.text),
            mel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::parse_list;
    use std::fs;

    #[test]
    fn list_parsing_skips_blank_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("train.txt");
        fs::write(&path, "a.wav|ab|0\n\n b.wav|ba|1|extra\n").expect("write");
        let entries = parse_list(&path).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].wav, " b.wav");
        assert_eq!(entries[1].text, "ba");
    }

    #[test]
    fn list_parsing_rejects_missing_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.txt");
        fs::write(&path, "only_a_path.wav\n").expect("write");
        let err = parse_list(&path).unwrap_err();
        assert!(err.to_string().contains(":1:"));
    }
}

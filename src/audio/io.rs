//! WAV reading and writing.

use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

#[derive(Debug, Default)]
pub struct WavIo;

impl WavIo {
    /// Read a WAV file as one sample vector per channel.
    pub fn read_wav(path: impl AsRef<Path>) -> Result<(Vec<Vec<f32>>, u32)> {
        let mut reader = WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        let sample_rate = spec.sample_rate;
        let mut samples = vec![Vec::new(); channels];

        match spec.sample_format {
            SampleFormat::Float => {
                for (idx, sample) in reader.samples::<f32>().enumerate() {
                    samples[idx % channels].push(sample?);
                }
            }
            SampleFormat::Int => {
                let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
                for (idx, sample) in reader.samples::<i32>().enumerate() {
                    samples[idx % channels].push(sample? as f32 / max);
                }
            }
        }

        Ok((samples, sample_rate))
    }

    /// Read a WAV file and average its channels into one.
    pub fn read_mono(path: impl AsRef<Path>) -> Result<(Vec<f32>, u32)> {
        let (channels, sample_rate) = Self::read_wav(path)?;
        let Some(first) = channels.first() else {
            anyhow::bail!("WAV file has no channels");
        };
        if channels.len() == 1 {
            return Ok((first.clone(), sample_rate));
        }
        let scale = 1.0 / channels.len() as f32;
        let mono = (0..first.len())
            .map(|idx| channels.iter().map(|ch| ch[idx]).sum::<f32>() * scale)
            .collect();
        Ok((mono, sample_rate))
    }

    /// Write 16-bit PCM, one sample vector per channel.
    pub fn write_wav(path: impl AsRef<Path>, samples: &[Vec<f32>], sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            anyhow::bail!("No audio channels provided");
        }
        let len = samples[0].len();
        if samples.iter().any(|channel| channel.len() != len) {
            anyhow::bail!("Channel length mismatch in WAV write");
        }

        let spec = WavSpec {
            channels: samples.len() as u16,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec)?;
        for idx in 0..len {
            for channel in samples {
                let value = channel[idx].clamp(-1.0, 1.0);
                writer.write_sample((value * i16::MAX as f32).round() as i16)?;
            }
        }
        writer.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WavIo;
    use tempfile::tempdir;

    #[test]
    fn stereo_is_downmixed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stereo.wav");
        let samples = vec![vec![0.5_f32, -0.5, 0.25], vec![0.5, 0.5, -0.25]];
        WavIo::write_wav(&path, &samples, 24000).expect("write wav");

        let (mono, sample_rate) = WavIo::read_mono(&path).expect("read wav");
        assert_eq!(sample_rate, 24000);
        assert_eq!(mono.len(), 3);
        assert!((mono[0] - 0.5).abs() < 1e-3);
        assert!(mono[1].abs() < 1e-3);
        assert!(mono[2].abs() < 1e-3);
    }
}

//! Random loss windows aligned across aligner frames, mel frames and samples.
//!
//! One aligner frame covers `frame_scale` mel frames and one mel frame covers
//! `hop_length` waveform samples, so a window starting at aligner frame `r`
//! with length `w` spans mel frames `[scale*r, scale*(r+w))` and samples
//! `[scale*r*hop, scale*(r+w)*hop)`.

use crate::error::SkipReason;
use rand::Rng;
use std::ops::Range;

/// Window length in aligner frames for a batch.
///
/// Derived from the shortest example: `min(shortest / scale - 1, cap / scale)`.
/// Validation passes `cap = None`.
pub fn window_len(mel_lengths: &[usize], frame_scale: usize, cap: Option<usize>) -> usize {
    let shortest = mel_lengths.iter().copied().min().unwrap_or(0);
    let window = (shortest / frame_scale).saturating_sub(1);
    match cap {
        Some(cap) => window.min(cap / frame_scale),
        None => window,
    }
}

/// One example's window at every resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Start in aligner frames.
    pub start: usize,
    /// Aligner-frame range, used for encoder and predictor outputs.
    pub frames: Range<usize>,
    pub mel: Range<usize>,
    pub wave: Range<usize>,
}

/// Converts a window length into per-example segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSampler {
    frame_scale: usize,
    hop_length: usize,
}

impl SegmentSampler {
    pub fn new(frame_scale: usize, hop_length: usize) -> Self {
        Self {
            frame_scale: frame_scale.max(1),
            hop_length: hop_length.max(1),
        }
    }

    /// Aligner frames of an example backed by both mel frames and samples.
    pub fn valid_len(&self, mel_len: usize, wave_len: usize) -> usize {
        (mel_len / self.frame_scale).min(wave_len / (self.frame_scale * self.hop_length))
    }

    /// Segment for a known start offset.
    pub fn segment(&self, start: usize, window: usize) -> Segment {
        let end = start + window;
        let mel = self.frame_scale * start..self.frame_scale * end;
        let wave = mel.start * self.hop_length..mel.end * self.hop_length;
        Segment {
            start,
            frames: start..end,
            mel,
            wave,
        }
    }

    /// Draw an independent start for every example.
    ///
    /// Each start is uniform over `0..=valid - window` for that example's own
    /// valid length. A zero-length window, or one that does not fit some
    /// example, skips the batch.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        window: usize,
        mel_lengths: &[usize],
        wave_lengths: &[usize],
    ) -> Result<Vec<Segment>, SkipReason> {
        let valid: Vec<usize> = mel_lengths
            .iter()
            .zip(wave_lengths)
            .map(|(&mel, &wave)| self.valid_len(mel, wave))
            .collect();
        let shortest = valid.iter().copied().min().unwrap_or(0);
        if window == 0 || window > shortest {
            return Err(SkipReason::SegmentTooShort {
                window,
                valid: shortest,
            });
        }
        Ok(valid
            .iter()
            .map(|&len| self.segment(rng.gen_range(0..=len - window), window))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn window_follows_shortest_example_and_cap() {
        assert_eq!(window_len(&[40, 20], 2, Some(200)), 9);
        assert_eq!(window_len(&[400, 300], 2, Some(200)), 100);
        assert_eq!(window_len(&[400, 300], 2, None), 149);
        assert_eq!(window_len(&[1], 2, None), 0);
        assert_eq!(window_len(&[], 2, None), 0);
    }

    #[test]
    fn shorter_example_bounds_its_own_start() {
        let sampler = SegmentSampler::new(2, 4);
        let mel_lengths = [20, 40];
        let wave_lengths = [20 * 4, 40 * 4];
        let window = window_len(&mel_lengths, 2, Some(200));
        let mut rng = StdRng::seed_from_u64(3);
        let mut saw_large_start = false;
        for _ in 0..500 {
            let segments = sampler
                .sample(&mut rng, window, &mel_lengths, &wave_lengths)
                .expect("fits");
            assert!(segments[0].start + window <= 10);
            assert!(segments[1].start + window <= 20);
            assert!(segments[0].mel.end <= mel_lengths[0]);
            assert!(segments[0].wave.end <= wave_lengths[0]);
            saw_large_start |= segments[1].start > 1;
        }
        assert!(saw_large_start, "starts of the longer example are independent");
    }

    #[test]
    fn ranges_describe_the_same_time_span() {
        let sampler = SegmentSampler::new(2, 300);
        let segment = sampler.segment(5, 7);
        assert_eq!(segment.frames, 5..12);
        assert_eq!(segment.mel, 10..24);
        assert_eq!(segment.wave, 3000..7200);
        assert_eq!(segment.wave.len(), segment.mel.len() * 300);
    }

    #[test]
    fn too_short_window_skips() {
        let sampler = SegmentSampler::new(2, 4);
        let mut rng = StdRng::seed_from_u64(0);
        let err = sampler.sample(&mut rng, 0, &[2], &[8]).expect_err("empty window");
        assert_eq!(err, SkipReason::SegmentTooShort { window: 0, valid: 1 });
        // Wave shorter than the mel frames claim.
        let err = sampler.sample(&mut rng, 4, &[10], &[8]).expect_err("wave too short");
        assert_eq!(err, SkipReason::SegmentTooShort { window: 4, valid: 1 });
    }
}

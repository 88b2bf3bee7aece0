//! Length masks.
//!
//! `padding_mask` is true on padded positions, the convention of boolean
//! `mask_fill`. `valid_mask` is 1.0 inside both valid lengths and 0.0 elsewhere.

use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Tensor, TensorData};

/// `[batch, max_len]` mask, true where `index >= lengths[b]`.
pub fn padding_mask<B: Backend>(
    lengths: &[usize],
    max_len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let values: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |i| i >= len))
        .collect();
    Tensor::from_data(TensorData::new(values, [lengths.len(), max_len]), device)
}

/// Host `[batch][text][time]` validity mask from text and frame lengths.
pub fn valid_mask_host(
    text_lengths: &[usize],
    time_lengths: &[usize],
    max_text: usize,
    max_time: usize,
) -> Vec<f32> {
    let mut mask = vec![0.0f32; text_lengths.len() * max_text * max_time];
    for (b, (&tl, &ml)) in text_lengths.iter().zip(time_lengths).enumerate() {
        for x in 0..tl.min(max_text) {
            let row = (b * max_text + x) * max_time;
            mask[row..row + ml.min(max_time)].fill(1.0);
        }
    }
    mask
}

/// `[batch, text, time]` float validity mask.
pub fn valid_mask<B: Backend>(
    text_lengths: &[usize],
    time_lengths: &[usize],
    max_text: usize,
    max_time: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let mask = valid_mask_host(text_lengths, time_lengths, max_text, max_time);
    Tensor::from_data(
        TensorData::new(mask, [text_lengths.len(), max_text, max_time]),
        device,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn padding_mask_marks_tail() {
        let device = NdArrayDevice::default();
        let mask = padding_mask::<NdArray<f32>>(&[2, 3], 3, &device);
        let values = mask.into_data().to_vec::<bool>().expect("vec");
        assert_eq!(values, vec![false, false, true, false, false, false]);
    }

    #[test]
    fn valid_mask_covers_both_lengths() {
        let mask = valid_mask_host(&[1, 2], &[2, 3], 2, 3);
        assert_eq!(
            mask,
            vec![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]
        );
    }
}

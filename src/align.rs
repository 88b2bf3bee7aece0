//! Monotonic hard alignment between text positions and aligner frames.
//!
//! The search runs on host memory: attention is small (`text x frames` per
//! example) and the dynamic program is inherently sequential.

use crate::error::TrainError;
use anyhow::Result;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

const LOG_FLOOR: f32 = 1e-8;

/// Best monotonic path through one example's attention.
///
/// `values` is row-major `[text_len, time_len]`. Only the top-left
/// `valid_text x valid_time` region is searched; the returned path is zero
/// everywhere else. Inside the region every frame selects exactly one text
/// position and the selected position never decreases over time.
///
/// When there are fewer valid frames than valid tokens no surjective path
/// exists, so frame `t` is assigned to token `t * valid_text / valid_time`.
pub fn maximum_path(
    values: &[f32],
    text_len: usize,
    time_len: usize,
    valid_text: usize,
    valid_time: usize,
) -> Vec<f32> {
    let mut path = vec![0.0f32; text_len * time_len];
    let valid_text = valid_text.min(text_len);
    let valid_time = valid_time.min(time_len);
    if valid_text == 0 || valid_time == 0 {
        return path;
    }

    if valid_time < valid_text {
        for t in 0..valid_time {
            let x = t * valid_text / valid_time;
            path[x * time_len + t] = 1.0;
        }
        return path;
    }

    // Accumulated log-probability, indexed [x][t] over the valid region.
    let mut acc = vec![f32::NEG_INFINITY; valid_text * valid_time];
    let log = |x: usize, t: usize| (values[x * time_len + t].max(0.0) + LOG_FLOOR).ln();

    for t in 0..valid_time {
        let lo = (valid_text + t).saturating_sub(valid_time);
        let hi = valid_text.min(t + 1);
        for x in lo..hi {
            let stay = if x == t || t == 0 {
                f32::NEG_INFINITY
            } else {
                acc[x * valid_time + t - 1]
            };
            let advance = match (x, t) {
                (0, 0) => 0.0,
                (0, _) => f32::NEG_INFINITY,
                (_, 0) => f32::NEG_INFINITY,
                _ => acc[(x - 1) * valid_time + t - 1],
            };
            acc[x * valid_time + t] = stay.max(advance) + log(x, t);
        }
    }

    let mut x = valid_text - 1;
    for t in (0..valid_time).rev() {
        path[x * time_len + t] = 1.0;
        if x > 0 && t > 0 && (x == t || acc[x * valid_time + t - 1] < acc[(x - 1) * valid_time + t - 1]) {
            x -= 1;
        }
    }
    path
}

/// Valid extents of a prefix mask `[text_len, time_len]`.
fn mask_extent(mask: &[f32], text_len: usize, time_len: usize) -> (usize, usize) {
    let mut valid_text = 0;
    let mut valid_time = 0;
    for x in 0..text_len {
        let row = &mask[x * time_len..(x + 1) * time_len];
        let used = row.iter().rposition(|&v| v > 0.5).map_or(0, |t| t + 1);
        if used > 0 {
            valid_text = x + 1;
            valid_time = valid_time.max(used);
        }
    }
    (valid_text, valid_time)
}

/// Hard alignment for a batch of attention matrices `[batch, text, frames]`.
///
/// `mask` must have exactly the shape of `attention`; a mismatch is a
/// [`TrainError::AlignmentShape`]. The result carries no gradient.
pub fn monotonic_alignment<B: Backend>(
    attention: Tensor<B, 3>,
    mask: Tensor<B, 3>,
) -> Result<Tensor<B, 3>> {
    let dims = attention.dims();
    if dims != mask.dims() {
        return Err(TrainError::AlignmentShape {
            attention: dims.to_vec(),
            mask: mask.dims().to_vec(),
        }
        .into());
    }
    let [batch, text_len, time_len] = dims;
    let device = attention.device();
    let values = attention
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("attention readback failed: {e:?}"))?;
    let mask = mask
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("mask readback failed: {e:?}"))?;

    let plane = text_len * time_len;
    let mut paths = Vec::with_capacity(batch * plane);
    for b in 0..batch {
        let range = b * plane..(b + 1) * plane;
        let (valid_text, valid_time) = mask_extent(&mask[range.clone()], text_len, time_len);
        paths.extend(maximum_path(
            &values[range],
            text_len,
            time_len,
            valid_text,
            valid_time,
        ));
    }
    Ok(Tensor::from_data(
        TensorData::new(paths, [batch, text_len, time_len]),
        &device,
    ))
}

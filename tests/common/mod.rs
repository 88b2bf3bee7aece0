//! Shared test utilities: a tiny training setup on disk and synthetic batches.

#![allow(dead_code)]

use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use styletts_train::audio::WavIo;
use styletts_train::data::Batch;
use styletts_train::model::{ModelDims, ModuleName, TtsModel};
use styletts_train::state::TrainingState;
use styletts_train::train::{save_checkpoint, OptimizerCoordinator};
use styletts_train::Config;

pub type TestBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<NdArray<f32>>;

pub const SAMPLE_RATE: u32 = 1600;
pub const HOP: usize = 16;
pub const N_MELS: usize = 8;

const TRAIN_TEXTS: [&str; 4] = ["abcde", "bad cafe", "face", "deaf bead"];
const VAL_TEXTS: [&str; 2] = ["cab", "fade"];

/// Configuration text for a model small enough to train in a unit test.
pub fn config_yaml(root: &Path) -> String {
    format!(
        r#"log_dir: "{root}/logs"
pretrained_model: "{root}/pretrained.safetensors"
load_only_params: true
batch_size: 2
epochs: 1
save_freq: 1
log_interval: 1
save_interval_steps: 1
max_len: 16
seed: 7
num_workers: 1
data_params:
  train_data: "{root}/train_list.txt"
  val_data: "{root}/val_list.txt"
  root_path: "{root}/wavs"
symbol:
  pad: "$"
  punctuation: ",. "
  letters: "abcdef"
  letters_ipa: "ɑ"
  extend: ""
preprocess_params:
  sr: {SAMPLE_RATE}
  pad_samples: 32
  spect_params: {{ n_fft: 64, win_length: 64, hop_length: {HOP} }}
model_params:
  hidden_dim: 16
  style_dim: 8
  n_mels: {N_MELS}
  max_dur: 8
  n_down: 1
  disc_channels: 4
  mpd_periods: [2, 3]
  msd_scales: [1, 2]
loss_params:
  stft_resolutions: [[32, 8, 32], [64, 16, 64]]
optimizer_params:
  lr: 1.0e-4
  ft_lr: 1.0e-5
"#,
        root = root.display()
    )
}

/// Parse [`config_yaml`] for `root`.
pub fn tiny_config(root: &Path) -> Config {
    serde_yaml::from_str(&config_yaml(root)).expect("parse tiny config")
}

/// A decaying tone of `len` samples, distinct per index.
pub fn tone(index: usize, len: usize) -> Vec<f32> {
    let freq = 110.0 + 55.0 * index as f32;
    (0..len)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            0.4 * (2.0 * PI * freq * t).sin() * (-t).exp()
        })
        .collect()
}

/// Model dimensions matching [`config_yaml`].
pub fn tiny_dims(config: &Config) -> ModelDims {
    let vocab = config.validate().expect("tiny config validates");
    ModelDims::from_config(config, vocab.n_token())
}

/// Write wavs, list files, the config file and a pretrained checkpoint under
/// `root`. Returns the config path.
pub fn write_fixture(root: &Path) -> PathBuf {
    let wavs = root.join("wavs");
    std::fs::create_dir_all(&wavs).expect("create wav dir");
    let write_list = |name: &str, texts: &[&str], offset: usize| {
        let mut lines = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let file = format!("utt{}.wav", offset + i);
            let len = 720 + 80 * i;
            WavIo::write_wav(wavs.join(&file), &[tone(offset + i, len)], SAMPLE_RATE)
                .expect("write wav");
            lines.push(format!("{file}|{text}|0"));
        }
        std::fs::write(root.join(name), lines.join("\n")).expect("write list");
    };
    write_list("train_list.txt", &TRAIN_TEXTS, 0);
    write_list("val_list.txt", &VAL_TEXTS, TRAIN_TEXTS.len());

    let config_path = root.join("config.yml");
    std::fs::write(&config_path, config_yaml(root)).expect("write config");
    let config = tiny_config(root);
    write_checkpoint(&config, &root.join("pretrained.safetensors"), 3);
    config_path
}

/// Save a freshly initialised model (weights drawn from `seed`).
pub fn write_checkpoint(config: &Config, path: &Path, seed: u64) {
    let device = NdArrayDevice::default();
    let model = TtsModel::<TrainBackend>::new(&tiny_dims(config), seed, &device);
    let optimizer = OptimizerCoordinator::<TrainBackend>::new(&config.optimizer_params, 10);
    save_checkpoint(path, &model, &optimizer, &TrainingState::default(), f32::INFINITY)
        .expect("save pretrained checkpoint");
}

/// Deterministic in-memory batch of `lengths.len()` examples, each with
/// `(text_len, mel_len)` and a matching waveform.
pub fn synthetic_batch(lengths: &[(usize, usize)], n_token: usize) -> Batch {
    let mut order: Vec<_> = lengths.to_vec();
    order.sort_by(|a, b| b.1.cmp(&a.1));
    let max_text = order.iter().map(|l| l.0).max().unwrap_or(0);
    let max_mel = order.iter().map(|l| l.1).max().unwrap_or(0);
    let batch = order.len();

    let mut texts = vec![0i64; batch * max_text];
    let mut mels = vec![0.0f32; batch * N_MELS * max_mel];
    let mut waves = Vec::with_capacity(batch);
    for (b, &(text_len, mel_len)) in order.iter().enumerate() {
        for x in 0..text_len {
            texts[b * max_text + x] = (1 + (b + x) % (n_token - 1)) as i64;
        }
        for band in 0..N_MELS {
            for t in 0..mel_len {
                let phase = (band * 7 + t * 3 + b) as f32;
                mels[(b * N_MELS + band) * max_mel + t] = (phase * 0.37).sin() - 1.0;
            }
        }
        waves.push(tone(b, mel_len * HOP));
    }
    Batch {
        waves,
        texts,
        input_lengths: order.iter().map(|l| l.0).collect(),
        mels,
        mel_lengths: order.iter().map(|l| l.1).collect(),
        n_mels: N_MELS,
    }
}

/// Serialized weights of one module, for before/after comparisons.
pub fn module_bytes(model: &TtsModel<TrainBackend>, name: ModuleName) -> Vec<u8> {
    model.encode_module(name).expect("encode module")
}

/// Assert two tensors are element-wise close within tolerance.
pub fn assert_close<const D: usize>(a: Tensor<TestBackend, D>, b: Tensor<TestBackend, D>, tol: f32) {
    let a: Vec<f32> = a.into_data().to_vec().expect("a values");
    let b: Vec<f32> = b.into_data().to_vec().expect("b values");
    assert_eq!(a.len(), b.len(), "tensor length mismatch");
    for (idx, (x, y)) in a.iter().zip(&b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {idx}: {x} vs {y} (tol {tol})");
    }
}

/// Tensor from a flat vector.
pub fn tensor<const D: usize>(data: Vec<f32>, shape: [usize; D]) -> Tensor<TestBackend, D> {
    Tensor::from_data(TensorData::new(data, shape), &NdArrayDevice::default())
}

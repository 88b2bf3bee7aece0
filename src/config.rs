//! Training configuration.
//!
//! Configurations are loaded from YAML files using [`load_config`] and checked
//! with [`Config::validate`] before any worker, data loader or model exists.
//! Unknown keys are tolerated so configs shared with other tooling still load.

use crate::error::TrainError;
use crate::text::Vocabulary;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

fn default_batch_size() -> usize {
    10
}
fn default_epochs() -> usize {
    200
}
fn default_save_freq() -> usize {
    2
}
fn default_log_interval() -> usize {
    10
}
fn default_max_len() -> usize {
    200
}
fn default_save_interval_steps() -> usize {
    1000
}
fn default_seed() -> u64 {
    1234
}
fn default_num_workers() -> usize {
    1
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Locations of the training and validation lists.
pub struct DataParams {
    /// List file for training utterances (`wav|phonemes|speaker` per line).
    pub train_data: String,
    /// List file for validation utterances.
    pub val_data: String,
    /// Directory prepended to every wav path in the lists.
    pub root_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// Character sets that make up the token vocabulary.
///
/// Every key is optional at parse time so that a missing one can be reported by
/// name instead of as a generic parse error.
pub struct SymbolConfig {
    pub pad: Option<String>,
    pub punctuation: Option<String>,
    pub letters: Option<String>,
    pub letters_ipa: Option<String>,
    pub extend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// STFT settings for mel extraction.
pub struct SpectParams {
    #[serde(default = "default_n_fft")]
    pub n_fft: usize,
    #[serde(default = "default_win_length")]
    pub win_length: usize,
    /// Waveform samples per mel frame.
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
}

fn default_n_fft() -> usize {
    2048
}
fn default_win_length() -> usize {
    1200
}
fn default_hop_length() -> usize {
    300
}

impl Default for SpectParams {
    fn default() -> Self {
        Self {
            n_fft: default_n_fft(),
            win_length: default_win_length(),
            hop_length: default_hop_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Audio preprocessing parameters.
pub struct PreprocessParams {
    /// Expected sample rate of every wav file.
    #[serde(default = "default_sr")]
    pub sr: u32,
    #[serde(default)]
    pub spect_params: SpectParams,
    /// Zero samples added on both sides of each waveform before mel extraction.
    #[serde(default = "default_pad_samples")]
    pub pad_samples: usize,
}

fn default_sr() -> u32 {
    24000
}
fn default_pad_samples() -> usize {
    5000
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            sr: default_sr(),
            spect_params: SpectParams::default(),
            pad_samples: default_pad_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Sub-network hyperparameters.
pub struct ModelParams {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_style_dim")]
    pub style_dim: usize,
    #[serde(default = "default_n_mels")]
    pub n_mels: usize,
    /// Number of duration bins predicted per token.
    #[serde(default = "default_max_dur")]
    pub max_dur: usize,
    /// Aligner time reduction exponent; one encoder frame spans `2^n_down` mel frames.
    #[serde(default = "default_n_down")]
    pub n_down: usize,
    /// Hidden channels inside both discriminators.
    #[serde(default = "default_disc_channels")]
    pub disc_channels: usize,
    #[serde(default = "default_mpd_periods")]
    pub mpd_periods: Vec<usize>,
    #[serde(default = "default_msd_scales")]
    pub msd_scales: Vec<usize>,
}

fn default_hidden_dim() -> usize {
    512
}
fn default_style_dim() -> usize {
    128
}
fn default_n_mels() -> usize {
    80
}
fn default_max_dur() -> usize {
    50
}
fn default_n_down() -> usize {
    1
}
fn default_disc_channels() -> usize {
    32
}
fn default_mpd_periods() -> Vec<usize> {
    vec![2, 3, 5, 7, 11]
}
fn default_msd_scales() -> Vec<usize> {
    vec![1, 2, 4]
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            style_dim: default_style_dim(),
            n_mels: default_n_mels(),
            max_dur: default_max_dur(),
            n_down: default_n_down(),
            disc_channels: default_disc_channels(),
            mpd_periods: default_mpd_periods(),
            msd_scales: default_msd_scales(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Weights of the generator loss terms.
pub struct LossParams {
    #[serde(default = "default_lambda_mel")]
    pub lambda_mel: f32,
    #[serde(default = "one", rename = "lambda_F0")]
    pub lambda_f0: f32,
    #[serde(default = "default_lambda_ce")]
    pub lambda_ce: f32,
    #[serde(default = "one")]
    pub lambda_norm: f32,
    #[serde(default = "one")]
    pub lambda_dur: f32,
    #[serde(default = "one")]
    pub lambda_gen: f32,
    #[serde(default = "one")]
    pub lambda_mono: f32,
    #[serde(default = "one")]
    pub lambda_s2s: f32,
    /// `(n_fft, hop, win)` triples for the multi-resolution STFT loss.
    #[serde(default = "default_stft_resolutions")]
    pub stft_resolutions: Vec<[usize; 3]>,
}

fn one() -> f32 {
    1.0
}
fn default_lambda_mel() -> f32 {
    5.0
}
fn default_lambda_ce() -> f32 {
    20.0
}
fn default_stft_resolutions() -> Vec<[usize; 3]> {
    vec![[1024, 120, 600], [2048, 240, 1200], [512, 50, 240]]
}

impl Default for LossParams {
    fn default() -> Self {
        Self {
            lambda_mel: default_lambda_mel(),
            lambda_f0: 1.0,
            lambda_ce: default_lambda_ce(),
            lambda_norm: 1.0,
            lambda_dur: 1.0,
            lambda_gen: 1.0,
            lambda_mono: 1.0,
            lambda_s2s: 1.0,
            stft_resolutions: default_stft_resolutions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Optimizer and one-cycle schedule parameters.
pub struct OptimizerParams {
    /// Peak learning rate for every module except the fine-tuned ones.
    pub lr: f64,
    /// Fine-tuning learning rate for `decoder` and `style_encoder`.
    pub ft_lr: f64,
    #[serde(default = "default_betas")]
    pub betas: [f32; 2],
    #[serde(default = "default_eps")]
    pub eps: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default)]
    pub pct_start: f64,
    #[serde(default = "default_div_factor")]
    pub div_factor: f64,
    #[serde(default = "default_div_factor")]
    pub final_div_factor: f64,
}

fn default_betas() -> [f32; 2] {
    [0.0, 0.99]
}
fn default_eps() -> f32 {
    1e-9
}
fn default_weight_decay() -> f32 {
    1e-4
}
fn default_div_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Partial-restore overrides applied when loading the pretrained checkpoint.
pub struct TrainingStrats {
    /// Modules left at initialization instead of being restored.
    #[serde(default, deserialize_with = "module_list")]
    pub ignore_modules: Vec<String>,
    /// Modules restored but never updated.
    #[serde(default, deserialize_with = "module_list")]
    pub freeze_modules: Vec<String>,
}

/// Accept either a YAML sequence or a comma-separated string (possibly empty).
fn module_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }

    let names = match Option::<Raw>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Raw::List(list)) => list,
        Some(Raw::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}

/// Top-level training configuration.
///
/// # Example YAML
///
/// ```yaml
/// log_dir: "Models/LJSpeech"
/// pretrained_model: "hf://owner/styletts/epoch_2nd_00100.safetensors"
/// batch_size: 8
/// epochs: 50
/// data_params: { train_data: data/train.txt, val_data: data/val.txt, root_path: wavs }
/// symbol: { pad: "$", punctuation: ";:,.!?", letters: "abc", letters_ipa: "ɑɐ", extend: "" }
/// optimizer_params: { lr: 0.0001, ft_lr: 0.00001 }
/// training_strats: { ignore_modules: "", freeze_modules: "pitch_extractor" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for logs, scalars and checkpoints.
    pub log_dir: String,
    /// Checkpoint to start from; local path, `hf://` or `http(s)://`.
    #[serde(default)]
    pub pretrained_model: String,
    /// Restore weights only, with a cold optimizer and counters at zero.
    #[serde(default = "default_true")]
    pub load_only_params: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Epoch checkpoint period.
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,
    /// Batches between scalar emissions.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    /// Optimization steps between interim checkpoints.
    #[serde(default = "default_save_interval_steps")]
    pub save_interval_steps: usize,
    /// Upper bound on the loss window, in mel frames.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_true")]
    pub debug: bool,
    /// Base seed; worker `rank` samples with `seed + rank`.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of parallel workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    pub data_params: DataParams,
    #[serde(default)]
    pub symbol: Option<SymbolConfig>,
    #[serde(default)]
    pub preprocess_params: PreprocessParams,
    #[serde(default)]
    pub model_params: ModelParams,
    #[serde(default)]
    pub loss_params: LossParams,
    pub optimizer_params: OptimizerParams,
    #[serde(default)]
    pub training_strats: Option<TrainingStrats>,
}

impl Config {
    /// Check every field the run depends on and build the vocabulary.
    ///
    /// This is the first thing a run does; nothing touches data or models
    /// before it succeeds.
    pub fn validate(&self) -> anyhow::Result<Vocabulary> {
        let symbol = self
            .symbol
            .as_ref()
            .ok_or_else(|| TrainError::missing("symbol"))?;
        let vocab = Vocabulary::from_config(symbol)?;

        if self.pretrained_model.trim().is_empty() {
            return Err(TrainError::missing("pretrained_model").into());
        }
        let positive = [
            ("batch_size", self.batch_size),
            ("epochs", self.epochs),
            ("save_freq", self.save_freq),
            ("log_interval", self.log_interval),
            ("save_interval_steps", self.save_interval_steps),
            ("num_workers", self.num_workers),
            (
                "preprocess_params.spect_params.hop_length",
                self.preprocess_params.spect_params.hop_length,
            ),
            ("model_params.hidden_dim", self.model_params.hidden_dim),
            ("model_params.style_dim", self.model_params.style_dim),
            ("model_params.n_mels", self.model_params.n_mels),
            ("model_params.max_dur", self.model_params.max_dur),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(TrainError::InvalidConfig(format!("{field} must be positive")).into());
            }
        }
        if self.model_params.mpd_periods.contains(&0) || self.model_params.msd_scales.contains(&0)
        {
            return Err(TrainError::InvalidConfig(
                "discriminator periods and scales must be positive".to_string(),
            )
            .into());
        }
        if self.loss_params.stft_resolutions.is_empty() {
            return Err(TrainError::InvalidConfig(
                "loss_params.stft_resolutions must not be empty".to_string(),
            )
            .into());
        }
        Ok(vocab)
    }

    /// Modules listed under `training_strats.ignore_modules`.
    pub fn ignore_modules(&self) -> &[String] {
        self.training_strats
            .as_ref()
            .map(|strats| strats.ignore_modules.as_slice())
            .unwrap_or(&[])
    }

    /// Modules listed under `training_strats.freeze_modules`.
    pub fn freeze_modules(&self) -> &[String] {
        self.training_strats
            .as_ref()
            .map(|strats| strats.freeze_modules.as_slice())
            .unwrap_or(&[])
    }

    /// Mel frames per aligner (encoder) frame.
    pub fn frame_scale(&self) -> usize {
        1 << self.model_params.n_down
    }
}

/// Load a training configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist or contains invalid YAML.
/// Field-level checks are left to [`Config::validate`].
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&data)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_dir: logs
pretrained_model: pretrained.safetensors
data_params: { train_data: train.txt, val_data: val.txt, root_path: wavs }
symbol: { pad: "$", punctuation: ".", letters: "ab", letters_ipa: "ə", extend: "" }
optimizer_params: { lr: 0.0001, ft_lr: 0.00001 }
"#;

    #[test]
    fn defaults_follow_training_script() {
        let config: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.epochs, 200);
        assert_eq!(config.save_freq, 2);
        assert_eq!(config.log_interval, 10);
        assert_eq!(config.max_len, 200);
        assert_eq!(config.save_interval_steps, 1000);
        assert!(config.load_only_params);
        assert_eq!(config.optimizer_params.betas, [0.0, 0.99]);
        assert_eq!(config.preprocess_params.spect_params.hop_length, 300);
        assert_eq!(config.frame_scale(), 2);
        assert!(config.ignore_modules().is_empty());
        config.validate().expect("valid");
    }

    #[test]
    fn module_lists_accept_strings_and_sequences() {
        let yaml = format!(
            "{MINIMAL}training_strats: {{ ignore_modules: '', freeze_modules: 'decoder, msd' }}\n"
        );
        let config: Config = serde_yaml::from_str(&yaml).expect("parse");
        assert!(config.ignore_modules().is_empty());
        assert_eq!(config.freeze_modules(), ["decoder", "msd"]);

        let yaml = format!(
            "{MINIMAL}training_strats: {{ ignore_modules: [mpd], freeze_modules: null }}\n"
        );
        let config: Config = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(config.ignore_modules(), ["mpd"]);
        assert!(config.freeze_modules().is_empty());
    }

    #[test]
    fn missing_symbol_block_is_reported_by_name() {
        let yaml = MINIMAL
            .lines()
            .filter(|line| !line.starts_with("symbol"))
            .collect::<Vec<_>>()
            .join("\n");
        let config: Config = serde_yaml::from_str(&yaml).expect("parse");
        let err = config.validate().unwrap_err();
        match err.downcast_ref::<TrainError>() {
            Some(TrainError::MissingConfig { field }) => assert_eq!(field, "symbol"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_pretrained_path_is_fatal() {
        let yaml = MINIMAL.replace("pretrained_model: pretrained.safetensors", "");
        let config: Config = serde_yaml::from_str(&yaml).expect("parse");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pretrained_model"));
    }

    #[test]
    fn load_config_rejects_missing_file() {
        let err = load_config("does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }
}

//! Named sub-networks and the model that owns them.
//!
//! The model is an explicit, ordered mapping from [`ModuleName`] to a typed
//! field. Code that needs to address a module by name goes through
//! [`SubNetwork`], which gives each field a name and typed accessors.

pub mod aligner;
pub mod decoder;
pub mod discriminator;
pub mod encoder;
pub mod predictor;

pub use aligner::{AlignerOutput, TextAligner};
pub use decoder::{Decoder, PitchExtractor};
pub use discriminator::{DiscriminatorOutput, MultiPeriodDiscriminator, MultiScaleDiscriminator};
pub use encoder::{StyleEncoder, TextEncoder};
pub use predictor::ProsodyPredictor;

use crate::config::Config;
use crate::modules::ParamInit;
use anyhow::Result;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder};
use burn::tensor::backend::Backend;
use std::fmt;
use std::str::FromStr;

/// Closed set of sub-network names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleName {
    TextAligner,
    TextEncoder,
    StyleEncoder,
    Predictor,
    Decoder,
    PitchExtractor,
    Msd,
    Mpd,
}

impl ModuleName {
    /// Every module, in model order.
    pub const ALL: [ModuleName; 8] = [
        ModuleName::TextAligner,
        ModuleName::TextEncoder,
        ModuleName::StyleEncoder,
        ModuleName::Predictor,
        ModuleName::Decoder,
        ModuleName::PitchExtractor,
        ModuleName::Msd,
        ModuleName::Mpd,
    ];

    /// Modules stepped in the discriminator phase.
    pub const DISCRIMINATORS: [ModuleName; 2] = [ModuleName::Msd, ModuleName::Mpd];

    /// Modules stepped in the generator phase, in update order.
    pub const GENERATOR: [ModuleName; 5] = [
        ModuleName::Predictor,
        ModuleName::StyleEncoder,
        ModuleName::Decoder,
        ModuleName::TextEncoder,
        ModuleName::TextAligner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleName::TextAligner => "text_aligner",
            ModuleName::TextEncoder => "text_encoder",
            ModuleName::StyleEncoder => "style_encoder",
            ModuleName::Predictor => "predictor",
            ModuleName::Decoder => "decoder",
            ModuleName::PitchExtractor => "pitch_extractor",
            ModuleName::Msd => "msd",
            ModuleName::Mpd => "mpd",
        }
    }

    /// Modules trained with the fine-tuning learning rate.
    pub fn is_fine_tuned(self) -> bool {
        matches!(self, ModuleName::Decoder | ModuleName::StyleEncoder)
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ModuleName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown module name `{s}`"))
    }
}

/// Hyperparameters shared by every sub-network.
#[derive(Debug, Clone)]
pub struct ModelDims {
    pub n_token: usize,
    pub hidden_dim: usize,
    pub style_dim: usize,
    pub n_mels: usize,
    pub max_dur: usize,
    /// Mel frames per aligner frame.
    pub frame_scale: usize,
    /// Waveform samples per mel frame.
    pub hop_length: usize,
    pub disc_channels: usize,
    pub mpd_periods: Vec<usize>,
    pub msd_scales: Vec<usize>,
}

impl ModelDims {
    pub fn from_config(config: &Config, n_token: usize) -> Self {
        let params = &config.model_params;
        Self {
            n_token,
            hidden_dim: params.hidden_dim,
            style_dim: params.style_dim,
            n_mels: params.n_mels,
            max_dur: params.max_dur,
            frame_scale: config.frame_scale(),
            hop_length: config.preprocess_params.spect_params.hop_length,
            disc_channels: params.disc_channels,
            mpd_periods: params.mpd_periods.clone(),
            msd_scales: params.msd_scales.clone(),
        }
    }
}

/// All sub-networks of the speech model.
#[derive(Module, Debug)]
pub struct TtsModel<B: Backend> {
    pub text_aligner: TextAligner<B>,
    pub text_encoder: TextEncoder<B>,
    pub style_encoder: StyleEncoder<B>,
    pub predictor: ProsodyPredictor<B>,
    pub decoder: Decoder<B>,
    pub pitch_extractor: PitchExtractor<B>,
    pub msd: MultiScaleDiscriminator<B>,
    pub mpd: MultiPeriodDiscriminator<B>,
}

/// A named field of [`TtsModel`].
pub trait SubNetwork<B: Backend>: Module<B> {
    const NAME: ModuleName;

    fn get(model: &TtsModel<B>) -> &Self;
    fn get_mut(model: &mut TtsModel<B>) -> &mut Self;
}

macro_rules! sub_network {
    ($ty:ident, $field:ident, $name:ident) => {
        impl<B: Backend> SubNetwork<B> for $ty<B> {
            const NAME: ModuleName = ModuleName::$name;

            fn get(model: &TtsModel<B>) -> &Self {
                &model.$field
            }

            fn get_mut(model: &mut TtsModel<B>) -> &mut Self {
                &mut model.$field
            }
        }
    };
}

sub_network!(TextAligner, text_aligner, TextAligner);
sub_network!(TextEncoder, text_encoder, TextEncoder);
sub_network!(StyleEncoder, style_encoder, StyleEncoder);
sub_network!(ProsodyPredictor, predictor, Predictor);
sub_network!(Decoder, decoder, Decoder);
sub_network!(PitchExtractor, pitch_extractor, PitchExtractor);
sub_network!(MultiScaleDiscriminator, msd, Msd);
sub_network!(MultiPeriodDiscriminator, mpd, Mpd);

/// Call a generic function with the concrete sub-network type for `$name`.
macro_rules! with_sub_network {
    ($name:expr, $func:ident ( $($arg:expr),* )) => {{
        use $crate::model::*;
        match $name {
            ModuleName::TextAligner => $func::<B, TextAligner<B>>($($arg),*),
            ModuleName::TextEncoder => $func::<B, TextEncoder<B>>($($arg),*),
            ModuleName::StyleEncoder => $func::<B, StyleEncoder<B>>($($arg),*),
            ModuleName::Predictor => $func::<B, ProsodyPredictor<B>>($($arg),*),
            ModuleName::Decoder => $func::<B, Decoder<B>>($($arg),*),
            ModuleName::PitchExtractor => $func::<B, PitchExtractor<B>>($($arg),*),
            ModuleName::Msd => $func::<B, MultiScaleDiscriminator<B>>($($arg),*),
            ModuleName::Mpd => $func::<B, MultiPeriodDiscriminator<B>>($($arg),*),
        }
    }};
}
pub(crate) use with_sub_network;

fn recorder() -> NamedMpkBytesRecorder<FullPrecisionSettings> {
    NamedMpkBytesRecorder::<FullPrecisionSettings>::default()
}

fn encode_weights<B: Backend, M: SubNetwork<B>>(model: &TtsModel<B>) -> Result<Vec<u8>> {
    let record = M::get(model).clone().into_record();
    Recorder::<B>::record(&recorder(), record, ())
        .map_err(|e| anyhow::anyhow!("failed to encode {}: {e:?}", M::NAME))
}

fn load_weights<B: Backend, M: SubNetwork<B>>(
    model: &mut TtsModel<B>,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<()> {
    let record = Recorder::<B>::load::<M::Record>(&recorder(), bytes, device)
        .map_err(|e| anyhow::anyhow!("failed to decode {}: {e:?}", M::NAME))?;
    let restored = M::get(model).clone().load_record(record);
    *M::get_mut(model) = restored;
    Ok(())
}

fn count_params<B: Backend, M: SubNetwork<B>>(model: &TtsModel<B>) -> usize {
    M::get(model).num_params()
}

impl<B: Backend> TtsModel<B> {
    /// Build every sub-network with weights drawn from `seed`.
    pub fn new(dims: &ModelDims, seed: u64, device: &B::Device) -> Self {
        let mut init = ParamInit::new(seed);
        Self {
            text_aligner: TextAligner::new(dims, &mut init, device),
            text_encoder: TextEncoder::new(dims, &mut init, device),
            style_encoder: StyleEncoder::new(dims, &mut init, device),
            predictor: ProsodyPredictor::new(dims, &mut init, device),
            decoder: Decoder::new(dims, &mut init, device),
            pitch_extractor: PitchExtractor::new(dims, &mut init, device),
            msd: MultiScaleDiscriminator::new(dims, &mut init, device),
            mpd: MultiPeriodDiscriminator::new(dims, &mut init, device),
        }
    }

    /// Serialize one module's weights.
    pub fn encode_module(&self, name: ModuleName) -> Result<Vec<u8>> {
        with_sub_network!(name, encode_weights(self))
    }

    /// Replace one module's weights from bytes written by [`Self::encode_module`].
    pub fn load_module(&mut self, name: ModuleName, bytes: Vec<u8>, device: &B::Device) -> Result<()> {
        with_sub_network!(name, load_weights(self, bytes, device))
    }

    /// Parameter count of one module.
    pub fn module_num_params(&self, name: ModuleName) -> usize {
        with_sub_network!(name, count_params(self))
    }
}

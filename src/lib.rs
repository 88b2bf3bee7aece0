//! # styletts-train - Multi-worker training loop for StyleTTS-style speech synthesis
//!
//! This crate drives the second training stage of a text-to-speech model made of
//! several cooperating sub-networks (text aligner, text encoder, style encoder,
//! duration/prosody predictor, waveform decoder and two adversarial discriminators).
//!
//! ## Architecture Overview
//!
//! 1. **Launch** ([`runtime::launch`]): spawns one worker per device. Rank 0 is the
//!    master and owns every side effect (logs, scalars, checkpoints).
//!
//! 2. **Step executor** ([`train::StepExecutor::train_batch`]): runs one minibatch through
//!    alignment search ([`align`]), windowed segment sampling ([`train::sampler`])
//!    and the two-phase discriminator/generator update.
//!
//! 3. **Optimizer coordinator** ([`train::optim::OptimizerCoordinator`]): one AdamW
//!    optimizer and one one-cycle schedule per named module, stepped by name.
//!
//! 4. **Validation** ([`train::validate`]) and **checkpoints** ([`train::checkpoint`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn_autodiff::Autodiff;
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use styletts_train::{load_config, train::train};
//!
//! let config = load_config("configs/config.yaml").unwrap();
//! let device = NdArrayDevice::default();
//! let summary =
//!     train::<Autodiff<NdArray<f32>>>(&config, "configs/config.yaml".as_ref(), 2, &device).unwrap();
//! println!("finished at epoch {} after {} steps", summary.epoch, summary.iters);
//! ```
//!
//! ## Configuration
//!
//! Training is configured from a YAML file. The pretrained checkpoint may be a
//! local path or a HuggingFace URL using the `hf://` scheme. See [`Config`].

pub mod align;
pub mod audio;
pub mod config;
pub mod data;
pub mod download;
pub mod error;
pub mod losses;
pub mod model;
pub mod perf;
pub mod runtime;
pub mod state;
pub mod text;
pub mod train;
pub mod weights;

// Building blocks shared by the sub-networks and losses.
#[doc(hidden)]
pub mod modules;

pub use config::{load_config, Config};
pub use download::download_if_necessary;
pub use error::{SkipReason, TrainError};
pub use model::{ModuleName, TtsModel};
pub use state::TrainingState;
pub use text::Vocabulary;

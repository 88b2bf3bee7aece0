//! Audio loading and mel-spectrogram extraction for the data pipeline.

pub mod io;
pub mod mel;

pub use io::WavIo;
pub use mel::MelExtractor;

//! Small building blocks shared by the sub-networks and losses.

pub mod conv;
pub mod init;
pub mod mask;
pub mod stft;

pub use conv::Conv1d;
pub use init::ParamInit;

//! Utterance lists, per-worker sharding and batch collation.

pub mod batch;
pub mod dataset;
pub mod loader;

pub use batch::{Batch, DeviceBatch};
pub use dataset::{MelDataset, Utterance};
pub use loader::{DataLoader, LoaderMode};

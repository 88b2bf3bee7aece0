//! Training orchestration: segment sampling, the two-phase step, per-module
//! optimizers, validation, checkpoints and the epoch driver.

pub mod checkpoint;
pub mod optim;
pub mod report;
pub mod sampler;
pub mod step;
pub mod trainer;
pub mod validate;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointPaths, LoadReport, RestorePolicy};
pub use optim::{OneCycleSchedule, OptimizerCoordinator};
pub use report::{LossAccumulator, MemorySink, NullSink, ReportSink, Reporter, ScalarFileSink};
pub use sampler::{Segment, SegmentSampler};
pub use step::{BatchOutcome, LossTerms, StepExecutor};
pub use trainer::{train, TrainSummary};
pub use validate::{ValidationLosses, Validator};

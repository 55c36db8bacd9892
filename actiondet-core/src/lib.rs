//! # actiondet core
//!
//! Training and evaluation orchestration for spatio-temporal action
//! detection. The network, optimizer, region loss and clip datasets are
//! supplied by a [`Backend`]; this crate owns the epoch loop, the learning
//! rate schedule, frame-level scoring and the two-slot checkpoint store.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod detection;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod procedures;
pub mod schedule;

pub use backend::{
    Backend, ClipDataset, DetectionModel, Loss, LossModule, Mode, Opaque, Optimizer,
    OptimizerSettings, ParameterGroup, StateBlob,
};
pub use checkpoint::{CheckpointRecord, CheckpointStore, SavedSlots, load_checkpoint};
pub use config::{Config, ConfigOverrides, DatasetKind, TrainOverrides, load_config};
pub use context::{Device, DeviceRequirement, InitContext};
pub use data::{ClipBatch, ClipLoader, ClipSample, ClipTensor, DatasetSpec, Split};
pub use detection::{BoundingBox, Detection, FrameStats, GroundTruth, ScoreThresholds};
pub use error::{ActionDetError, CheckpointError, ConfigError, Phase};
pub use orchestrator::{EpochReport, Orchestrator, RunMode, RunSummary, TrainingState};
pub use procedures::ProcedureSet;
pub use schedule::{LrPolicy, adjust_learning_rate};

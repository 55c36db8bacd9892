//! Per-dataset training and evaluation procedures.
//!
//! Each dataset family maps to a fixed {train, evaluate, loss constructor}
//! triple. The mapping is an exhaustive `match`, resolved while the run is
//! being prepared, so an unsupported dataset is reported before a model is
//! ever built.

pub mod ucf_jhmdb;

use rand::rngs::StdRng;

use crate::backend::{Backend, DetectionModel, LossModule, Optimizer};
use crate::config::{Config, DatasetKind};
use crate::data::ClipLoader;
use crate::detection::{FrameStats, ScoreThresholds};
use crate::error::ConfigError;

/// Borrowed state for one training pass.
pub struct TrainStep<'a> {
    pub epoch: u32,
    pub model: &'a mut dyn DetectionModel,
    pub optimizer: &'a mut dyn Optimizer,
    pub loss: &'a mut dyn LossModule,
    pub loader: &'a ClipLoader,
    pub rng: &'a mut StdRng,
    pub log_every: usize,
}

/// Borrowed state for one evaluation pass. Nothing here can update weights.
pub struct EvalStep<'a> {
    pub epoch: u32,
    pub model: &'a mut dyn DetectionModel,
    pub loader: &'a ClipLoader,
    pub rng: &'a mut StdRng,
    pub thresholds: ScoreThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub batches: usize,
    pub mean_loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    pub stats: FrameStats,
    /// Higher is better; compared strictly against the best so far.
    pub score: f64,
}

pub type TrainFn = fn(TrainStep<'_>) -> anyhow::Result<TrainSummary>;
pub type EvalFn = fn(EvalStep<'_>) -> anyhow::Result<EvalSummary>;
pub type LossCtor = fn(&dyn Backend, &Config) -> anyhow::Result<Box<dyn LossModule>>;

/// The procedures a dataset family trains and evaluates with.
#[derive(Clone, Copy)]
pub struct ProcedureSet {
    pub family: &'static str,
    pub train: TrainFn,
    pub evaluate: EvalFn,
    pub build_loss: LossCtor,
}

impl std::fmt::Debug for ProcedureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedureSet")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

/// Pick the procedure triple for `dataset`.
pub fn resolve(dataset: DatasetKind) -> Result<ProcedureSet, ConfigError> {
    match dataset {
        DatasetKind::Ucf24 | DatasetKind::Jhmdb21 => Ok(ucf_jhmdb::PROCEDURES),
        DatasetKind::Ava => Err(ConfigError::UnsupportedDataset {
            dataset: dataset.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ucf_and_jhmdb_share_procedures() {
        let ucf = resolve(DatasetKind::Ucf24).unwrap();
        let jhmdb = resolve(DatasetKind::Jhmdb21).unwrap();
        assert_eq!(ucf.family, jhmdb.family);
        assert_eq!(ucf.family, "ucf24/jhmdb21");
    }

    #[test]
    fn test_ava_is_unsupported() {
        let err = resolve(DatasetKind::Ava).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedDataset { ref dataset } if dataset == "ava"));
    }
}

//! The run orchestrator.
//!
//! [`Orchestrator::prepare`] validates the configuration, resolves the
//! dataset's procedures, builds every collaborator through a [`Backend`] and
//! applies a resume checkpoint. [`Orchestrator::run`] then either evaluates
//! once or drives the `{adjust lr -> train -> evaluate -> checkpoint}` cycle
//! over the inclusive epoch range.

use chrono::Utc;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::backend::{Backend, DetectionModel, LossModule, Optimizer, OptimizerSettings};
use crate::checkpoint::{CheckpointRecord, CheckpointStore, load_checkpoint};
use crate::config::Config;
use crate::context::InitContext;
use crate::data::{ClipLoader, DatasetSpec, Split};
use crate::detection::ScoreThresholds;
use crate::error::{ActionDetError, CheckpointError, Phase};
use crate::procedures::{self, EvalStep, EvalSummary, ProcedureSet, TrainStep};
use crate::schedule::adjust_learning_rate;

/// Progress that survives between epochs and across a resume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    /// First epoch the loop will execute.
    pub begin_epoch: u32,
    /// Highest score seen so far; starts at 0.
    pub best_score: f64,
    /// Epoch of the checkpoint this run resumed from, if any.
    pub resumed_from: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    EvaluateOnly,
}

/// What one completed epoch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: u32,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub score: f64,
    pub is_best: bool,
    pub latest_path: PathBuf,
    pub best_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub epochs: Vec<EpochReport>,
    pub best_score: f64,
    /// Set only in evaluate-only mode.
    pub evaluation: Option<EvalSummary>,
}

pub struct Orchestrator {
    config: Config,
    procedures: ProcedureSet,
    context: InitContext,
    model: Box<dyn DetectionModel>,
    optimizer: Box<dyn Optimizer>,
    loss: Box<dyn LossModule>,
    train_loader: ClipLoader,
    eval_loader: ClipLoader,
    store: CheckpointStore,
    state: TrainingState,
}

impl Orchestrator {
    /// Build a ready-to-run orchestrator.
    ///
    /// Nothing is constructed on the backend until the configuration has
    /// validated and the dataset has resolved to a procedure set.
    pub fn prepare(config: Config, backend: &dyn Backend) -> Result<Self, ActionDetError> {
        config.validate()?;
        let procedures = procedures::resolve(config.train.dataset)?;
        info!(
            "dataset {} ({} procedures), backend {}",
            config.train.dataset,
            procedures.family,
            backend.name()
        );

        let context = InitContext::new(&config.runtime, &backend.devices())?;
        let devices: Vec<String> = context.devices().iter().map(ToString::to_string).collect();
        info!("seed {}, devices [{}]", context.seed(), devices.join(", "));

        let store = CheckpointStore::from_config(&config);
        store.ensure_dir()?;
        info!("backup directory {}", store.dir().display());

        let mut model = backend
            .build_model(&config, context.devices(), context.seed())
            .map_err(|e| ActionDetError::construction("model", e))?;

        let groups = model.parameter_groups(&config.train.fine_tune);
        let trainable: usize = groups.iter().map(|g| g.param_count).sum();
        info!(
            "trainable parameters: {trainable} in {} group(s)",
            groups.len()
        );

        let settings = OptimizerSettings {
            learning_rate: config.train.learning_rate,
            weight_decay: config.solver.weight_decay,
        };
        let mut optimizer = backend
            .build_optimizer(groups, settings)
            .map_err(|e| ActionDetError::construction("optimizer", e))?;

        let loss = (procedures.build_loss)(backend, &config)
            .map_err(|e| ActionDetError::construction("loss module", e))?;

        let train_loader = open_loader(backend, &config, Split::Train)?;
        let eval_loader = open_loader(backend, &config, Split::Test)?;
        info!(
            "train clips {}, test clips {}",
            train_loader.num_samples(),
            eval_loader.num_samples()
        );

        let mut state = TrainingState {
            begin_epoch: config.train.begin_epoch,
            best_score: 0.0,
            resumed_from: None,
        };
        resume(&config, model.as_mut(), optimizer.as_mut(), &mut state)?;

        Ok(Self {
            config,
            procedures,
            context,
            model,
            optimizer,
            loss,
            train_loader,
            eval_loader,
            store,
            state,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run to completion of the configured mode.
    pub fn run(&mut self) -> Result<RunSummary, ActionDetError> {
        if self.config.train.evaluate {
            return self.evaluate_only();
        }

        let end = self.config.train.end_epoch;
        if self.state.begin_epoch > end {
            warn!(
                "begin epoch {} is past end epoch {end}; nothing to train",
                self.state.begin_epoch
            );
        }

        let mut epochs = Vec::new();
        for epoch in self.state.begin_epoch..=end {
            epochs.push(self.run_epoch(epoch)?);
        }

        info!("finished; best score {:.6}", self.state.best_score);
        Ok(RunSummary {
            mode: RunMode::Train,
            epochs,
            best_score: self.state.best_score,
            evaluation: None,
        })
    }

    fn evaluate_only(&mut self) -> Result<RunSummary, ActionDetError> {
        info!("evaluate-only mode");
        let summary = self.evaluate(0)?;
        Ok(RunSummary {
            mode: RunMode::EvaluateOnly,
            epochs: Vec::new(),
            best_score: self.state.best_score,
            evaluation: Some(summary),
        })
    }

    fn run_epoch(&mut self, epoch: u32) -> Result<EpochReport, ActionDetError> {
        let lr = adjust_learning_rate(
            self.optimizer.as_mut(),
            &self.config.solver.lr_policy,
            self.config.train.learning_rate,
            epoch,
        );
        info!("training at epoch {epoch}, lr {lr}");

        let trained = (self.procedures.train)(TrainStep {
            epoch,
            model: self.model.as_mut(),
            optimizer: self.optimizer.as_mut(),
            loss: self.loss.as_mut(),
            loader: &self.train_loader,
            rng: self.context.rng(),
            log_every: self.config.train.log_every,
        })
        .map_err(|source| ActionDetError::Procedure {
            phase: Phase::Training,
            epoch,
            source,
        })?;

        let evaluated = self.evaluate(epoch)?;
        let score = evaluated.score;

        let is_best = score > self.state.best_score;
        if is_best {
            info!(
                "new best score {score:.6} (previous {:.6})",
                self.state.best_score
            );
            self.state.best_score = score;
        }

        let slots = self
            .checkpoint(epoch, score)
            .and_then(|record| self.store.save(&record, is_best))
            .map_err(|source| ActionDetError::Persistence { epoch, source })?;
        info!("saved latest checkpoint to {}", slots.latest.display());
        if let Some(best) = &slots.best {
            info!("saved best checkpoint to {}", best.display());
        }

        Ok(EpochReport {
            epoch,
            learning_rate: lr,
            train_loss: trained.mean_loss,
            score,
            is_best,
            latest_path: slots.latest,
            best_path: slots.best,
        })
    }

    fn evaluate(&mut self, epoch: u32) -> Result<EvalSummary, ActionDetError> {
        info!("testing at epoch {epoch}");
        let thresholds = ScoreThresholds {
            conf_thresh: self.config.eval.conf_thresh,
            nms_thresh: self.config.eval.nms_thresh,
            iou_thresh: self.config.eval.iou_thresh,
        };
        let summary = (self.procedures.evaluate)(EvalStep {
            epoch,
            model: self.model.as_mut(),
            loader: &self.eval_loader,
            rng: self.context.rng(),
            thresholds,
        })
        .map_err(|source| ActionDetError::Procedure {
            phase: Phase::Evaluation,
            epoch,
            source,
        })?;

        if !summary.score.is_finite() {
            return Err(ActionDetError::Procedure {
                phase: Phase::Evaluation,
                epoch,
                source: anyhow::anyhow!("score is {}", summary.score),
            });
        }
        Ok(summary)
    }

    fn checkpoint(&self, epoch: u32, score: f64) -> Result<CheckpointRecord, CheckpointError> {
        let model_state = self
            .model
            .state()
            .map_err(|source| CheckpointError::Export {
                component: "model",
                source,
            })?;
        let optimizer_state = self
            .optimizer
            .state()
            .map_err(|source| CheckpointError::Export {
                component: "optimizer",
                source,
            })?;
        Ok(CheckpointRecord {
            dataset: self.config.train.dataset,
            num_frames: self.config.data.num_frames,
            epoch,
            score,
            saved_at: Utc::now(),
            model_state,
            optimizer_state,
        })
    }
}

fn open_loader(
    backend: &dyn Backend,
    config: &Config,
    split: Split,
) -> Result<ClipLoader, ActionDetError> {
    let spec = DatasetSpec::from_config(config, split);
    let (component, train) = match split {
        Split::Train => ("training dataset", true),
        Split::Test => ("evaluation dataset", false),
    };
    let dataset = backend
        .open_dataset(&spec)
        .map_err(|e| ActionDetError::construction(component, e))?;
    let batch_size = config.train.batch_size;
    Ok(if train {
        ClipLoader::for_training(dataset, batch_size)
    } else {
        ClipLoader::for_evaluation(dataset, batch_size)
    })
}

/// Apply the configured resume checkpoint, if there is one to apply.
///
/// A configured path with no file behind it is skipped with a warning; a
/// file that exists but cannot be decoded or restored is fatal.
fn resume(
    config: &Config,
    model: &mut dyn DetectionModel,
    optimizer: &mut dyn Optimizer,
    state: &mut TrainingState,
) -> Result<(), ActionDetError> {
    let Some(path) = config.resume_path() else {
        return Ok(());
    };

    let record = match load_checkpoint(path).map_err(ActionDetError::Resume)? {
        Some(record) => record,
        None => {
            warn!(
                "no checkpoint at {}; starting from epoch {}",
                path.display(),
                state.begin_epoch
            );
            return Ok(());
        }
    };

    if record.dataset != config.train.dataset || record.num_frames != config.data.num_frames {
        warn!(
            "checkpoint {} was saved for {} with {} frames, run is {} with {} frames",
            path.display(),
            record.dataset,
            record.num_frames,
            config.train.dataset,
            config.data.num_frames
        );
    }

    let rejected = |component: &str, e: anyhow::Error| {
        ActionDetError::Resume(CheckpointError::malformed(
            path,
            format!("{component} state rejected: {e:#}"),
        ))
    };
    model
        .load_state(&record.model_state)
        .map_err(|e| rejected("model", e))?;
    optimizer
        .load_state(&record.optimizer_state)
        .map_err(|e| rejected("optimizer", e))?;

    state.begin_epoch = record.epoch.saturating_add(1);
    state.best_score = record.score;
    state.resumed_from = Some(record.epoch);
    info!(
        "resumed from {} (epoch {}, score {:.6}); next epoch {}",
        path.display(),
        record.epoch,
        record.score,
        state.begin_epoch
    );
    Ok(())
}

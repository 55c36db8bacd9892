//! Configuration system for actiondet.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file ->
//! environment -> CLI overrides. The sections follow the layout of the
//! experiment files the models were originally tuned with (`train`, `solver`,
//! `data`, `list_data`, `data_loader`), plus `eval` and `runtime`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::context::DeviceRequirement;
use crate::error::ConfigError;
use crate::schedule::LrPolicy;

/// Environment variable prefix, e.g. `ACTIONDET_TRAIN__LEARNING_RATE=0.0002`.
pub const ENV_PREFIX: &str = "ACTIONDET_";

/// The clip datasets a configuration may name.
///
/// Unknown names are rejected when the configuration is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Ucf24,
    Jhmdb21,
    Ava,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Ucf24 => "ucf24",
            DatasetKind::Jhmdb21 => "jhmdb21",
            DatasetKind::Ava => "ava",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ucf24" => Ok(DatasetKind::Ucf24),
            "jhmdb21" => Ok(DatasetKind::Jhmdb21),
            "ava" => Ok(DatasetKind::Ava),
            other => Err(ConfigError::invalid(
                "train.dataset",
                format!("unknown dataset '{other}' (expected ucf24, jhmdb21 or ava)"),
            )),
        }
    }
}

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub train: TrainConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub list_data: ListDataConfig,
    #[serde(default)]
    pub data_loader: DataLoaderConfig,
    #[serde(default)]
    pub eval: EvalConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Directory receiving the "latest" and "best" checkpoint slots.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            train: TrainConfig::default(),
            solver: SolverConfig::default(),
            data: DataConfig::default(),
            list_data: ListDataConfig::default(),
            data_loader: DataLoaderConfig::default(),
            eval: EvalConfig::default(),
            runtime: RuntimeConfig::default(),
            backup_dir: default_backup_dir(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backup")
}

/// Training schedule and optimisation inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub dataset: DatasetKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_begin_epoch")]
    pub begin_epoch: u32,
    #[serde(default = "default_end_epoch")]
    pub end_epoch: u32,
    /// Run a single evaluation pass and exit.
    #[serde(default)]
    pub evaluate: bool,
    /// Checkpoint to resume from. Missing files are skipped with a warning.
    #[serde(default)]
    pub resume_path: Option<PathBuf>,
    #[serde(default)]
    pub fine_tune: FineTuneConfig,
    /// Emit a running-loss line every N training batches.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Ucf24,
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            begin_epoch: default_begin_epoch(),
            end_epoch: default_end_epoch(),
            evaluate: false,
            resume_path: None,
            fine_tune: FineTuneConfig::default(),
            log_every: default_log_every(),
        }
    }
}

fn default_batch_size() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_begin_epoch() -> u32 {
    1
}

fn default_end_epoch() -> u32 {
    5
}

fn default_log_every() -> usize {
    20
}

/// Which backbone branches stay frozen while fine-tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FineTuneConfig {
    #[serde(default)]
    pub freeze_backbone_2d: bool,
    #[serde(default)]
    pub freeze_backbone_3d: bool,
}

/// Optimizer and schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub lr_policy: LrPolicy,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            weight_decay: default_weight_decay(),
            lr_policy: LrPolicy::default(),
        }
    }
}

fn default_weight_decay() -> f64 {
    5e-4
}

/// Clip geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Frames per clip; also part of the checkpoint file names.
    #[serde(default = "default_num_frames")]
    pub num_frames: usize,
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: usize,
    #[serde(default = "default_crop_size")]
    pub train_crop_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_frames: default_num_frames(),
            sampling_rate: default_sampling_rate(),
            train_crop_size: default_crop_size(),
        }
    }
}

fn default_num_frames() -> usize {
    16
}

fn default_sampling_rate() -> usize {
    1
}

fn default_crop_size() -> usize {
    224
}

/// Where the split list files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDataConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_train_file")]
    pub train_file: PathBuf,
    #[serde(default = "default_test_file")]
    pub test_file: PathBuf,
}

impl Default for ListDataConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            train_file: default_train_file(),
            test_file: default_test_file(),
        }
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("datasets/ucf24")
}

fn default_train_file() -> PathBuf {
    PathBuf::from("datasets/ucf24/trainlist.txt")
}

fn default_test_file() -> PathBuf {
    PathBuf::from("datasets/ucf24/testlist.txt")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
        }
    }
}

fn default_num_workers() -> usize {
    4
}

/// Thresholds for frame-level detection scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    #[serde(default = "default_conf_thresh")]
    pub conf_thresh: f32,
    #[serde(default = "default_nms_thresh")]
    pub nms_thresh: f32,
    #[serde(default = "default_iou_thresh")]
    pub iou_thresh: f32,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            conf_thresh: default_conf_thresh(),
            nms_thresh: default_nms_thresh(),
            iou_thresh: default_iou_thresh(),
        }
    }
}

fn default_conf_thresh() -> f32 {
    0.005
}

fn default_nms_thresh() -> f32 {
    0.4
}

fn default_iou_thresh() -> f32 {
    0.5
}

/// Seed and device selection, consumed by [`crate::context::InitContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceRequirement,
    #[serde(default = "default_gpu_ids")]
    pub gpu_ids: Vec<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            device: DeviceRequirement::default(),
            gpu_ids: default_gpu_ids(),
        }
    }
}

fn default_seed() -> u64 {
    42
}

fn default_gpu_ids() -> Vec<usize> {
    vec![0]
}

impl Config {
    /// Reject values no run could succeed with.
    ///
    /// Runs before any backend is touched, so a bad file never leaves a
    /// half-built model behind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let train = &self.train;
        if train.batch_size == 0 {
            return Err(ConfigError::invalid("train.batch_size", "must be >= 1"));
        }
        if !train.learning_rate.is_finite() || train.learning_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "train.learning_rate",
                "must be a finite value > 0",
            ));
        }
        if train.log_every == 0 {
            return Err(ConfigError::invalid("train.log_every", "must be >= 1"));
        }
        if !self.solver.weight_decay.is_finite() || self.solver.weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                "solver.weight_decay",
                "must be a finite value >= 0",
            ));
        }
        self.solver.lr_policy.validate()?;

        if self.data.num_frames == 0 {
            return Err(ConfigError::invalid("data.num_frames", "must be >= 1"));
        }
        if self.data.sampling_rate == 0 {
            return Err(ConfigError::invalid("data.sampling_rate", "must be >= 1"));
        }
        if self.data.train_crop_size == 0 {
            return Err(ConfigError::invalid("data.train_crop_size", "must be >= 1"));
        }

        for (key, value) in [
            ("eval.conf_thresh", self.eval.conf_thresh),
            ("eval.nms_thresh", self.eval.nms_thresh),
            ("eval.iou_thresh", self.eval.iou_thresh),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(key, "must lie in [0, 1]"));
            }
        }

        for (key, path) in [
            ("backup_dir", &self.backup_dir),
            ("list_data.base_path", &self.list_data.base_path),
            ("list_data.train_file", &self.list_data.train_file),
            ("list_data.test_file", &self.list_data.test_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::missing_path(key));
            }
        }

        Ok(())
    }

    /// The configured resume path, treating an empty string as "not set".
    pub fn resume_path(&self) -> Option<&Path> {
        self.train
            .resume_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Values supplied on the command line; `None` leaves lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "TrainOverrides::is_empty")]
    pub train: TrainOverrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_epoch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_epoch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_path: Option<PathBuf>,
}

impl TrainOverrides {
    fn is_empty(&self) -> bool {
        self.dataset.is_none()
            && self.begin_epoch.is_none()
            && self.end_epoch.is_none()
            && self.evaluate.is_none()
            && self.resume_path.is_none()
    }
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `ACTIONDET_`, `__` between sections)
/// 3. The TOML file given by `config_file`
/// 4. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<Config, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(path) = config_file {
        if !path.is_file() {
            return Err(ConfigError::invalid(
                "config",
                format!("{} is not a readable file", path.display()),
            ));
        }
        figment = figment.merge(Toml::file(path));
    }

    // ACTIONDET_TRAIN__DATASET, ACTIONDET_SOLVER__WEIGHT_DECAY, etc.
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: Config = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        load_config(Some(file.path()), None)
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.train.dataset, DatasetKind::Ucf24);
        assert_eq!(config.data.num_frames, 16);
        assert!(config.resume_path().is_none());
    }

    #[test]
    fn test_toml_sections_merge_over_defaults() {
        let config = from_toml(
            r#"
            backup_dir = "runs/jhmdb"

            [train]
            dataset = "jhmdb21"
            learning_rate = 0.0002
            end_epoch = 10

            [solver.lr_policy]
            kind = "exponential"
            gamma = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.train.dataset, DatasetKind::Jhmdb21);
        assert_eq!(config.train.end_epoch, 10);
        assert_eq!(config.train.batch_size, 8);
        assert_eq!(config.backup_dir, PathBuf::from("runs/jhmdb"));
        assert_eq!(config.solver.lr_policy, LrPolicy::Exponential { gamma: 0.9 });
    }

    #[test]
    fn test_unknown_dataset_is_rejected() {
        let err = from_toml("[train]\ndataset = \"kinetics\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_dataset_from_str() {
        assert_eq!("JHMDB21".parse::<DatasetKind>().unwrap(), DatasetKind::Jhmdb21);
        assert!("kinetics".parse::<DatasetKind>().is_err());
    }

    #[test]
    fn test_ava_is_a_recognized_name() {
        let config = from_toml("[train]\ndataset = \"ava\"\n").unwrap();
        assert_eq!(config.train.dataset, DatasetKind::Ava);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.train.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("train.batch_size"));
    }

    #[test]
    fn test_validate_rejects_nan_learning_rate() {
        let mut config = Config::default();
        config.train.learning_rate = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_backup_dir() {
        let mut config = Config::default();
        config.backup_dir = PathBuf::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPath { .. })
        ));
    }

    #[test]
    fn test_empty_resume_path_means_unset() {
        let mut config = Config::default();
        config.train.resume_path = Some(PathBuf::new());
        assert!(config.resume_path().is_none());
        config.train.resume_path = Some(PathBuf::from("backup/x.json"));
        assert_eq!(config.resume_path(), Some(Path::new("backup/x.json")));
    }

    #[test]
    fn test_overrides_beat_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[train]\nbegin_epoch = 2\nend_epoch = 4\nevaluate = false").unwrap();

        let overrides = ConfigOverrides {
            train: TrainOverrides {
                end_epoch: Some(9),
                evaluate: Some(true),
                ..Default::default()
            },
            backup_dir: Some(dir.path().join("ckpt")),
        };
        let config = load_config(Some(&path), Some(&overrides)).unwrap();
        assert_eq!(config.train.begin_epoch, 2);
        assert_eq!(config.train.end_epoch, 9);
        assert!(config.train.evaluate);
        assert_eq!(config.backup_dir, dir.path().join("ckpt"));
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/run.toml")), None).unwrap_err();
        assert!(err.to_string().contains("config"));
    }
}

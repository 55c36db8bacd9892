//! Checkpoint records and the two-slot checkpoint store.
//!
//! A run keeps two files in its backup directory: a rolling "latest" slot
//! rewritten after every epoch and a "best" slot rewritten only when the
//! epoch's score beats every earlier one. Each write is a complete,
//! self-describing document written atomically, so a crash between the two
//! writes never damages either slot.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::backend::StateBlob;
use crate::config::{Config, DatasetKind};
use crate::error::CheckpointError;
use crate::persistence;

/// Envelope version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Snapshot of training progress at the end of an epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub dataset: DatasetKind,
    pub num_frames: usize,
    pub epoch: u32,
    pub score: f64,
    pub saved_at: DateTime<Utc>,
    pub model_state: StateBlob,
    pub optimizer_state: StateBlob,
}

/// On-disk JSON layout.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format_version: u32,
    dataset: DatasetKind,
    num_frames: usize,
    epoch: u32,
    score: f64,
    saved_at: DateTime<Utc>,
    model_state: String,
    optimizer_state: String,
    digest: String,
}

impl CheckpointRecord {
    /// SHA-256 over everything that drives a resume.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.epoch.to_le_bytes());
        hasher.update(self.score.to_bits().to_le_bytes());
        hasher.update((self.model_state.len() as u64).to_le_bytes());
        hasher.update(self.model_state.as_bytes());
        hasher.update((self.optimizer_state.len() as u64).to_le_bytes());
        hasher.update(self.optimizer_state.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn to_envelope(&self) -> Envelope {
        Envelope {
            format_version: FORMAT_VERSION,
            dataset: self.dataset,
            num_frames: self.num_frames,
            epoch: self.epoch,
            score: self.score,
            saved_at: self.saved_at,
            model_state: BASE64.encode(self.model_state.as_bytes()),
            optimizer_state: BASE64.encode(self.optimizer_state.as_bytes()),
            digest: self.digest(),
        }
    }

    fn from_envelope(path: &Path, envelope: Envelope) -> Result<Self, CheckpointError> {
        if envelope.format_version != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: envelope.format_version,
                supported: FORMAT_VERSION,
            });
        }
        let decode = |field: &str, text: &str| {
            BASE64
                .decode(text)
                .map(StateBlob)
                .map_err(|e| CheckpointError::malformed(path, format!("{field}: {e}")))
        };
        let record = Self {
            dataset: envelope.dataset,
            num_frames: envelope.num_frames,
            epoch: envelope.epoch,
            score: envelope.score,
            saved_at: envelope.saved_at,
            model_state: decode("model_state", &envelope.model_state)?,
            optimizer_state: decode("optimizer_state", &envelope.optimizer_state)?,
        };
        let actual = record.digest();
        if actual != envelope.digest {
            return Err(CheckpointError::DigestMismatch {
                path: path.to_path_buf(),
                expected: envelope.digest,
                actual,
            });
        }
        if !is_valid_score(record.score) {
            return Err(CheckpointError::malformed(
                path,
                format!("score {} is not a finite value >= 0", record.score),
            ));
        }
        Ok(record)
    }

    /// Write this record to `path` atomically.
    pub fn write_to(&self, path: &Path) -> Result<(), CheckpointError> {
        if !is_valid_score(self.score) {
            return Err(CheckpointError::malformed(
                path,
                format!("refusing to write score {}, expected a finite value >= 0", self.score),
            ));
        }
        persistence::atomic_write_json(path, &self.to_envelope()).map_err(|source| {
            CheckpointError::Write {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// F-scores live in `[0, 1]`; anything negative or non-finite is corrupt.
fn is_valid_score(score: f64) -> bool {
    score.is_finite() && score >= 0.0
}

/// Load a checkpoint.
///
/// Returns `Ok(None)` when nothing readable-as-a-file exists at `path`;
/// a present file that does not parse or verify is an error.
pub fn load_checkpoint(path: &Path) -> Result<Option<CheckpointRecord>, CheckpointError> {
    let bytes = match persistence::read_if_file(path) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let envelope: Envelope = serde_json::from_slice(&bytes)
        .map_err(|e| CheckpointError::malformed(path, e.to_string()))?;
    CheckpointRecord::from_envelope(path, envelope).map(Some)
}

/// Paths written for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSlots {
    pub latest: PathBuf,
    pub best: Option<PathBuf>,
}

/// The "latest" and "best" slots of one run.
///
/// File names carry the dataset and clip length, e.g.
/// `ucf24_16f_latest.json` and `ucf24_16f_best.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    dataset: DatasetKind,
    num_frames: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, dataset: DatasetKind, num_frames: usize) -> Self {
        Self {
            dir: dir.into(),
            dataset,
            num_frames,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.backup_dir.clone(),
            config.train.dataset,
            config.data.num_frames,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.slot_path("latest")
    }

    pub fn best_path(&self) -> PathBuf {
        self.slot_path("best")
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}f_{slot}.json", self.dataset, self.num_frames))
    }

    /// Create the backup directory if it does not exist yet.
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Write `record` to the latest slot, and to the best slot too when
    /// `is_best`. Both writes serialize the record itself.
    pub fn save(
        &self,
        record: &CheckpointRecord,
        is_best: bool,
    ) -> Result<SavedSlots, CheckpointError> {
        let latest = self.latest_path();
        record.write_to(&latest)?;

        let best = if is_best {
            let path = self.best_path();
            record.write_to(&path)?;
            Some(path)
        } else {
            None
        };

        Ok(SavedSlots { latest, best })
    }
}

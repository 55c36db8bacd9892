//! Error types for the actiondet core library.
//!
//! Uses `thiserror` for the public error taxonomy. Collaborators (models,
//! optimizers, loss modules, datasets) report failures as `anyhow::Error`;
//! the orchestrator wraps them into the typed variants below so the caller
//! can tell a bad configuration apart from a crashed training step.

use std::fmt;
use std::path::PathBuf;

/// Top-level error type for a training or evaluation run.
#[derive(Debug, thiserror::Error)]
pub enum ActionDetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Device error: {message}")]
    Device { message: String },

    #[error("Failed to construct {component}")]
    Construction {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Resume failed")]
    Resume(#[source] CheckpointError),

    #[error("{phase} failed at epoch {epoch}")]
    Procedure {
        phase: Phase,
        epoch: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Persisting checkpoint for epoch {epoch} failed")]
    Persistence {
        epoch: u32,
        #[source]
        source: CheckpointError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ActionDetError {
    pub fn construction(component: &'static str, source: anyhow::Error) -> Self {
        Self::Construction { component, source }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device {
            message: message.into(),
        }
    }
}

/// Which half of an epoch a procedure error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Evaluation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Training => f.write_str("Training"),
            Phase::Evaluation => f.write_str("Evaluation"),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Missing required path: {key}")]
    MissingPath { key: String },

    #[error("Unsupported dataset '{dataset}': no training/evaluation procedures are available")]
    UnsupportedDataset { dataset: String },

    #[error("Failed to load configuration")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_path(key: impl Into<String>) -> Self {
        Self::MissingPath { key: key.into() }
    }
}

/// Errors from reading or writing checkpoint files.
///
/// A missing file is not an error: loaders return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Cannot read checkpoint {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Checkpoint {path} failed integrity check (expected digest {expected}, computed {actual})")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Checkpoint {path} has format version {found}, this build reads version {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("Cannot write checkpoint {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot export {component} state")]
    Export {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl CheckpointError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

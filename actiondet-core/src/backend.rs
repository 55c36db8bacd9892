//! Collaborator traits.
//!
//! The network, its optimizer, the region loss and the clip datasets live
//! outside this crate. A [`Backend`] builds them; the orchestrator and the
//! procedures only ever call through these traits.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Config, FineTuneConfig};
use crate::context::Device;
use crate::data::{ClipSample, ClipTensor, DatasetSpec};
use crate::detection::{Detection, GroundTruth};

/// Serialized model or optimizer state. The layout belongs to the backend
/// that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateBlob(pub Vec<u8>);

impl StateBlob {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Backend-owned value passed between model, loss and optimizer
/// (raw network output, autograd handles).
pub struct Opaque(Box<dyn Any + Send>);

impl Opaque {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Opaque(..)")
    }
}

/// A slice of the model's trainable parameters sharing one learning-rate
/// multiplier.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGroup {
    pub name: String,
    pub lr_mult: f64,
    pub param_count: usize,
}

impl ParameterGroup {
    pub fn new(name: impl Into<String>, lr_mult: f64, param_count: usize) -> Self {
        Self {
            name: name.into(),
            lr_mult,
            param_count,
        }
    }
}

/// Hyperparameters handed to the optimizer uniformly; per-group overrides
/// come from [`ParameterGroup::lr_mult`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Scalar loss for one batch plus named components for logging.
#[derive(Debug)]
pub struct Loss {
    pub value: f64,
    pub components: BTreeMap<String, f64>,
    /// Whatever the backend needs to run the backward pass.
    pub handle: Option<Opaque>,
}

impl Loss {
    pub fn scalar(value: f64) -> Self {
        Self {
            value,
            components: BTreeMap::new(),
            handle: None,
        }
    }
}

/// The detection network: clips in, raw output out.
pub trait DetectionModel: Send {
    /// Trainable parameter groups after applying the freeze policy.
    /// Frozen branches are left out entirely.
    fn parameter_groups(&self, policy: &FineTuneConfig) -> Vec<ParameterGroup>;

    fn set_mode(&mut self, mode: Mode);

    fn forward(&mut self, clips: &[ClipTensor]) -> anyhow::Result<Opaque>;

    /// Turn raw output into per-clip detections above `conf_thresh`.
    fn decode(&self, output: &Opaque, conf_thresh: f32) -> anyhow::Result<Vec<Vec<Detection>>>;

    fn backward(&mut self, loss: &Loss) -> anyhow::Result<()>;

    fn state(&self) -> anyhow::Result<StateBlob>;

    fn load_state(&mut self, state: &StateBlob) -> anyhow::Result<()>;
}

/// Optimizer over the model's parameter groups.
pub trait Optimizer: Send {
    fn param_groups(&self) -> &[ParameterGroup];

    /// Set the effective learning rate of group `index`.
    fn set_group_lr(&mut self, index: usize, lr: f64);

    fn group_lr(&self, index: usize) -> Option<f64>;

    fn zero_grad(&mut self, model: &mut dyn DetectionModel);

    fn step(&mut self, model: &mut dyn DetectionModel) -> anyhow::Result<()>;

    fn state(&self) -> anyhow::Result<StateBlob>;

    fn load_state(&mut self, state: &StateBlob) -> anyhow::Result<()>;
}

/// Region loss over raw network output.
pub trait LossModule: Send {
    fn forward(
        &mut self,
        output: &Opaque,
        targets: &[Vec<GroundTruth>],
        epoch: u32,
        batch_index: usize,
    ) -> anyhow::Result<Loss>;
}

/// Random-access clip dataset for one split.
pub trait ClipDataset: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> anyhow::Result<ClipSample>;
}

/// Factory for every collaborator a run needs.
pub trait Backend {
    fn name(&self) -> &str;

    /// Compute devices this backend can place a model on.
    fn devices(&self) -> Vec<Device>;

    fn build_model(
        &self,
        config: &Config,
        devices: &[Device],
        seed: u64,
    ) -> anyhow::Result<Box<dyn DetectionModel>>;

    fn build_optimizer(
        &self,
        groups: Vec<ParameterGroup>,
        settings: OptimizerSettings,
    ) -> anyhow::Result<Box<dyn Optimizer>>;

    fn build_region_loss(&self, config: &Config) -> anyhow::Result<Box<dyn LossModule>>;

    fn open_dataset(&self, spec: &DatasetSpec) -> anyhow::Result<Box<dyn ClipDataset>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_downcast() {
        let value = Opaque::new(vec![1.0f32, 2.0]);
        assert_eq!(value.downcast_ref::<Vec<f32>>(), Some(&vec![1.0, 2.0]));
        assert!(value.downcast_ref::<String>().is_none());
        assert_eq!(format!("{value:?}"), "Opaque(..)");
    }

    #[test]
    fn test_state_blob() {
        let blob = StateBlob::new(b"abc".to_vec());
        assert_eq!(blob.len(), 3);
        assert!(!blob.is_empty());
        assert!(StateBlob::default().is_empty());
    }
}

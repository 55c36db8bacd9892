//! Recording fake backend shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use actiondet_core::config::FineTuneConfig;
use actiondet_core::{
    Backend, BoundingBox, ClipDataset, ClipSample, ClipTensor, Config, DatasetSpec, Detection,
    DetectionModel, Device, DeviceRequirement, GroundTruth, Loss, LossModule, Mode, Opaque,
    Optimizer, OptimizerSettings, ParameterGroup, Split, StateBlob,
};

/// Every collaborator call the orchestrator made.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub build_model: usize,
    pub build_optimizer: usize,
    pub build_loss: usize,
    pub opened: Vec<Split>,
    pub seed: Option<u64>,
    pub settings: Option<OptimizerSettings>,
    pub train_passes: usize,
    pub eval_passes: usize,
    pub optimizer_steps: usize,
    /// `(group index, lr)` in call order.
    pub group_lrs: Vec<(usize, f64)>,
    pub loaded_model_state: Option<Vec<u8>>,
    pub loaded_optimizer_state: Option<Vec<u8>>,
}

#[derive(Clone)]
pub struct FakeBackend {
    pub calls: Arc<Mutex<Calls>>,
    pub devices: Vec<Device>,
    pub train_clips: usize,
    pub eval_clips: usize,
    /// Clips detected correctly in each evaluation pass, in call order.
    /// The last entry repeats once the list runs out.
    pub hits: Vec<usize>,
    /// 1-based training pass whose first forward call fails.
    pub fail_train_pass: Option<usize>,
    /// 1-based evaluation pass whose first forward call fails.
    pub fail_eval_pass: Option<usize>,
    pub fail_model: bool,
    pub groups: Vec<ParameterGroup>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            calls: Arc::default(),
            devices: vec![Device::Cpu],
            train_clips: 4,
            eval_clips: 4,
            hits: vec![2],
            fail_train_pass: None,
            fail_eval_pass: None,
            fail_model: false,
            groups: vec![ParameterGroup::new("head", 1.0, 1_000)],
        }
    }
}

impl FakeBackend {
    pub fn with_hits(hits: Vec<usize>) -> Self {
        Self {
            hits,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }
}

/// A fresh CPU config writing checkpoints under `dir`.
pub fn config(dir: &Path, begin: u32, end: u32) -> Config {
    let mut config = Config::default();
    config.backup_dir = dir.to_path_buf();
    config.train.begin_epoch = begin;
    config.train.end_epoch = end;
    config.train.batch_size = 2;
    config.train.log_every = 1;
    config.runtime.device = DeviceRequirement::Cpu;
    config
}

pub fn annotated_box() -> BoundingBox {
    BoundingBox::new(0.5, 0.5, 0.3, 0.3)
}

impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }

    fn build_model(
        &self,
        _config: &Config,
        _devices: &[Device],
        seed: u64,
    ) -> anyhow::Result<Box<dyn DetectionModel>> {
        let mut calls = self.calls.lock().unwrap();
        calls.build_model += 1;
        calls.seed = Some(seed);
        if self.fail_model {
            anyhow::bail!("weights file not found");
        }
        Ok(Box::new(FakeModel {
            calls: Arc::clone(&self.calls),
            hits: self.hits.clone(),
            fail_train_pass: self.fail_train_pass,
            fail_eval_pass: self.fail_eval_pass,
            groups: self.groups.clone(),
            mode: Mode::Train,
            seen_in_pass: 0,
            steps: 0,
        }))
    }

    fn build_optimizer(
        &self,
        groups: Vec<ParameterGroup>,
        settings: OptimizerSettings,
    ) -> anyhow::Result<Box<dyn Optimizer>> {
        let mut calls = self.calls.lock().unwrap();
        calls.build_optimizer += 1;
        calls.settings = Some(settings);
        let lrs = vec![settings.learning_rate; groups.len()];
        Ok(Box::new(FakeOptimizer {
            calls: Arc::clone(&self.calls),
            groups,
            lrs,
        }))
    }

    fn build_region_loss(&self, _config: &Config) -> anyhow::Result<Box<dyn LossModule>> {
        self.calls.lock().unwrap().build_loss += 1;
        Ok(Box::new(ConstantLoss))
    }

    fn open_dataset(&self, spec: &DatasetSpec) -> anyhow::Result<Box<dyn ClipDataset>> {
        self.calls.lock().unwrap().opened.push(spec.split);
        let len = match spec.split {
            Split::Train => self.train_clips,
            Split::Test => self.eval_clips,
        };
        Ok(Box::new(OneBoxClips(len)))
    }
}

/// Every clip is annotated with one class-1 box.
struct OneBoxClips(usize);

impl ClipDataset for OneBoxClips {
    fn len(&self) -> usize {
        self.0
    }

    fn get(&self, index: usize) -> anyhow::Result<ClipSample> {
        Ok(ClipSample {
            clip_id: format!("clip-{index}"),
            clip: ClipTensor::zeros([3, 2, 2, 2]),
            targets: vec![GroundTruth {
                class_id: 1,
                bbox: annotated_box(),
            }],
        })
    }
}

struct FakeModel {
    calls: Arc<Mutex<Calls>>,
    hits: Vec<usize>,
    fail_train_pass: Option<usize>,
    fail_eval_pass: Option<usize>,
    groups: Vec<ParameterGroup>,
    mode: Mode,
    seen_in_pass: usize,
    steps: usize,
}

impl DetectionModel for FakeModel {
    fn parameter_groups(&self, policy: &FineTuneConfig) -> Vec<ParameterGroup> {
        self.groups
            .iter()
            .filter(|g| !(policy.freeze_backbone_2d && g.name == "backbone_2d"))
            .filter(|g| !(policy.freeze_backbone_3d && g.name == "backbone_3d"))
            .cloned()
            .collect()
    }

    fn set_mode(&mut self, mode: Mode) {
        let mut calls = self.calls.lock().unwrap();
        match mode {
            Mode::Train => calls.train_passes += 1,
            Mode::Eval => calls.eval_passes += 1,
        }
        self.mode = mode;
        self.seen_in_pass = 0;
    }

    fn forward(&mut self, clips: &[ClipTensor]) -> anyhow::Result<Opaque> {
        let calls = self.calls.lock().unwrap().clone();
        match self.mode {
            Mode::Train if self.fail_train_pass == Some(calls.train_passes) => {
                anyhow::bail!("out of memory in training pass {}", calls.train_passes)
            }
            Mode::Eval if self.fail_eval_pass == Some(calls.eval_passes) => {
                anyhow::bail!("out of memory in evaluation pass {}", calls.eval_passes)
            }
            _ => {}
        }

        let wanted = match self.mode {
            Mode::Eval => {
                let pass = calls.eval_passes.saturating_sub(1);
                self.hits
                    .get(pass)
                    .or(self.hits.last())
                    .copied()
                    .unwrap_or(0)
            }
            Mode::Train => 0,
        };
        let flags: Vec<bool> = (0..clips.len())
            .map(|i| self.seen_in_pass + i < wanted)
            .collect();
        self.seen_in_pass += clips.len();
        Ok(Opaque::new(flags))
    }

    fn decode(&self, output: &Opaque, _conf_thresh: f32) -> anyhow::Result<Vec<Vec<Detection>>> {
        let flags = output
            .downcast_ref::<Vec<bool>>()
            .ok_or_else(|| anyhow::anyhow!("unexpected output type"))?;
        Ok(flags
            .iter()
            .map(|&hit| {
                if hit {
                    vec![Detection {
                        bbox: annotated_box(),
                        det_conf: 0.9,
                        class_id: 1,
                        class_conf: 0.9,
                    }]
                } else {
                    Vec::new()
                }
            })
            .collect())
    }

    fn backward(&mut self, _loss: &Loss) -> anyhow::Result<()> {
        self.steps += 1;
        Ok(())
    }

    fn state(&self) -> anyhow::Result<StateBlob> {
        Ok(StateBlob::new(format!("model-steps={}", self.steps)))
    }

    fn load_state(&mut self, state: &StateBlob) -> anyhow::Result<()> {
        self.calls.lock().unwrap().loaded_model_state = Some(state.as_bytes().to_vec());
        Ok(())
    }
}

struct FakeOptimizer {
    calls: Arc<Mutex<Calls>>,
    groups: Vec<ParameterGroup>,
    lrs: Vec<f64>,
}

impl Optimizer for FakeOptimizer {
    fn param_groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    fn set_group_lr(&mut self, index: usize, lr: f64) {
        if let Some(slot) = self.lrs.get_mut(index) {
            *slot = lr;
        }
        self.calls.lock().unwrap().group_lrs.push((index, lr));
    }

    fn group_lr(&self, index: usize) -> Option<f64> {
        self.lrs.get(index).copied()
    }

    fn zero_grad(&mut self, _model: &mut dyn DetectionModel) {}

    fn step(&mut self, _model: &mut dyn DetectionModel) -> anyhow::Result<()> {
        self.calls.lock().unwrap().optimizer_steps += 1;
        Ok(())
    }

    fn state(&self) -> anyhow::Result<StateBlob> {
        Ok(StateBlob::new(format!("{:?}", self.lrs)))
    }

    fn load_state(&mut self, state: &StateBlob) -> anyhow::Result<()> {
        self.calls.lock().unwrap().loaded_optimizer_state = Some(state.as_bytes().to_vec());
        Ok(())
    }
}

struct ConstantLoss;

impl LossModule for ConstantLoss {
    fn forward(
        &mut self,
        _output: &Opaque,
        _targets: &[Vec<GroundTruth>],
        _epoch: u32,
        _batch_index: usize,
    ) -> anyhow::Result<Loss> {
        Ok(Loss::scalar(1.0))
    }
}

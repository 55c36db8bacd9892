//! Placeholder backend used by the stand-alone binary.

use actiondet_core::{
    Backend, ClipDataset, Config, DatasetSpec, DetectionModel, Device, LossModule, Optimizer,
    OptimizerSettings, ParameterGroup,
};

const NOT_LINKED: &str = "this actiondet binary was built without a model backend; \
     embed actiondet-cli and call actiondet_cli::run with a Backend implementation";

/// Reports every construction request as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlinkedBackend;

impl Backend for UnlinkedBackend {
    fn name(&self) -> &str {
        "unlinked"
    }

    fn devices(&self) -> Vec<Device> {
        vec![Device::Cpu]
    }

    fn build_model(
        &self,
        _config: &Config,
        _devices: &[Device],
        _seed: u64,
    ) -> anyhow::Result<Box<dyn DetectionModel>> {
        anyhow::bail!(NOT_LINKED)
    }

    fn build_optimizer(
        &self,
        _groups: Vec<ParameterGroup>,
        _settings: OptimizerSettings,
    ) -> anyhow::Result<Box<dyn Optimizer>> {
        anyhow::bail!(NOT_LINKED)
    }

    fn build_region_loss(&self, _config: &Config) -> anyhow::Result<Box<dyn LossModule>> {
        anyhow::bail!(NOT_LINKED)
    }

    fn open_dataset(&self, _spec: &DatasetSpec) -> anyhow::Result<Box<dyn ClipDataset>> {
        anyhow::bail!(NOT_LINKED)
    }
}

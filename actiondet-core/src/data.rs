//! Clip samples, dataset specs and the batching loader.

use rand::Rng;
use rand::seq::SliceRandom;
use std::path::PathBuf;

use crate::backend::ClipDataset;
use crate::config::{Config, DatasetKind};
use crate::detection::GroundTruth;

/// Decoded clip, laid out channels x frames x height x width.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipTensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl ClipTensor {
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }
}

/// One clip with the annotations of its key frame.
#[derive(Debug, Clone)]
pub struct ClipSample {
    pub clip_id: String,
    pub clip: ClipTensor,
    pub targets: Vec<GroundTruth>,
}

/// A collated batch; index `i` of each vector belongs to the same clip.
#[derive(Debug, Clone, Default)]
pub struct ClipBatch {
    pub clip_ids: Vec<String>,
    pub clips: Vec<ClipTensor>,
    pub targets: Vec<Vec<GroundTruth>>,
}

impl ClipBatch {
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    fn push(&mut self, sample: ClipSample) {
        self.clip_ids.push(sample.clip_id);
        self.clips.push(sample.clip);
        self.targets.push(sample.targets);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// Everything a backend needs to open one split of a clip dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub dataset: DatasetKind,
    pub split: Split,
    pub base_path: PathBuf,
    pub list_file: PathBuf,
    pub crop_size: usize,
    pub num_frames: usize,
    pub sampling_rate: usize,
    pub num_workers: usize,
}

impl DatasetSpec {
    pub fn from_config(config: &Config, split: Split) -> Self {
        let list_file = match split {
            Split::Train => config.list_data.train_file.clone(),
            Split::Test => config.list_data.test_file.clone(),
        };
        Self {
            dataset: config.train.dataset,
            split,
            base_path: config.list_data.base_path.clone(),
            list_file,
            crop_size: config.data.train_crop_size,
            num_frames: config.data.num_frames,
            sampling_rate: config.data.sampling_rate,
            num_workers: config.data_loader.num_workers,
        }
    }
}

/// Batches a [`ClipDataset`].
///
/// Training loaders shuffle with the run RNG and drop a trailing partial
/// batch; evaluation loaders keep dataset order and every sample.
pub struct ClipLoader {
    dataset: Box<dyn ClipDataset>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl ClipLoader {
    pub fn new(
        dataset: Box<dyn ClipDataset>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
        }
    }

    pub fn for_training(dataset: Box<dyn ClipDataset>, batch_size: usize) -> Self {
        Self::new(dataset, batch_size, true, true)
    }

    pub fn for_evaluation(dataset: Box<dyn ClipDataset>, batch_size: usize) -> Self {
        Self::new(dataset, batch_size, false, false)
    }

    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Start a pass. The visiting order is fixed up front so the RNG is
    /// consumed once per pass regardless of how far the caller iterates.
    pub fn batches<R: Rng + ?Sized>(&self, rng: &mut R) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(rng);
        }
        let usable = self.num_batches() * self.batch_size;
        order.truncate(usable.min(order.len()));
        Batches {
            loader: self,
            order,
            cursor: 0,
        }
    }
}

/// Iterator over one pass of a [`ClipLoader`].
pub struct Batches<'a> {
    loader: &'a ClipLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = anyhow::Result<ClipBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let mut batch = ClipBatch::default();
        for &index in &self.order[self.cursor..end] {
            match self.loader.dataset.get(index) {
                Ok(sample) => batch.push(sample),
                Err(e) => {
                    self.cursor = self.order.len();
                    return Some(Err(e.context(format!("loading sample {index}"))));
                }
            }
        }
        self.cursor = end;
        Some(Ok(batch))
    }
}

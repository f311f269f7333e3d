use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use log::debug;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::{MlErr, Result};

/// The amount of columns of a label row: `[x1, y1, x2, y2, class, color]`.
pub const LABEL_COLS: usize = 6;

/// Where a sample came from and its size before any resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: u64,
    pub height: usize,
    pub width: usize,
}

/// A decoded image with its annotations.
#[derive(Debug, Clone)]
pub struct Sample {
    /// `(height, width, channels)` pixel values in `[0, 255]`.
    pub image: Array3<f32>,
    /// One `[x1, y1, x2, y2, class, color]` row per box, in pixels.
    pub labels: Array2<f32>,
    pub info: ImageInfo,
}

/// Random access to the samples of a split.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `(height, width)` the samples are meant to be fed at.
    fn input_dim(&self) -> (usize, usize);

    fn pull_item(&self, idx: usize) -> Result<Sample>;

    /// The info and labels of a sample, without needing its pixels.
    fn annotation(&self, idx: usize) -> Result<(ImageInfo, Array2<f32>)> {
        let sample = self.pull_item(idx)?;
        Ok((sample.info, sample.labels))
    }
}

/// A dataset whose samples are already decoded in memory.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    input_dim: (usize, usize),
}

impl InMemoryDataset {
    /// Creates a new `InMemoryDataset`.
    ///
    /// # Returns
    /// An error if there are no samples or any label matrix isn't `(n, 6)`.
    pub fn new(samples: Vec<Sample>, input_dim: (usize, usize)) -> Result<Self> {
        if samples.is_empty() {
            return Err(MlErr::EmptyDataset);
        }

        for sample in &samples {
            if sample.labels.ncols() != LABEL_COLS {
                return Err(MlErr::ShapeMismatch {
                    what: "labels",
                    got: sample.labels.shape().to_vec(),
                    expected: vec![sample.labels.nrows(), LABEL_COLS],
                });
            }
        }

        Ok(Self { samples, input_dim })
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn input_dim(&self) -> (usize, usize) {
        self.input_dim
    }

    fn pull_item(&self, idx: usize) -> Result<Sample> {
        self.samples
            .get(idx)
            .cloned()
            .ok_or(MlErr::IndexOutOfRange {
                idx,
                len: self.samples.len(),
            })
    }

    fn annotation(&self, idx: usize) -> Result<(ImageInfo, Array2<f32>)> {
        let sample = self.samples.get(idx).ok_or(MlErr::IndexOutOfRange {
            idx,
            len: self.samples.len(),
        })?;
        Ok((sample.info, sample.labels.clone()))
    }
}

/// The partition of the data a dataset is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    /// The conventional image folder of the split.
    pub fn folder(self) -> &'static str {
        match self {
            Split::Train => "train2017",
            Split::Val => "val2017",
            Split::Test => "test2017",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// Everything a provider needs to open a split.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRequest {
    pub data_dir: Option<PathBuf>,
    pub json_file: String,
    pub name: String,
    pub img_size: (usize, usize),
    pub split: Split,
    pub cache: bool,
}

/// Opens annotated datasets, the annotation format is up to the implementor.
pub trait DatasetProvider: Send + Sync {
    fn open(&self, request: &DatasetRequest) -> Result<Arc<dyn Dataset>>;
}

/// Serves splits registered up front, handy for tests and small runs.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    splits: HashMap<Split, Vec<Sample>>,
    opened: AtomicUsize,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_split(mut self, split: Split, samples: Vec<Sample>) -> Self {
        self.splits.insert(split, samples);
        self
    }

    /// How many times a split was opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl DatasetProvider for InMemoryProvider {
    fn open(&self, request: &DatasetRequest) -> Result<Arc<dyn Dataset>> {
        let samples = self.splits.get(&request.split).ok_or_else(|| {
            MlErr::Dataset(format!(
                "no {} split registered for {}",
                request.split, request.json_file
            ))
        })?;

        debug!(
            "opening in-memory {} split of {} (cache={})",
            request.split, request.json_file, request.cache
        );

        let dataset = InMemoryDataset::new(samples.clone(), request.img_size)?;
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(dataset))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::arr2;

    use super::*;

    pub(crate) fn sample(id: u64, h: usize, w: usize, labels: Array2<f32>) -> Sample {
        Sample {
            image: Array3::from_elem((h, w, 3), id as f32),
            labels,
            info: ImageInfo {
                id,
                height: h,
                width: w,
            },
        }
    }

    pub(crate) fn boxed(id: u64, h: usize, w: usize) -> Sample {
        let labels = arr2(&[[2.0, 2.0, w as f32 - 2.0, h as f32 - 2.0, 1.0, 2.0]]);
        sample(id, h, w, labels)
    }

    #[test]
    fn pull_item_checks_bounds() {
        let ds = InMemoryDataset::new(vec![boxed(7, 8, 8)], (8, 8)).unwrap();
        assert_eq!(ds.pull_item(0).unwrap().info.id, 7);
        assert!(matches!(
            ds.pull_item(1),
            Err(MlErr::IndexOutOfRange { idx: 1, len: 1 })
        ));
    }

    #[test]
    fn bad_labels_and_empty_sets_are_rejected() {
        assert!(matches!(
            InMemoryDataset::new(vec![], (8, 8)),
            Err(MlErr::EmptyDataset)
        ));

        let bad = sample(0, 4, 4, Array2::zeros((1, 5)));
        assert!(InMemoryDataset::new(vec![bad], (4, 4)).is_err());
    }

    #[test]
    fn provider_opens_registered_splits() {
        let provider = InMemoryProvider::new().with_split(Split::Train, vec![boxed(1, 8, 8)]);
        let request = DatasetRequest {
            data_dir: None,
            json_file: "instances_train2017.json".into(),
            name: Split::Train.folder().into(),
            img_size: (16, 32),
            split: Split::Train,
            cache: false,
        };

        let ds = provider.open(&request).unwrap();
        assert_eq!(ds.input_dim(), (16, 32));
        assert_eq!(provider.opened(), 1);

        let missing = DatasetRequest {
            split: Split::Val,
            ..request
        };
        assert!(provider.open(&missing).is_err());
    }
}

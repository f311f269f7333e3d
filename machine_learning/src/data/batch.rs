use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use ndarray::{Array3, Array4, Axis, stack};

use super::{dataset::ImageInfo, mosaic::TrainItem};
use crate::{MlErr, Result};

/// The indices of a batch and whether its samples may be mosaics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBatch {
    pub indices: Vec<usize>,
    pub mosaic: bool,
}

/// Groups sampler indices into batches, each tagged with the mosaic switch at the time
/// it was drawn.
#[derive(Debug)]
pub struct YoloBatchSampler<S> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
    mosaic: Arc<AtomicBool>,
}

impl<S: Iterator<Item = usize>> YoloBatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool, mosaic: Arc<AtomicBool>) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlErr::InvalidConfig("batch size must be positive".into()));
        }

        Ok(Self {
            sampler,
            batch_size,
            drop_last,
            mosaic,
        })
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<S: Iterator<Item = usize>> Iterator for YoloBatchSampler<S> {
    type Item = IndexBatch;

    fn next(&mut self) -> Option<IndexBatch> {
        let indices: Vec<_> = self.sampler.by_ref().take(self.batch_size).collect();

        if indices.is_empty() || (self.drop_last && indices.len() < self.batch_size) {
            return None;
        }

        Some(IndexBatch {
            indices,
            mosaic: self.mosaic.load(Ordering::Acquire),
        })
    }
}

/// Collated training samples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(n, c, h, w)`.
    pub images: Array4<f32>,
    /// `(n, max_labels, 6)` rows of `[class, color, cx, cy, w, h]`.
    pub targets: Array3<f32>,
    pub infos: Vec<ImageInfo>,
    pub indices: Vec<usize>,
    pub mosaic: bool,
}

impl Batch {
    #[inline]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

/// Stacks samples of equal shape into a `Batch`.
pub fn collate(items: Vec<TrainItem>, mosaic: bool) -> Result<Batch> {
    let first = items.first().ok_or(MlErr::EmptyDataset)?;
    let image_shape = first.image.shape().to_vec();
    let target_shape = first.targets.shape().to_vec();

    for item in &items {
        if item.image.shape() != image_shape.as_slice() {
            return Err(MlErr::ShapeMismatch {
                what: "batch image",
                got: item.image.shape().to_vec(),
                expected: image_shape,
            });
        }
        if item.targets.shape() != target_shape.as_slice() {
            return Err(MlErr::ShapeMismatch {
                what: "batch targets",
                got: item.targets.shape().to_vec(),
                expected: target_shape,
            });
        }
    }

    let images: Vec<_> = items.iter().map(|i| i.image.view()).collect();
    let targets: Vec<_> = items.iter().map(|i| i.targets.view()).collect();

    let images = stack(Axis(0), &images).map_err(|_| MlErr::ShapeMismatch {
        what: "batch image",
        got: vec![items.len()],
        expected: image_shape.clone(),
    })?;
    let targets = stack(Axis(0), &targets).map_err(|_| MlErr::ShapeMismatch {
        what: "batch targets",
        got: vec![items.len()],
        expected: target_shape.clone(),
    })?;

    Ok(Batch {
        images,
        targets,
        infos: items.iter().map(|i| i.info).collect(),
        indices: items.iter().map(|i| i.idx).collect(),
        mosaic,
    })
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn item(idx: usize, h: usize) -> TrainItem {
        TrainItem {
            image: Array3::zeros((3, h, 4)),
            targets: Array2::zeros((5, 6)),
            info: ImageInfo {
                id: idx as u64,
                height: h,
                width: 4,
            },
            idx,
        }
    }

    #[test]
    fn batches_follow_the_mosaic_switch() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut batches = YoloBatchSampler::new(0..5, 2, false, Arc::clone(&flag)).unwrap();

        assert_eq!(
            batches.next(),
            Some(IndexBatch {
                indices: vec![0, 1],
                mosaic: true
            })
        );

        flag.store(false, Ordering::Release);
        assert!(!batches.next().unwrap().mosaic);
        assert_eq!(batches.next().unwrap().indices, vec![4]);
        assert_eq!(batches.next(), None);
    }

    #[test]
    fn drop_last_skips_the_remainder() {
        let flag = Arc::new(AtomicBool::new(false));
        let batches = YoloBatchSampler::new(0..5, 2, true, flag).unwrap();
        assert_eq!(batches.count(), 2);
    }

    #[test]
    fn collate_stacks_along_the_batch_axis() {
        let batch = collate(vec![item(3, 8), item(1, 8)], true).unwrap();

        assert_eq!(batch.images.dim(), (2, 3, 8, 4));
        assert_eq!(batch.targets.dim(), (2, 5, 6));
        assert_eq!(batch.indices, vec![3, 1]);
        assert!(batch.mosaic);
    }

    #[test]
    fn collate_rejects_ragged_images() {
        assert!(matches!(
            collate(vec![item(0, 8), item(1, 16)], false),
            Err(MlErr::ShapeMismatch { .. })
        ));
        assert!(collate(Vec::new(), false).is_err());
    }
}

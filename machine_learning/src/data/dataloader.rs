use std::sync::Arc;

use log::debug;
use ndarray::{Array4, Axis, stack};
use rand::{SeedableRng, rngs::StdRng};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{
    batch::{Batch, YoloBatchSampler, collate},
    dataset::{Dataset, ImageInfo},
    mosaic::MosaicDetection,
    sampler::InfiniteSampler,
    transform::ValTransform,
};
use crate::{MlErr, Result};

fn worker_pool(num_workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(num_workers.max(1))
        .thread_name(|i| format!("data-worker-{i}"))
        .build()
        .map_err(|e| MlErr::InvalidConfig(format!("cannot start data workers: {e}")))
}

/// Mixes the loader seed with a sample's position in the stream.
#[inline]
fn sample_seed(seed: u64, position: u64, idx: usize) -> u64 {
    let mut z = seed
        .wrapping_add(position.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add(idx as u64);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Endless training batches, fetched in parallel.
pub struct DataLoader {
    dataset: Arc<MosaicDetection>,
    batches: YoloBatchSampler<InfiniteSampler>,
    pool: ThreadPool,
    seed: u64,
    drawn: u64,
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The mosaic wrapped training set.
    /// * `sampler` - The index stream of this rank.
    /// * `batch_size` - The amount of samples per batch on this rank.
    /// * `num_workers` - The amount of threads fetching samples.
    /// * `seed` - The base of every per-sample random source.
    pub fn new(
        dataset: Arc<MosaicDetection>,
        sampler: InfiniteSampler,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        let batches = YoloBatchSampler::new(sampler, batch_size, false, dataset.mosaic_flag())?;
        let pool = worker_pool(num_workers)?;

        debug!("data loader ready: batch_size={batch_size} workers={}", pool.current_num_threads());

        Ok(Self {
            dataset,
            batches,
            pool,
            seed,
            drawn: 0,
        })
    }

    #[inline]
    pub fn dataset(&self) -> &Arc<MosaicDetection> {
        &self.dataset
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batches.batch_size()
    }

    pub fn close_mosaic(&self) {
        self.dataset.close_mosaic();
    }

    /// Fetches and collates the next batch.
    pub fn next_batch(&mut self) -> Result<Batch> {
        let batch = self.batches.next().ok_or(MlErr::EmptyDataset)?;
        let base = self.drawn;
        self.drawn += batch.indices.len() as u64;

        let dataset = &self.dataset;
        let seed = self.seed;
        let mosaic = batch.mosaic;

        let items = self.pool.install(|| {
            batch
                .indices
                .par_iter()
                .enumerate()
                .map(|(pos, &idx)| {
                    let mut rng = StdRng::seed_from_u64(sample_seed(seed, base + pos as u64, idx));
                    dataset.get_item(idx, mosaic, &mut rng)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        collate(items, mosaic)
    }
}

impl Iterator for DataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Letterboxed evaluation images.
#[derive(Debug, Clone)]
pub struct EvalBatch {
    /// `(n, c, h, w)`.
    pub images: Array4<f32>,
    pub infos: Vec<ImageInfo>,
    /// The dataset index of every image.
    pub indices: Vec<usize>,
}

/// A finite pass over an evaluation split.
pub struct EvalLoader {
    dataset: Arc<dyn Dataset>,
    transform: ValTransform,
    indices: Vec<usize>,
    batch_size: usize,
    pool: ThreadPool,
}

impl EvalLoader {
    /// Creates a new `EvalLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The evaluation split.
    /// * `transform` - The letterboxing pipeline.
    /// * `indices` - The samples this rank evaluates, in order.
    /// * `batch_size` - The amount of images per batch.
    /// * `num_workers` - The amount of threads fetching samples.
    pub fn new(
        dataset: Arc<dyn Dataset>,
        transform: ValTransform,
        indices: Vec<usize>,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(MlErr::InvalidConfig("batch size must be positive".into()));
        }

        Ok(Self {
            dataset,
            transform,
            indices,
            batch_size,
            pool: worker_pool(num_workers)?,
        })
    }

    #[inline]
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// The amount of images this rank evaluates.
    #[inline]
    pub fn num_images(&self) -> usize {
        self.indices.len()
    }

    /// The amount of batches in a pass.
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Iterates over the batches of a full pass.
    pub fn batches(&self) -> impl Iterator<Item = Result<EvalBatch>> + '_ {
        self.indices
            .chunks(self.batch_size)
            .map(|chunk| self.load(chunk))
    }

    fn load(&self, chunk: &[usize]) -> Result<EvalBatch> {
        let input_dim = self.dataset.input_dim();
        let loaded = self.pool.install(|| {
            chunk
                .par_iter()
                .map(|&idx| {
                    let sample = self.dataset.pull_item(idx)?;
                    Ok((self.transform.apply(&sample.image, input_dim), sample.info))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let views: Vec<_> = loaded.iter().map(|(image, _)| image.view()).collect();
        let images = stack(Axis(0), &views).map_err(|_| MlErr::ShapeMismatch {
            what: "eval batch",
            got: vec![loaded.len()],
            expected: vec![chunk.len()],
        })?;

        Ok(EvalBatch {
            images,
            infos: loaded.into_iter().map(|(_, info)| info).collect(),
            indices: chunk.to_vec(),
        })
    }
}

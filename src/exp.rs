use std::{path::PathBuf, sync::Arc};

use comms::{Communicator, wait_for_the_master};
use log::{debug, info};
use machine_learning::{
    data::{
        AffineParams, DataLoader, Dataset, DatasetProvider, DatasetRequest, DistributedSampler,
        EvalLoader, ImageOps, InfiniteSampler, MosaicConfig, MosaicDetection, NoopImageOps,
        SequentialSampler, Split, TrainTransform, ValTransform, resize::interpolate_bilinear,
    },
    eval::{CocoEvaluator, Detector, EvalResult},
    model::{ModelEma, Yolox, YoloxConfig},
    optimization::{ParamGroupOptions, Sgd, SgdConfig, partition_params},
    schedule::{LrOptions, LrScheduler},
};
use ndarray::{Array3, Array4, Axis, s};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{ExpConfig, ExpErr, Result};

/// Boxes kept per training sample once mosaics pile four images together.
const MAX_LABELS: usize = 120;

/// The stride every multiscale size is a multiple of.
const SIZE_STRIDE: usize = 32;

/// The state of a training run: its configuration plus the handles built from it.
///
/// The model, the optimizer and the training set are built on first request and reused
/// afterwards.
pub struct Exp {
    config: ExpConfig,
    provider: Arc<dyn DatasetProvider>,
    image_ops: Arc<dyn ImageOps>,
    rng: StdRng,
    model: Option<Yolox>,
    optimizer: Option<Sgd>,
    dataset: Option<Arc<MosaicDetection>>,
    random_size: Option<(usize, usize)>,
}

impl Exp {
    /// Creates a new `Exp`.
    ///
    /// # Arguments
    /// * `config` - The hyperparameters of the run.
    /// * `provider` - Where the train, val and test splits come from.
    ///
    /// # Returns
    /// A new run context or an error if `config` is invalid.
    pub fn new(config: ExpConfig, provider: Arc<dyn DatasetProvider>) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            config,
            provider,
            image_ops: Arc::new(NoopImageOps),
            rng,
            model: None,
            optimizer: None,
            dataset: None,
            random_size: None,
        })
    }

    /// Replaces the augmentation kernels used by the training set.
    pub fn with_image_ops(mut self, image_ops: Arc<dyn ImageOps>) -> Self {
        self.image_ops = image_ops;
        self
    }

    #[inline]
    pub fn config(&self) -> &ExpConfig {
        &self.config
    }

    /// The model built so far, if any, as it currently stands.
    #[inline]
    pub fn model(&self) -> Option<&Yolox> {
        self.model.as_ref()
    }

    /// Applies `key value` overrides and drops every handle built from the old values.
    pub fn merge<S: AsRef<str>>(&mut self, opts: &[S]) -> Result<()> {
        let mut config = self.config.clone();
        config.merge(opts)?;
        config.validate()?;

        self.config = config;
        self.model = None;
        self.optimizer = None;
        self.dataset = None;
        self.random_size = None;
        Ok(())
    }

    /// The directory this experiment writes to.
    pub fn output_dir(&self) -> PathBuf {
        self.config.output_dir.join(&self.config.exp_name)
    }

    /// The learning rate for a given total batch size.
    #[inline]
    pub fn basic_lr(&self, batch_size: usize) -> f32 {
        self.config.basic_lr_per_img * batch_size as f32
    }

    fn build_model(&self) -> Result<Yolox> {
        let config = YoloxConfig {
            num_classes: self.config.num_classes,
            num_colors: self.config.num_colors,
            depth: self.config.depth,
            width: self.config.width,
            act: self.config.act,
            ..Default::default()
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed.unwrap_or(0));
        let model = Yolox::new(&config, &mut rng)?;
        info!(
            "built model: depth={} width={} params={}",
            config.depth,
            config.width,
            model.params().numel()
        );
        Ok(model)
    }

    /// Returns the model, building it on the first call.
    ///
    /// Every call resets the batch norm settings and the prediction biases.
    pub fn get_model(&mut self) -> Result<&mut Yolox> {
        let model = match self.model.take() {
            Some(model) => model,
            None => self.build_model()?,
        };

        let model = self.model.insert(model);
        model.init_norms(1e-3, 0.03);
        model.initialize_biases(1e-2)?;
        Ok(model)
    }

    fn dataset_request(
        &self,
        split: Split,
        json_file: &str,
        img_size: (usize, usize),
        cache: bool,
    ) -> DatasetRequest {
        DatasetRequest {
            data_dir: self.config.data_dir.clone(),
            json_file: json_file.to_string(),
            name: split.folder().to_string(),
            img_size,
            split,
            cache,
        }
    }

    fn build_train_set(&self, base: Arc<dyn Dataset>, mosaic: bool) -> MosaicDetection {
        let c = &self.config;
        let transform = TrainTransform {
            max_labels: MAX_LABELS,
            flip_prob: c.flip_prob,
            hsv_prob: c.hsv_prob,
            gaussian_prob: c.gaussian_prob,
        };
        let config = MosaicConfig {
            mosaic_prob: c.mosaic_prob,
            enable_mixup: c.enable_mixup,
            mixup_prob: c.mixup_prob,
            mixup_scale: c.mixup_scale,
            affine: AffineParams {
                degrees: c.degrees,
                translate: c.translate,
                scales: c.mosaic_scale,
                shear: c.shear,
                perspective: c.perspective,
            },
        };

        MosaicDetection::new(base, transform, Arc::clone(&self.image_ops), config, mosaic)
    }

    /// Returns the training loader of this rank.
    ///
    /// The training set is opened once, by the local master first, and reused by later
    /// calls with mosaic switched according to `no_aug`.
    ///
    /// # Arguments
    /// * `comm` - The distributed context.
    /// * `batch_size` - The total batch size, split across ranks when distributed.
    /// * `is_distributed` - Whether the batch is shared among ranks.
    /// * `no_aug` - Disables mosaic.
    /// * `cache_img` - Asks the provider to cache decoded images.
    pub async fn get_data_loader<C: Communicator>(
        &mut self,
        comm: &C,
        batch_size: usize,
        is_distributed: bool,
        no_aug: bool,
        cache_img: bool,
    ) -> Result<DataLoader> {
        let (rank, world_size) = if is_distributed {
            (comm.rank(), comm.world_size())
        } else {
            (0, 1)
        };

        let per_rank = batch_size / world_size;
        if per_rank == 0 {
            return Err(ExpErr::InvalidConfig(format!(
                "batch size {batch_size} is smaller than the world size {world_size}"
            )));
        }

        let dataset = match self.dataset.clone() {
            Some(dataset) => {
                dataset.set_mosaic(!no_aug);
                dataset
            }
            None => {
                let request = self.dataset_request(
                    Split::Train,
                    &self.config.train_ann,
                    self.config.input_size,
                    cache_img,
                );
                let provider = Arc::clone(&self.provider);
                let base = wait_for_the_master(comm, || provider.open(&request)).await?;

                let dataset = Arc::new(self.build_train_set(base, !no_aug));
                self.dataset = Some(Arc::clone(&dataset));
                dataset
            }
        };

        let seed = self.config.seed.unwrap_or(0);
        let sampler = InfiniteSampler::new(dataset.len(), true, seed, rank, world_size)?;
        debug!("train loader: {} images, {per_rank} per batch on rank {rank}", dataset.len());

        Ok(DataLoader::new(
            dataset,
            sampler,
            per_rank,
            self.config.data_num_workers,
            seed.wrapping_add(rank as u64),
        )?)
    }

    /// Switches mosaic off on the cached training set, if any.
    pub fn close_mosaic(&self) {
        if let Some(dataset) = &self.dataset {
            dataset.close_mosaic();
        }
    }

    /// The multiscale range in multiples of 32, computed once.
    fn random_size_range(&mut self) -> (usize, usize) {
        *self.random_size.get_or_insert_with(|| {
            self.config.random_size.unwrap_or_else(|| {
                let base = self.config.input_size.0 / SIZE_STRIDE;
                let range = self.config.multiscale_range;
                let lo = base.saturating_sub(range).max(1);
                (lo, (base + range).max(lo))
            })
        })
    }

    /// Draws the input size of the next stretch of training.
    ///
    /// Rank 0 draws the size and, when distributed, broadcasts it so that every rank
    /// returns the same `(height, width)`.
    pub async fn random_resize<C: Communicator>(
        &mut self,
        comm: &C,
        epoch: usize,
        is_distributed: bool,
    ) -> Result<(usize, usize)> {
        let mut size = [0i64; 2];

        if !is_distributed || comm.rank() == 0 {
            let (lo, hi) = self.random_size_range();
            let (h, w) = self.config.input_size;
            let factor = w as f32 / h as f32;

            let picked = self.rng.random_range(lo..=hi);
            size = [
                (SIZE_STRIDE * picked) as i64,
                (SIZE_STRIDE * (picked as f32 * factor) as usize) as i64,
            ];
        }

        if is_distributed {
            comm.barrier().await;
            comm.broadcast(&mut size, 0).await?;
        }

        debug!("epoch {epoch}: training at {}x{}", size[0], size[1]);
        Ok((size[0] as usize, size[1] as usize))
    }

    /// Resizes a batch to `tsize` and scales its targets along.
    ///
    /// # Arguments
    /// * `inputs` - An `(n, c, h, w)` batch at `input_size`.
    /// * `targets` - `(n, max_labels, k)` rows of `[class, color, cx, cy, w, h]`, the
    ///   columns from the third on alternate between x and y.
    /// * `tsize` - The `(height, width)` to train at.
    pub fn preprocess(
        &self,
        inputs: Array4<f32>,
        mut targets: Array3<f32>,
        tsize: (usize, usize),
    ) -> (Array4<f32>, Array3<f32>) {
        let (h, w) = self.config.input_size;
        let scale_y = tsize.0 as f32 / h as f32;
        let scale_x = tsize.1 as f32 / w as f32;

        if scale_x == 1.0 && scale_y == 1.0 {
            return (inputs, targets);
        }

        let inputs = interpolate_bilinear(inputs.view(), tsize);
        let cols = targets.len_of(Axis(2));
        for col in (2..cols).step_by(2) {
            targets.slice_mut(s![.., .., col]).mapv_inplace(|v| v * scale_x);
        }
        for col in (3..cols).step_by(2) {
            targets.slice_mut(s![.., .., col]).mapv_inplace(|v| v * scale_y);
        }

        (inputs, targets)
    }

    fn build_optimizer(&mut self, batch_size: usize) -> Result<Sgd> {
        let lr = if self.config.warmup_epochs > 0 {
            self.config.warmup_lr
        } else {
            self.basic_lr(batch_size)
        };
        let (momentum, weight_decay) = (self.config.momentum, self.config.weight_decay);

        if self.model.is_none() {
            self.model = Some(self.build_model()?);
        }
        let store = self
            .model
            .as_ref()
            .map(Yolox::params)
            .ok_or_else(|| ExpErr::InvalidConfig("the model could not be built".into()))?;

        let groups = partition_params(store);
        info!(
            "optimizer groups: {} norm, {} decay, {} bias",
            groups.norm.len(),
            groups.decay.len(),
            groups.bias.len()
        );

        let defaults = SgdConfig {
            lr,
            momentum,
            nesterov: true,
            weight_decay: 0.0,
        };
        let mut sgd = Sgd::new(store, groups.norm, defaults)?;
        sgd.add_param_group(store, groups.decay, ParamGroupOptions::weight_decay(weight_decay))?;
        sgd.add_param_group(store, groups.bias, ParamGroupOptions::default())?;
        Ok(sgd)
    }

    /// Returns the optimizer, building it (and the model if needed) on the first call.
    ///
    /// Normalization scales, other weights and biases get their own groups, only the
    /// second one decays.
    pub fn get_optimizer(&mut self, batch_size: usize) -> Result<&mut Sgd> {
        let sgd = match self.optimizer.take() {
            Some(sgd) => sgd,
            None => self.build_optimizer(batch_size)?,
        };
        Ok(self.optimizer.insert(sgd))
    }

    pub fn get_lr_scheduler(&self, lr: f32, iters_per_epoch: usize) -> Result<LrScheduler> {
        let c = &self.config;
        let options = LrOptions {
            warmup_epochs: c.warmup_epochs,
            warmup_lr_start: c.warmup_lr,
            no_aug_epochs: c.no_aug_epochs,
            min_lr_ratio: c.min_lr_ratio,
            milestones: c.milestones.clone(),
            ..Default::default()
        };

        Ok(LrScheduler::new(
            c.scheduler.parse()?,
            lr,
            iters_per_epoch,
            c.max_epoch,
            options,
        )?)
    }

    /// Builds the loader over the val split, or the test-dev split when `testdev`.
    pub fn get_eval_loader<C: Communicator>(
        &self,
        comm: &C,
        batch_size: usize,
        is_distributed: bool,
        testdev: bool,
        legacy: bool,
    ) -> Result<EvalLoader> {
        let (split, json_file) = if testdev {
            (Split::Test, &self.config.test_ann)
        } else {
            (Split::Val, &self.config.val_ann)
        };

        let request = self.dataset_request(split, json_file, self.config.test_size, false);
        let dataset = self.provider.open(&request)?;

        let (indices, batch_size) = if is_distributed {
            let world_size = comm.world_size();
            let sampler = DistributedSampler::new(dataset.len(), comm.rank(), world_size)?;
            (sampler.indices(), (batch_size / world_size).max(1))
        } else {
            (SequentialSampler::new(dataset.len()).indices(), batch_size)
        };

        Ok(EvalLoader::new(
            dataset,
            ValTransform { legacy },
            indices,
            batch_size,
            self.config.data_num_workers,
        )?)
    }

    pub fn get_evaluator<C: Communicator>(
        &self,
        comm: &C,
        batch_size: usize,
        is_distributed: bool,
        testdev: bool,
        legacy: bool,
    ) -> Result<CocoEvaluator> {
        let loader = self.get_eval_loader(comm, batch_size, is_distributed, testdev, legacy)?;
        Ok(CocoEvaluator::new(
            loader,
            self.config.test_size,
            self.config.test_conf,
            self.config.nmsthre,
            self.config.num_classes,
            self.config.num_colors,
            testdev,
        ))
    }

    /// Evaluates `model`. With a test-dev evaluator, rank 0 also writes the detections
    /// to the output directory.
    pub async fn eval<D, C>(
        &self,
        model: &D,
        evaluator: &CocoEvaluator,
        comm: &C,
        is_distributed: bool,
        half: bool,
    ) -> Result<EvalResult>
    where
        D: Detector + ?Sized,
        C: Communicator,
    {
        let result = evaluator.evaluate(model, comm, is_distributed, half).await?;

        if evaluator.is_testdev() && comm.rank() == 0 {
            let dir = self.output_dir();
            tokio::fs::create_dir_all(&dir).await?;
            let path = dir.join("yolox_testdev_2017.json");
            tokio::fs::write(&path, result.detections_json()?).await?;
            info!("test-dev detections written to {}", path.display());
        }

        Ok(result)
    }

    /// Returns an exponential moving average of the model when the config asks for one.
    ///
    /// A model that already exists is tracked as is, without resetting its biases.
    pub fn get_ema(&mut self) -> Result<Option<ModelEma>> {
        if !self.config.ema {
            return Ok(None);
        }

        if self.model.is_none() {
            self.get_model()?;
        }
        let store = self
            .model
            .as_ref()
            .map(Yolox::params)
            .ok_or_else(|| ExpErr::InvalidConfig("the model could not be built".into()))?;

        Ok(Some(ModelEma::new(store, ModelEma::DEFAULT_DECAY, 0)))
    }
}

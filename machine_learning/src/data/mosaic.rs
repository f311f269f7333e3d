use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use log::info;
use ndarray::{Array2, Array3, Axis, concatenate, s};
use rand::{Rng, RngCore};

use super::{
    dataset::{Dataset, ImageInfo, LABEL_COLS},
    resize::resize_hwc,
    transform::{AffineParams, ImageOps, PAD_VALUE, TrainTransform},
};
use crate::{MlErr, Result};

/// The augmentation settings of a `MosaicDetection`.
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicConfig {
    pub mosaic_prob: f32,
    pub enable_mixup: bool,
    pub mixup_prob: f32,
    pub mixup_scale: (f32, f32),
    pub affine: AffineParams,
}

/// A training sample ready to be collated.
#[derive(Debug, Clone)]
pub struct TrainItem {
    /// `(c, h, w)`.
    pub image: Array3<f32>,
    /// `(max_labels, 6)` rows of `[class, color, cx, cy, w, h]`.
    pub targets: Array2<f32>,
    pub info: ImageInfo,
    pub idx: usize,
}

/// Wraps a dataset and stitches four samples together before the train transform.
pub struct MosaicDetection {
    dataset: Arc<dyn Dataset>,
    transform: TrainTransform,
    ops: Arc<dyn ImageOps>,
    config: MosaicConfig,
    mosaic: Arc<AtomicBool>,
}

impl MosaicDetection {
    /// Creates a new `MosaicDetection`.
    ///
    /// # Arguments
    /// * `dataset` - The samples to draw from.
    /// * `transform` - The pipeline run on every produced sample.
    /// * `ops` - The pixel kernels used for augmentation.
    /// * `config` - Mosaic and mixup settings.
    /// * `mosaic` - Whether mosaic starts enabled.
    pub fn new(
        dataset: Arc<dyn Dataset>,
        transform: TrainTransform,
        ops: Arc<dyn ImageOps>,
        config: MosaicConfig,
        mosaic: bool,
    ) -> Self {
        Self {
            dataset,
            transform,
            ops,
            config,
            mosaic: Arc::new(AtomicBool::new(mosaic)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    #[inline]
    pub fn input_dim(&self) -> (usize, usize) {
        self.dataset.input_dim()
    }

    #[inline]
    pub fn is_mosaic(&self) -> bool {
        self.mosaic.load(Ordering::Acquire)
    }

    pub fn set_mosaic(&self, enabled: bool) {
        self.mosaic.store(enabled, Ordering::Release);
    }

    /// Turns mosaic off for the rest of the run, usually for the last epochs.
    pub fn close_mosaic(&self) {
        info!("closing mosaic augmentation");
        self.set_mosaic(false);
    }

    /// The switch shared with batch samplers so they can tag batches.
    pub(crate) fn mosaic_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.mosaic)
    }

    /// Produces the `idx`-th training sample.
    ///
    /// # Arguments
    /// * `idx` - The index of the anchor sample.
    /// * `mosaic` - Whether this sample may be a mosaic.
    /// * `rng` - The sample's random source.
    pub fn get_item(&self, idx: usize, mosaic: bool, rng: &mut dyn RngCore) -> Result<TrainItem> {
        let input_dim = self.input_dim();

        if !mosaic || rng.random::<f32>() >= self.config.mosaic_prob {
            let sample = self.dataset.pull_item(idx)?;
            let (image, targets) =
                self.transform
                    .apply(sample.image, sample.labels, input_dim, &*self.ops, rng);

            return Ok(TrainItem {
                image,
                targets,
                info: sample.info,
                idx,
            });
        }

        let (canvas, labels, info) = self.compose(idx, rng)?;
        let (mut image, mut labels) = self.ops.random_affine(
            canvas,
            labels,
            input_dim,
            &self.config.affine,
            rng,
        );

        if self.config.enable_mixup
            && labels.nrows() > 0
            && rng.random::<f32>() < self.config.mixup_prob
        {
            (image, labels) = self.mixup(image, labels, rng)?;
        }

        let (image, targets) = self
            .transform
            .apply(image, labels, input_dim, &*self.ops, rng);

        Ok(TrainItem {
            image,
            targets,
            info,
            idx,
        })
    }

    /// Lays `idx` and three random samples on a `2h x 2w` canvas around a random center.
    fn compose(
        &self,
        idx: usize,
        rng: &mut dyn RngCore,
    ) -> Result<(Array3<f32>, Array2<f32>, ImageInfo)> {
        let (ih, iw) = self.input_dim();
        let len = self.len();
        if len == 0 {
            return Err(MlErr::EmptyDataset);
        }

        let yc = rng.random_range(0.5 * ih as f32..=1.5 * ih as f32) as usize;
        let xc = rng.random_range(0.5 * iw as f32..=1.5 * iw as f32) as usize;

        let mut indices = vec![idx];
        indices.extend((0..3).map(|_| rng.random_range(0..len)));

        let mut canvas: Option<Array3<f32>> = None;
        let mut all_labels = Vec::with_capacity(4);
        let mut anchor_info = None;

        for (quadrant, &index) in indices.iter().enumerate() {
            let sample = self.dataset.pull_item(index)?;
            let (h0, w0, c) = sample.image.dim();
            let scale = (ih as f32 / h0 as f32).min(iw as f32 / w0 as f32);
            let h = ((h0 as f32 * scale) as usize).max(1);
            let w = ((w0 as f32 * scale) as usize).max(1);
            let image = resize_hwc(sample.image.view(), h, w);

            let canvas =
                canvas.get_or_insert_with(|| Array3::from_elem((2 * ih, 2 * iw, c), PAD_VALUE));

            let (large, small) = mosaic_coordinates(quadrant, (xc, yc), (w, h), (ih, iw));
            canvas
                .slice_mut(s![large[1]..large[3], large[0]..large[2], ..])
                .assign(&image.slice(s![small[1]..small[3], small[0]..small[2], ..]));

            let pad_w = large[0] as f32 - small[0] as f32;
            let pad_h = large[1] as f32 - small[1] as f32;

            let mut labels = sample.labels;
            for mut row in labels.rows_mut() {
                row[0] = scale * row[0] + pad_w;
                row[1] = scale * row[1] + pad_h;
                row[2] = scale * row[2] + pad_w;
                row[3] = scale * row[3] + pad_h;
            }
            all_labels.push(labels);

            anchor_info.get_or_insert(sample.info);
        }

        let views: Vec<_> = all_labels.iter().map(|l| l.view()).collect();
        let mut labels = concatenate(Axis(0), &views).map_err(|_| MlErr::ShapeMismatch {
            what: "mosaic labels",
            got: all_labels.iter().map(|l| l.ncols()).collect(),
            expected: vec![LABEL_COLS],
        })?;

        for mut row in labels.rows_mut() {
            row[0] = row[0].clamp(0.0, 2.0 * iw as f32);
            row[2] = row[2].clamp(0.0, 2.0 * iw as f32);
            row[1] = row[1].clamp(0.0, 2.0 * ih as f32);
            row[3] = row[3].clamp(0.0, 2.0 * ih as f32);
        }

        let canvas = canvas.ok_or(MlErr::EmptyDataset)?;
        let info = anchor_info.ok_or(MlErr::EmptyDataset)?;
        Ok((canvas, labels, info))
    }

    /// Blends a random labelled sample into `image` and appends its surviving boxes.
    fn mixup(
        &self,
        image: Array3<f32>,
        labels: Array2<f32>,
        rng: &mut dyn RngCore,
    ) -> Result<(Array3<f32>, Array2<f32>)> {
        let (ih, iw) = self.input_dim();
        let (lo, hi) = self.config.mixup_scale;
        let jit = rng.random_range(lo..=hi);
        let flip = rng.random::<f32>() > 0.5;

        // Bounded so a split without any box can't spin forever.
        let mut donor = None;
        for _ in 0..self.len() {
            let sample = self.dataset.pull_item(rng.random_range(0..self.len()))?;
            if sample.labels.nrows() > 0 {
                donor = Some(sample);
                break;
            }
        }
        let Some(donor) = donor else {
            return Ok((image, labels));
        };

        let (h0, w0, c) = donor.image.dim();
        let mut ratio = (ih as f32 / h0 as f32).min(iw as f32 / w0 as f32);
        let rh = ((h0 as f32 * ratio) as usize).clamp(1, ih);
        let rw = ((w0 as f32 * ratio) as usize).clamp(1, iw);

        let mut cp = Array3::from_elem((ih, iw, c), PAD_VALUE);
        cp.slice_mut(s![..rh, ..rw, ..])
            .assign(&resize_hwc(donor.image.view(), rh, rw));

        let oh = ((ih as f32 * jit) as usize).max(1);
        let ow = ((iw as f32 * jit) as usize).max(1);
        let mut cp = resize_hwc(cp.view(), oh, ow);
        ratio *= jit;

        if flip {
            cp.invert_axis(Axis(1));
        }

        let (th, tw, _) = image.dim();
        let mut padded = Array3::zeros((oh.max(th), ow.max(tw), c));
        padded.slice_mut(s![..oh, ..ow, ..]).assign(&cp);

        let y_off = if padded.dim().0 > th {
            rng.random_range(0..padded.dim().0 - th)
        } else {
            0
        };
        let x_off = if padded.dim().1 > tw {
            rng.random_range(0..padded.dim().1 - tw)
        } else {
            0
        };
        let cropped = padded.slice(s![y_off..y_off + th, x_off..x_off + tw, ..]);

        let mut kept = Vec::new();
        for row in donor.labels.rows() {
            let mut origin = [row[0], row[1], row[2], row[3]].map(|v| v * ratio);
            origin[0] = origin[0].clamp(0.0, ow as f32);
            origin[2] = origin[2].clamp(0.0, ow as f32);
            origin[1] = origin[1].clamp(0.0, oh as f32);
            origin[3] = origin[3].clamp(0.0, oh as f32);

            if flip {
                let (x1, x2) = (origin[0], origin[2]);
                origin[0] = ow as f32 - x2;
                origin[2] = ow as f32 - x1;
            }

            let moved = [
                (origin[0] - x_off as f32).clamp(0.0, tw as f32),
                (origin[1] - y_off as f32).clamp(0.0, th as f32),
                (origin[2] - x_off as f32).clamp(0.0, tw as f32),
                (origin[3] - y_off as f32).clamp(0.0, th as f32),
            ];

            if box_candidate(origin, moved, 5.0) {
                kept.push([moved[0], moved[1], moved[2], moved[3], row[4], row[5]]);
            }
        }

        if kept.is_empty() {
            return Ok((image, labels));
        }

        let blended = image * 0.5 + &cropped * 0.5;

        let mut extra = Array2::zeros((kept.len(), LABEL_COLS));
        for (mut dst, src) in extra.rows_mut().into_iter().zip(&kept) {
            dst.assign(&ndarray::aview1(src));
        }
        let labels = concatenate(Axis(0), &[labels.view(), extra.view()]).map_err(|_| {
            MlErr::ShapeMismatch {
                what: "mixup labels",
                got: labels.shape().to_vec(),
                expected: vec![labels.nrows(), LABEL_COLS],
            }
        })?;

        Ok((blended, labels))
    }
}

/// Where a quadrant's image lands on the canvas and which part of it is kept, both as
/// `(x1, y1, x2, y2)`.
fn mosaic_coordinates(
    quadrant: usize,
    (xc, yc): (usize, usize),
    (w, h): (usize, usize),
    (ih, iw): (usize, usize),
) -> ([usize; 4], [usize; 4]) {
    match quadrant {
        0 => {
            let large = [xc.saturating_sub(w), yc.saturating_sub(h), xc, yc];
            let small = [w - (large[2] - large[0]), h - (large[3] - large[1]), w, h];
            (large, small)
        }
        1 => {
            let large = [xc, yc.saturating_sub(h), (xc + w).min(2 * iw), yc];
            let small = [0, h - (large[3] - large[1]), w.min(large[2] - large[0]), h];
            (large, small)
        }
        2 => {
            let large = [xc.saturating_sub(w), yc, xc, (yc + h).min(2 * ih)];
            let small = [w - (large[2] - large[0]), 0, w, h.min(large[3] - large[1])];
            (large, small)
        }
        _ => {
            let large = [xc, yc, (xc + w).min(2 * iw), (yc + h).min(2 * ih)];
            let small = [0, 0, w.min(large[2] - large[0]), h.min(large[3] - large[1])];
            (large, small)
        }
    }
}

/// Whether a box kept enough of its size and shape after being moved.
fn box_candidate(before: [f32; 4], after: [f32; 4], wh_thr: f32) -> bool {
    const AR_THR: f32 = 20.0;
    const AREA_THR: f32 = 0.2;
    const EPS: f32 = 1e-16;

    let (w1, h1) = (before[2] - before[0], before[3] - before[1]);
    let (w2, h2) = (after[2] - after[0], after[3] - after[1]);
    let ar = (w2 / (h2 + EPS)).max(h2 / (w2 + EPS));

    w2 > wh_thr && h2 > wh_thr && w2 * h2 / (w1 * h1 + EPS) > AREA_THR && ar < AR_THR
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::data::{
        InMemoryDataset, NoopImageOps,
        dataset::tests::boxed,
    };

    fn config(mosaic_prob: f32) -> MosaicConfig {
        MosaicConfig {
            mosaic_prob,
            enable_mixup: true,
            mixup_prob: 1.0,
            mixup_scale: (0.5, 1.5),
            affine: AffineParams {
                degrees: 0.0,
                translate: 0.0,
                scales: (1.0, 1.0),
                shear: 0.0,
                perspective: 0.0,
            },
        }
    }

    fn mosaic(mosaic_prob: f32) -> MosaicDetection {
        let samples = (0..4).map(|i| boxed(i, 32, 48)).collect();
        let dataset = InMemoryDataset::new(samples, (32, 32)).unwrap();
        let transform = TrainTransform {
            max_labels: 16,
            flip_prob: 0.5,
            hsv_prob: 1.0,
            gaussian_prob: 0.0,
        };
        MosaicDetection::new(
            Arc::new(dataset),
            transform,
            Arc::new(NoopImageOps),
            config(mosaic_prob),
            true,
        )
    }

    #[test]
    fn items_have_the_input_shape() {
        let ds = mosaic(1.0);
        let mut rng = StdRng::seed_from_u64(3);

        for idx in 0..4 {
            let item = ds.get_item(idx, true, &mut rng).unwrap();
            assert_eq!(item.image.dim(), (3, 32, 32));
            assert_eq!(item.targets.dim(), (16, 6));
            assert_eq!(item.idx, idx);
        }
    }

    #[test]
    fn plain_items_keep_their_identity() {
        let ds = mosaic(0.0);
        let mut rng = StdRng::seed_from_u64(0);

        let item = ds.get_item(2, true, &mut rng).unwrap();
        assert_eq!(item.info.id, 2);
        // A single box survives, everything else is padding.
        assert!(item.targets.row(0)[4] > 0.0);
        assert!(item.targets.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn closing_mosaic_is_shared() {
        let ds = mosaic(1.0);
        let flag = ds.mosaic_flag();

        assert!(ds.is_mosaic());
        ds.close_mosaic();
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn quadrants_tile_the_center() {
        let (xc, yc) = (40, 30);
        let (large, small) = mosaic_coordinates(0, (xc, yc), (20, 10), (32, 32));
        assert_eq!(large, [20, 20, 40, 30]);
        assert_eq!(small, [0, 0, 20, 10]);

        let (large, small) = mosaic_coordinates(3, (xc, yc), (40, 50), (32, 32));
        assert_eq!(large, [40, 30, 64, 64]);
        assert_eq!(small, [0, 0, 24, 34]);
    }

    #[test]
    fn squashed_boxes_are_not_candidates() {
        let before = [0.0, 0.0, 20.0, 20.0];
        assert!(box_candidate(before, [0.0, 0.0, 18.0, 18.0], 5.0));
        assert!(!box_candidate(before, [0.0, 0.0, 20.0, 3.0], 5.0));
    }
}

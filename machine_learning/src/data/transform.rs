use ndarray::{Array2, Array3, Axis, s};
use rand::{Rng, RngCore};

use super::resize::resize_hwc;

/// The gray level letterbox padding is filled with.
pub const PAD_VALUE: f32 = 114.0;

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// The random affine warp applied to a mosaic canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub degrees: f32,
    pub translate: f32,
    pub scales: (f32, f32),
    pub shear: f32,
    pub perspective: f32,
}

/// Pixel level augmentation kernels.
pub trait ImageOps: Send + Sync {
    /// Jitters hue, saturation and value in place.
    fn augment_hsv(&self, image: &mut Array3<f32>, rng: &mut dyn RngCore);

    fn gaussian_blur(&self, image: &mut Array3<f32>, rng: &mut dyn RngCore);

    /// Warps `image` into a `target` `(height, width)` canvas and moves the labels along.
    fn random_affine(
        &self,
        image: Array3<f32>,
        labels: Array2<f32>,
        target: (usize, usize),
        params: &AffineParams,
        rng: &mut dyn RngCore,
    ) -> (Array3<f32>, Array2<f32>);
}

/// Leaves pixels untouched. Its affine step only crops the centered `target` window, which
/// is the warp a mosaic canvas gets with every parameter at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopImageOps;

impl ImageOps for NoopImageOps {
    fn augment_hsv(&self, _image: &mut Array3<f32>, _rng: &mut dyn RngCore) {}

    fn gaussian_blur(&self, _image: &mut Array3<f32>, _rng: &mut dyn RngCore) {}

    fn random_affine(
        &self,
        image: Array3<f32>,
        mut labels: Array2<f32>,
        target: (usize, usize),
        _params: &AffineParams,
        _rng: &mut dyn RngCore,
    ) -> (Array3<f32>, Array2<f32>) {
        let (h, w, _) = image.dim();
        let (th, tw) = target;
        let top = h.saturating_sub(th) / 2;
        let left = w.saturating_sub(tw) / 2;

        let mut out = Array3::from_elem((th, tw, image.dim().2), PAD_VALUE);
        let ch = th.min(h - top);
        let cw = tw.min(w - left);
        out.slice_mut(s![..ch, ..cw, ..])
            .assign(&image.slice(s![top..top + ch, left..left + cw, ..]));

        for mut row in labels.rows_mut() {
            row[0] = (row[0] - left as f32).clamp(0.0, tw as f32);
            row[2] = (row[2] - left as f32).clamp(0.0, tw as f32);
            row[1] = (row[1] - top as f32).clamp(0.0, th as f32);
            row[3] = (row[3] - top as f32).clamp(0.0, th as f32);
        }

        let keep: Vec<_> = labels
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(_, r)| r[2] > r[0] && r[3] > r[1])
            .map(|(i, _)| i)
            .collect();

        (out, labels.select(Axis(0), &keep))
    }
}

/// Resizes `image` to fit in `input_dim` keeping its aspect ratio, pads the rest and
/// transposes it to `(c, h, w)`.
///
/// # Returns
/// The padded image and the resize ratio.
pub fn letterbox(image: &Array3<f32>, input_dim: (usize, usize)) -> (Array3<f32>, f32) {
    let (h, w, c) = image.dim();
    let (ih, iw) = input_dim;
    let r = (ih as f32 / h as f32).min(iw as f32 / w as f32);

    let rh = ((h as f32 * r) as usize).clamp(1, ih);
    let rw = ((w as f32 * r) as usize).clamp(1, iw);
    let resized = resize_hwc(image.view(), rh, rw);

    let mut padded = Array3::from_elem((ih, iw, c), PAD_VALUE);
    padded.slice_mut(s![..rh, ..rw, ..]).assign(&resized);

    let chw = padded.permuted_axes([2, 0, 1]).as_standard_layout().into_owned();
    (chw, r)
}

fn mirror(image: &mut Array3<f32>, labels: &mut Array2<f32>) {
    let width = image.dim().1 as f32;
    image.invert_axis(Axis(1));
    let flipped = image.as_standard_layout().into_owned();
    *image = flipped;

    for mut row in labels.rows_mut() {
        let (x1, x2) = (row[0], row[2]);
        row[0] = width - x2;
        row[2] = width - x1;
    }
}

/// `[x1, y1, x2, y2, class, color]` rows to `[class, color, cx, cy, w, h]` rows, scaled by
/// `r`, dropping boxes whose smaller side is at most one pixel.
fn to_targets(labels: &Array2<f32>, r: f32, min_side: Option<f32>) -> Array2<f32> {
    let rows: Vec<[f32; 6]> = labels
        .rows()
        .into_iter()
        .filter_map(|l| {
            let (x1, y1, x2, y2) = (l[0] * r, l[1] * r, l[2] * r, l[3] * r);
            let (w, h) = (x2 - x1, y2 - y1);
            let keep = min_side.is_none_or(|min| w.min(h) > min);
            keep.then_some([l[4], l[5], x1 + w / 2.0, y1 + h / 2.0, w, h])
        })
        .collect();

    let mut targets = Array2::zeros((rows.len(), 6));
    for (mut dst, src) in targets.rows_mut().into_iter().zip(rows) {
        dst.assign(&ndarray::aview1(&src));
    }
    targets
}

/// Copies at most `max_labels` rows into a zeroed `(max_labels, 6)` matrix.
fn pad_targets(targets: &Array2<f32>, max_labels: usize) -> Array2<f32> {
    let mut padded = Array2::zeros((max_labels, 6));
    let n = targets.nrows().min(max_labels);
    padded
        .slice_mut(s![..n, ..])
        .assign(&targets.slice(s![..n, ..]));
    padded
}

/// The per-sample training pipeline run after the mosaic step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainTransform {
    pub max_labels: usize,
    pub flip_prob: f32,
    pub hsv_prob: f32,
    pub gaussian_prob: f32,
}

impl Default for TrainTransform {
    fn default() -> Self {
        Self {
            max_labels: 50,
            flip_prob: 0.5,
            hsv_prob: 1.0,
            gaussian_prob: 0.0,
        }
    }
}

impl TrainTransform {
    /// Augments and letterboxes one sample.
    ///
    /// # Arguments
    /// * `image` - An `(h, w, c)` image.
    /// * `labels` - `[x1, y1, x2, y2, class, color]` rows in `image` pixels.
    /// * `input_dim` - The `(height, width)` to letterbox to.
    /// * `ops` - The pixel kernels.
    /// * `rng` - The sample's random source.
    ///
    /// # Returns
    /// The `(c, h, w)` image and a `(max_labels, 6)` matrix of
    /// `[class, color, cx, cy, w, h]` rows, zero padded.
    pub fn apply(
        &self,
        image: Array3<f32>,
        labels: Array2<f32>,
        input_dim: (usize, usize),
        ops: &dyn ImageOps,
        rng: &mut dyn RngCore,
    ) -> (Array3<f32>, Array2<f32>) {
        if labels.nrows() == 0 {
            let (image, _) = letterbox(&image, input_dim);
            return (image, Array2::zeros((self.max_labels, 6)));
        }

        let original = (image.clone(), labels.clone());
        let (mut image, mut labels) = (image, labels);

        if rng.random::<f32>() < self.hsv_prob {
            ops.augment_hsv(&mut image, rng);
        }
        if rng.random::<f32>() < self.gaussian_prob {
            ops.gaussian_blur(&mut image, rng);
        }
        if rng.random::<f32>() < self.flip_prob {
            mirror(&mut image, &mut labels);
        }

        let (out, r) = letterbox(&image, input_dim);
        let targets = to_targets(&labels, r, Some(1.0));
        if targets.nrows() > 0 {
            return (out, pad_targets(&targets, self.max_labels));
        }

        // Every box vanished, fall back to the untouched sample and keep all its boxes.
        let (image, labels) = original;
        let (out, r) = letterbox(&image, input_dim);
        (out, pad_targets(&to_targets(&labels, r, None), self.max_labels))
    }
}

/// The evaluation pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValTransform {
    /// Reverse the channels and normalize with the ImageNet statistics, as older
    /// checkpoints expect.
    pub legacy: bool,
}

impl ValTransform {
    /// Letterboxes an `(h, w, c)` image into a `(c, h, w)` one.
    pub fn apply(&self, image: &Array3<f32>, input_dim: (usize, usize)) -> Array3<f32> {
        let (mut out, _) = letterbox(image, input_dim);
        if !self.legacy {
            return out;
        }

        out.invert_axis(Axis(0));
        let mut out = out.as_standard_layout().into_owned();
        for (c, mut plane) in out.outer_iter_mut().enumerate() {
            let (mean, std) = (MEAN[c % 3], STD[c % 3]);
            plane.mapv_inplace(|v| (v / 255.0 - mean) / std);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn never() -> TrainTransform {
        TrainTransform {
            max_labels: 4,
            flip_prob: 0.0,
            hsv_prob: 0.0,
            gaussian_prob: 0.0,
        }
    }

    #[test]
    fn letterbox_pads_with_gray() {
        let image = Array3::zeros((10, 20, 3));
        let (out, r) = letterbox(&image, (20, 20));

        assert_eq!(out.dim(), (3, 20, 20));
        assert_eq!(r, 1.0);
        assert_eq!(out[[0, 9, 19]], 0.0);
        assert_eq!(out[[1, 10, 0]], PAD_VALUE);
    }

    #[test]
    fn targets_are_centered_scaled_and_padded() {
        let image = Array3::zeros((10, 10, 3));
        let labels = arr2(&[[0.0, 0.0, 4.0, 2.0, 3.0, 1.0]]);
        let mut rng = StdRng::seed_from_u64(0);

        let (out, targets) = never().apply(image, labels, (20, 20), &NoopImageOps, &mut rng);

        assert_eq!(out.dim(), (3, 20, 20));
        assert_eq!(targets.dim(), (4, 6));
        assert_eq!(targets.row(0).to_vec(), vec![3.0, 1.0, 4.0, 2.0, 8.0, 4.0]);
        assert!(targets.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn tiny_boxes_fall_back_to_the_original_boxes() {
        let image = Array3::zeros((10, 10, 3));
        let labels = arr2(&[[0.0, 0.0, 1.0, 1.0, 2.0, 1.0]]);
        let mut rng = StdRng::seed_from_u64(0);

        let (_, targets) = never().apply(image, labels, (10, 10), &NoopImageOps, &mut rng);
        assert_eq!(targets.row(0).to_vec(), vec![2.0, 1.0, 0.5, 0.5, 1.0, 1.0]);
        assert!(targets.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn flipping_mirrors_the_boxes() {
        let mut image = Array3::from_shape_fn((2, 4, 1), |(_, x, _)| x as f32);
        let mut labels = arr2(&[[0.0, 0.0, 1.0, 2.0, 0.0, 0.0]]);

        mirror(&mut image, &mut labels);

        assert_eq!(image[[0, 0, 0]], 3.0);
        assert_eq!(labels.row(0).to_vec()[..4], [3.0, 0.0, 4.0, 2.0]);
    }

    #[test]
    fn legacy_val_normalizes() {
        let image = Array3::from_elem((4, 4, 3), 255.0);
        let out = ValTransform { legacy: true }.apply(&image, (4, 4));
        assert!((out[[0, 0, 0]] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-5);

        let raw = ValTransform::default().apply(&image, (4, 4));
        assert_eq!(raw[[2, 3, 3]], 255.0);
    }

    #[test]
    fn noop_affine_crops_the_center() {
        let image = Array3::zeros((8, 8, 3));
        let labels = arr2(&[[0.0, 0.0, 3.0, 3.0, 0.0, 0.0], [2.0, 2.0, 6.0, 6.0, 1.0, 2.0]]);
        let params = AffineParams {
            degrees: 0.0,
            translate: 0.0,
            scales: (1.0, 1.0),
            shear: 0.0,
            perspective: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(0);

        let (out, labels) = NoopImageOps.random_affine(image, labels, (4, 4), &params, &mut rng);

        assert_eq!(out.dim(), (4, 4, 3));
        assert_eq!(labels.nrows(), 2);
        assert_eq!(labels.row(1).to_vec(), vec![0.0, 0.0, 4.0, 4.0, 1.0, 2.0]);
    }
}

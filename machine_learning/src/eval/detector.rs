use ndarray::{Array3, ArrayView4};

use crate::Result;

/// A network that can be run on a batch of letterboxed images.
pub trait Detector: Send + Sync {
    /// Runs the forward pass.
    ///
    /// # Arguments
    /// * `images` - An `(n, c, h, w)` batch.
    /// * `half` - Whether to compute in half precision.
    ///
    /// # Returns
    /// `(n, anchors, 5 + num_classes + num_colors)` rows of
    /// `[cx, cy, w, h, obj, classes.., colors..]` in letterboxed pixels.
    fn detect(&self, images: ArrayView4<f32>, half: bool) -> Result<Array3<f32>>;
}

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis, Zip};

/// Source coordinate and blend weight along one axis, with `align_corners = false`.
#[inline]
fn source_index(dst: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let real = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
    let lo = (real as usize).min(len - 1);
    let hi = if lo < len - 1 { lo + 1 } else { lo };
    (lo, hi, real - lo as f32)
}

/// Bilinearly resamples a single plane to `(out_h, out_w)`.
pub fn bilinear_plane(src: ArrayView2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Array2::zeros((out_h, out_w));
    }

    let scale_y = in_h as f32 / out_h as f32;
    let scale_x = in_w as f32 / out_w as f32;
    let cols: Vec<_> = (0..out_w)
        .map(|x| source_index(x, scale_x, in_w))
        .collect();

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, ly) = source_index(y, scale_y, in_h);
        let (x0, x1, lx) = cols[x];

        let top = src[[y0, x0]] * (1.0 - lx) + src[[y0, x1]] * lx;
        let bottom = src[[y1, x0]] * (1.0 - lx) + src[[y1, x1]] * lx;
        top * (1.0 - ly) + bottom * ly
    })
}

/// Resizes an `(h, w, c)` image.
pub fn resize_hwc(image: ArrayView3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let channels = image.dim().2;
    let mut out = Array3::zeros((out_h, out_w, channels));

    for (c, plane) in image.axis_iter(Axis(2)).enumerate() {
        out.index_axis_mut(Axis(2), c)
            .assign(&bilinear_plane(plane, out_h, out_w));
    }

    out
}

/// Resizes an `(n, c, h, w)` batch, images in parallel.
pub fn interpolate_bilinear(images: ArrayView4<f32>, size: (usize, usize)) -> Array4<f32> {
    let (n, c, _, _) = images.dim();
    let (out_h, out_w) = size;
    let mut out = Array4::zeros((n, c, out_h, out_w));

    Zip::from(out.axis_iter_mut(Axis(0)))
        .and(images.axis_iter(Axis(0)))
        .par_for_each(|mut dst, src| {
            for (mut dst_plane, src_plane) in dst.outer_iter_mut().zip(src.outer_iter()) {
                dst_plane.assign(&bilinear_plane(src_plane, out_h, out_w));
            }
        });

    out
}

use std::cmp::Ordering;

use ndarray::{Array2, ArrayView1, ArrayView3, Axis};

/// The amount of columns of a detection row:
/// `[x1, y1, x2, y2, obj, cls_conf, cls, color_conf, color]`.
pub const DETECTION_COLS: usize = 9;

/// Intersection over union of two `[x1, y1, x2, y2]` boxes.
pub fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = w * h;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;

    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Index and value of the largest element.
fn argmax(values: ArrayView1<f32>) -> (usize, f32) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
            if v > best.1 { (i, v) } else { best }
        })
}

/// Greedy non maximum suppression over boxes of a single class.
///
/// # Returns
/// The indices of the kept boxes, highest score first.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], threshold: f32) -> Vec<usize> {
    let mut order: Vec<_> = (0..boxes.len()).collect();
    order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));

    let mut keep: Vec<usize> = Vec::new();
    for i in order {
        if keep.iter().all(|&k| iou(boxes[k], boxes[i]) <= threshold) {
            keep.push(i);
        }
    }
    keep
}

/// Turns raw head outputs into per-image detections.
///
/// # Arguments
/// * `prediction` - `(n, anchors, 5 + num_classes + num_colors)` rows of
///   `[cx, cy, w, h, obj, classes.., colors..]`.
/// * `num_classes` - The amount of class scores per row.
/// * `num_colors` - The amount of color scores per row.
/// * `conf_thre` - The minimum `obj * cls_conf` a detection must reach.
/// * `nms_thre` - The IoU above which a lower scored box of the same class is dropped.
///
/// # Returns
/// One `(k, 9)` matrix per image, sorted by score, possibly empty.
pub fn postprocess(
    prediction: ArrayView3<f32>,
    num_classes: usize,
    num_colors: usize,
    conf_thre: f32,
    nms_thre: f32,
) -> Vec<Array2<f32>> {
    prediction
        .outer_iter()
        .map(|image| {
            let mut candidates: Vec<[f32; DETECTION_COLS]> = image
                .outer_iter()
                .filter_map(|row| {
                    let (cls, cls_conf) = argmax(row.slice(ndarray::s![5..5 + num_classes]));
                    let obj = row[4];
                    if obj * cls_conf < conf_thre {
                        return None;
                    }

                    let (color, color_conf) = if num_colors > 0 {
                        argmax(row.slice(ndarray::s![5 + num_classes..5 + num_classes + num_colors]))
                    } else {
                        (0, 0.0)
                    };

                    let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
                    Some([
                        cx - w / 2.0,
                        cy - h / 2.0,
                        cx + w / 2.0,
                        cy + h / 2.0,
                        obj,
                        cls_conf,
                        cls as f32,
                        color_conf,
                        color as f32,
                    ])
                })
                .collect();

            candidates.sort_by(|a, b| (b[4] * b[5]).partial_cmp(&(a[4] * a[5])).unwrap_or(Ordering::Equal));

            let mut kept = Vec::with_capacity(candidates.len());
            for class in 0..num_classes {
                let members: Vec<_> = candidates
                    .iter()
                    .filter(|d| d[6] as usize == class)
                    .collect();
                if members.is_empty() {
                    continue;
                }

                let boxes: Vec<_> = members.iter().map(|d| [d[0], d[1], d[2], d[3]]).collect();
                let scores: Vec<_> = members.iter().map(|d| d[4] * d[5]).collect();
                kept.extend(nms(&boxes, &scores, nms_thre).into_iter().map(|i| *members[i]));
            }

            kept.sort_by(|a, b| (b[4] * b[5]).partial_cmp(&(a[4] * a[5])).unwrap_or(Ordering::Equal));

            let mut out = Array2::zeros((kept.len(), DETECTION_COLS));
            for (mut dst, src) in out.axis_iter_mut(Axis(0)).zip(&kept) {
                dst.assign(&ndarray::aview1(src));
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn row(cx: f32, cy: f32, obj: f32, cls: usize, color: usize) -> [f32; 9] {
        let mut r = [cx, cy, 10.0, 10.0, obj, 0.0, 0.0, 0.0, 0.0];
        r[5 + cls] = 0.9;
        r[7 + color] = 0.8;
        r
    }

    fn prediction(rows: &[[f32; 9]]) -> Array3<f32> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Array3::from_shape_vec((1, rows.len(), 9), flat).unwrap()
    }

    #[test]
    fn iou_of_known_boxes() {
        assert_eq!(iou([0.0, 0.0, 2.0, 2.0], [0.0, 0.0, 2.0, 2.0]), 1.0);
        assert!((iou([0.0, 0.0, 2.0, 2.0], [1.0, 0.0, 3.0, 2.0]) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou([0.0, 0.0, 1.0, 1.0], [5.0, 5.0, 6.0, 6.0]), 0.0);
    }

    #[test]
    fn overlapping_boxes_of_a_class_are_suppressed() {
        // Two classes and two colors: 5 + 2 + 2 columns.
        let pred = prediction(&[
            row(50.0, 50.0, 0.9, 0, 1),
            row(51.0, 50.0, 0.8, 0, 0),
            row(51.0, 50.0, 0.8, 1, 0),
            row(10.0, 10.0, 0.1, 0, 0),
        ]);

        let out = postprocess(pred.view(), 2, 2, 0.3, 0.45);
        assert_eq!(out.len(), 1);

        let dets = &out[0];
        assert_eq!(dets.nrows(), 2);
        assert_eq!(dets.row(0).to_vec(), vec![45.0, 45.0, 55.0, 55.0, 0.9, 0.9, 0.0, 0.8, 1.0]);
        assert_eq!(dets[[1, 6]], 1.0);
    }

    #[test]
    fn nothing_above_threshold_gives_an_empty_matrix() {
        let pred = prediction(&[row(5.0, 5.0, 0.2, 0, 0)]);
        let out = postprocess(pred.view(), 2, 2, 0.5, 0.45);
        assert_eq!(out[0].dim(), (0, DETECTION_COLS));
    }
}

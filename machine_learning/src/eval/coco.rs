use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write,
    time::Instant,
};

use comms::Communicator;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::{
    detector::Detector,
    postprocess::{iou, postprocess},
};
use crate::{
    MlErr, Result,
    data::{EvalLoader, ImageInfo},
};

/// Detections kept per image, as in the COCO protocol.
const MAX_DETS: usize = 100;

/// One detection in original image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub image_id: u64,
    pub category_id: usize,
    /// `[x, y, w, h]`.
    pub bbox: [f32; 4],
    pub score: f32,
    pub color_id: usize,
    pub color_score: f32,
}

impl DetectionRecord {
    fn xyxy(&self) -> [f32; 4] {
        let [x, y, w, h] = self.bbox;
        [x, y, x + w, y + h]
    }
}

/// The outcome of an evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub ap50_95: f32,
    pub ap50: f32,
    /// Share of boxes matched at IoU 0.5 whose predicted color is right.
    pub color_accuracy: f32,
    pub summary: String,
    pub detections: Vec<DetectionRecord>,
}

impl EvalResult {
    /// The detections in the COCO results format.
    pub fn detections_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.detections)?)
    }
}

// A record travels as: index (2), image id (2), category, bbox (4), score, color, color score.
const RECORD_LEN: usize = 12;

fn encode_u64(v: u64) -> [f32; 2] {
    [f32::from_bits(v as u32), f32::from_bits((v >> 32) as u32)]
}

fn decode_u64(lo: f32, hi: f32) -> u64 {
    lo.to_bits() as u64 | ((hi.to_bits() as u64) << 32)
}

fn encode_records(records: &[(usize, DetectionRecord)]) -> Vec<f32> {
    let mut out = Vec::with_capacity(records.len() * RECORD_LEN);
    for (idx, r) in records {
        out.extend(encode_u64(*idx as u64));
        out.extend(encode_u64(r.image_id));
        out.push(r.category_id as f32);
        out.extend(r.bbox);
        out.extend([r.score, r.color_id as f32, r.color_score]);
    }
    out
}

fn decode_records(flat: &[f32]) -> Result<Vec<(usize, DetectionRecord)>> {
    if flat.len() % RECORD_LEN != 0 {
        return Err(MlErr::SizeMismatch {
            what: "gathered detections",
            got: flat.len(),
            expected: flat.len() / RECORD_LEN * RECORD_LEN,
        });
    }

    Ok(flat
        .chunks_exact(RECORD_LEN)
        .map(|c| {
            let record = DetectionRecord {
                image_id: decode_u64(c[2], c[3]),
                category_id: c[4] as usize,
                bbox: [c[5], c[6], c[7], c[8]],
                score: c[9],
                color_id: c[10] as usize,
                color_score: c[11],
            };
            (decode_u64(c[0], c[1]) as usize, record)
        })
        .collect())
}

/// A ground truth box, `[x1, y1, x2, y2]` in original pixels.
#[derive(Debug, Clone, Copy)]
struct GtBox {
    image_id: u64,
    bbox: [f32; 4],
    category: usize,
    color: usize,
}

/// COCO style detection evaluation with an extra color accuracy.
pub struct CocoEvaluator {
    loader: EvalLoader,
    img_size: (usize, usize),
    confthre: f32,
    nmsthre: f32,
    num_classes: usize,
    num_colors: usize,
    testdev: bool,
}

impl CocoEvaluator {
    /// Creates a new `CocoEvaluator`.
    ///
    /// # Arguments
    /// * `loader` - The images this rank evaluates.
    /// * `img_size` - The `(height, width)` the images are letterboxed to.
    /// * `confthre` - The minimum detection confidence.
    /// * `nmsthre` - The NMS IoU threshold.
    /// * `num_classes` - The amount of object classes.
    /// * `num_colors` - The amount of color classes.
    /// * `testdev` - Only collect detections, the split has no labels.
    pub fn new(
        loader: EvalLoader,
        img_size: (usize, usize),
        confthre: f32,
        nmsthre: f32,
        num_classes: usize,
        num_colors: usize,
        testdev: bool,
    ) -> Self {
        Self {
            loader,
            img_size,
            confthre,
            nmsthre,
            num_classes,
            num_colors,
            testdev,
        }
    }

    #[inline]
    pub fn loader(&self) -> &EvalLoader {
        &self.loader
    }

    #[inline]
    pub fn is_testdev(&self) -> bool {
        self.testdev
    }

    /// Runs `model` over the evaluation split and scores it.
    ///
    /// # Arguments
    /// * `model` - The detector to evaluate.
    /// * `comm` - The collective handle used to merge every rank's detections.
    /// * `is_distributed` - Whether other ranks evaluate the rest of the split.
    /// * `half` - Whether the detector should run in half precision.
    ///
    /// # Returns
    /// The scores, identical on every rank, or an error if the detector output has the
    /// wrong shape or a collective fails.
    pub async fn evaluate<D, C>(
        &self,
        model: &D,
        comm: &C,
        is_distributed: bool,
        half: bool,
    ) -> Result<EvalResult>
    where
        D: Detector + ?Sized,
        C: Communicator,
    {
        let start = Instant::now();
        let width = 5 + self.num_classes + self.num_colors;

        let mut processed = Vec::with_capacity(self.loader.num_images());
        let mut records = Vec::new();

        for batch in self.loader.batches() {
            let batch = batch?;
            let output = model.detect(batch.images.view(), half)?;

            let (n, _, cols) = output.dim();
            if n != batch.infos.len() || cols != width {
                return Err(MlErr::ShapeMismatch {
                    what: "detector output",
                    got: output.shape().to_vec(),
                    expected: vec![batch.infos.len(), output.dim().1, width],
                });
            }

            let detections = postprocess(
                output.view(),
                self.num_classes,
                self.num_colors,
                self.confthre,
                self.nmsthre,
            );

            for ((dets, info), &idx) in detections.iter().zip(&batch.infos).zip(&batch.indices) {
                processed.push(idx);
                records.extend(self.to_records(dets, info).into_iter().map(|r| (idx, r)));
            }
        }

        info!(
            "inference over {} images took {:.2}s",
            processed.len(),
            start.elapsed().as_secs_f32()
        );

        let (processed, records) = if is_distributed {
            merge_ranks(comm, processed, records).await?
        } else {
            (processed, records.into_iter().map(|(_, r)| r).collect())
        };

        if self.testdev {
            let summary = format!(
                "test-dev: {} detections over {} images, no AP without labels",
                records.len(),
                processed.len()
            );
            return Ok(EvalResult {
                ap50_95: 0.0,
                ap50: 0.0,
                color_accuracy: 0.0,
                summary,
                detections: records,
            });
        }

        let mut gts = Vec::new();
        for &idx in &processed {
            let (info, labels) = self.loader.dataset().annotation(idx)?;
            gts.extend(labels.rows().into_iter().map(|l| GtBox {
                image_id: info.id,
                bbox: [l[0], l[1], l[2], l[3]],
                category: l[4] as usize,
                color: l[5] as usize,
            }));
        }

        let stats = score(&gts, &records, self.num_classes);
        let summary = stats.summary();
        info!("evaluation finished\n{summary}");

        Ok(EvalResult {
            ap50_95: stats.ap50_95,
            ap50: stats.ap50,
            color_accuracy: stats.color_accuracy,
            summary,
            detections: records,
        })
    }

    /// Rescales a letterboxed image's detections back to the original image.
    fn to_records(&self, dets: &Array2<f32>, info: &ImageInfo) -> Vec<DetectionRecord> {
        let (th, tw) = self.img_size;
        let scale = (th as f32 / info.height as f32).min(tw as f32 / info.width as f32);

        dets.rows()
            .into_iter()
            .map(|d| {
                let (x1, y1, x2, y2) = (d[0] / scale, d[1] / scale, d[2] / scale, d[3] / scale);
                DetectionRecord {
                    image_id: info.id,
                    category_id: d[6] as usize,
                    bbox: [x1, y1, x2 - x1, y2 - y1],
                    score: d[4] * d[5],
                    color_id: d[8] as usize,
                    color_score: d[7],
                }
            })
            .collect()
    }
}

/// Gathers every rank's results and keeps, for each image, the detections of the lowest
/// rank that evaluated it.
async fn merge_ranks<C: Communicator>(
    comm: &C,
    processed: Vec<usize>,
    records: Vec<(usize, DetectionRecord)>,
) -> Result<(Vec<usize>, Vec<DetectionRecord>)> {
    let ids: Vec<f32> = processed.iter().flat_map(|&i| encode_u64(i as u64)).collect();
    let all_processed = comm.all_gather(ids).await?;
    let all_records = comm.all_gather(encode_records(&records)).await?;

    let mut owner: BTreeMap<usize, usize> = BTreeMap::new();
    for (rank, ids) in all_processed.iter().enumerate() {
        for pair in ids.chunks_exact(2) {
            owner.entry(decode_u64(pair[0], pair[1]) as usize).or_insert(rank);
        }
    }

    let mut merged = Vec::new();
    for (rank, flat) in all_records.iter().enumerate() {
        for (idx, record) in decode_records(flat)? {
            if owner.get(&idx) == Some(&rank) {
                merged.push(record);
            }
        }
    }

    Ok((owner.into_keys().collect(), merged))
}

struct Stats {
    ap50_95: f32,
    ap50: f32,
    color_accuracy: f32,
    per_class: Vec<Option<f32>>,
}

impl Stats {
    fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            " Average Precision  (AP) @[ IoU=0.50:0.95 | area=   all | maxDets={MAX_DETS} ] = {:.3}",
            self.ap50_95
        );
        let _ = writeln!(
            out,
            " Average Precision  (AP) @[ IoU=0.50      | area=   all | maxDets={MAX_DETS} ] = {:.3}",
            self.ap50
        );
        let _ = writeln!(out, " Color accuracy     @[ IoU=0.50 ] = {:.3}", self.color_accuracy);

        for (class, ap) in self.per_class.iter().enumerate() {
            if let Some(ap) = ap {
                let _ = writeln!(out, " class {class:>3} | AP {:.3}", ap);
            }
        }
        out
    }
}

/// The IoU thresholds 0.50, 0.55, ..., 0.95.
fn iou_thresholds() -> impl Iterator<Item = f32> {
    (0..10).map(|i| 0.5 + 0.05 * i as f32)
}

/// Keeps the `MAX_DETS` best detections of every image.
fn cap_per_image(records: &[DetectionRecord]) -> Vec<&DetectionRecord> {
    let mut by_image: HashMap<u64, Vec<&DetectionRecord>> = HashMap::new();
    for r in records {
        by_image.entry(r.image_id).or_default().push(r);
    }

    by_image
        .into_values()
        .flat_map(|mut dets| {
            dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
            dets.truncate(MAX_DETS);
            dets
        })
        .collect()
}

/// Matches one class' detections against its ground truth at an IoU threshold.
///
/// # Returns
/// The AP over 101 recall points and, for every matched detection, whether its color
/// agrees with the ground truth.
fn match_class(gts: &[&GtBox], dets: &[&DetectionRecord], threshold: f32) -> (f32, Vec<bool>) {
    let mut by_image: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, gt) in gts.iter().enumerate() {
        by_image.entry(gt.image_id).or_default().push(i);
    }

    let mut taken = HashSet::new();
    let mut tp = Vec::with_capacity(dets.len());
    let mut colors = Vec::new();

    for det in dets {
        let candidates = by_image.get(&det.image_id).map(Vec::as_slice).unwrap_or(&[]);
        let best = candidates
            .iter()
            .filter(|g| !taken.contains(*g))
            .map(|&g| (g, iou(gts[g].bbox, det.xyxy())))
            .filter(|&(_, o)| o >= threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        match best {
            Some((g, _)) => {
                taken.insert(g);
                tp.push(true);
                colors.push(gts[g].color == det.color_id);
            }
            None => tp.push(false),
        }
    }

    let npos = gts.len() as f32;
    let mut recall = Vec::with_capacity(tp.len());
    let mut precision = Vec::with_capacity(tp.len());
    let (mut tps, mut fps) = (0.0f32, 0.0f32);
    for hit in tp {
        if hit {
            tps += 1.0;
        } else {
            fps += 1.0;
        }
        recall.push(tps / npos);
        precision.push(tps / (tps + fps));
    }

    for i in (1..precision.len()).rev() {
        if precision[i] > precision[i - 1] {
            precision[i - 1] = precision[i];
        }
    }

    let ap = (0..=100)
        .map(|i| {
            let r = i as f32 / 100.0;
            let pos = recall.partition_point(|&x| x < r);
            precision.get(pos).copied().unwrap_or(0.0)
        })
        .sum::<f32>()
        / 101.0;

    (ap, colors)
}

fn score(gts: &[GtBox], records: &[DetectionRecord], num_classes: usize) -> Stats {
    let capped = cap_per_image(records);

    let mut per_class = vec![None; num_classes];
    let mut ap50s = Vec::new();
    let (mut color_hits, mut color_total) = (0usize, 0usize);

    for (class, slot) in per_class.iter_mut().enumerate() {
        let class_gts: Vec<_> = gts.iter().filter(|g| g.category == class).collect();
        if class_gts.is_empty() {
            continue;
        }

        let mut dets: Vec<_> = capped
            .iter()
            .copied()
            .filter(|d| d.category_id == class)
            .collect();
        dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let mut aps = Vec::with_capacity(10);
        for (i, threshold) in iou_thresholds().enumerate() {
            let (ap, colors) = match_class(&class_gts, &dets, threshold);
            if i == 0 {
                ap50s.push(ap);
                color_total += colors.len();
                color_hits += colors.iter().filter(|&&ok| ok).count();
            }
            aps.push(ap);
        }

        *slot = Some(aps.iter().sum::<f32>() / aps.len() as f32);
    }

    let evaluated: Vec<f32> = per_class.iter().flatten().copied().collect();
    let mean = |v: &[f32]| {
        if v.is_empty() {
            0.0
        } else {
            v.iter().sum::<f32>() / v.len() as f32
        }
    };

    Stats {
        ap50_95: mean(&evaluated),
        ap50: mean(&ap50s),
        color_accuracy: if color_total == 0 {
            0.0
        } else {
            color_hits as f32 / color_total as f32
        },
        per_class,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gt(image_id: u64, bbox: [f32; 4], category: usize, color: usize) -> GtBox {
        GtBox {
            image_id,
            bbox,
            category,
            color,
        }
    }

    fn det(image_id: u64, xyxy: [f32; 4], category_id: usize, score: f32, color_id: usize) -> DetectionRecord {
        DetectionRecord {
            image_id,
            category_id,
            bbox: [xyxy[0], xyxy[1], xyxy[2] - xyxy[0], xyxy[3] - xyxy[1]],
            score,
            color_id,
            color_score: 0.9,
        }
    }

    #[test]
    fn perfect_predictions_score_one() {
        let gts = vec![
            gt(1, [0.0, 0.0, 10.0, 10.0], 0, 1),
            gt(1, [20.0, 20.0, 40.0, 40.0], 1, 0),
            gt(2, [5.0, 5.0, 15.0, 25.0], 0, 2),
        ];
        let dets: Vec<_> = gts
            .iter()
            .map(|g| det(g.image_id, g.bbox, g.category, 0.9, g.color))
            .collect();

        let stats = score(&gts, &dets, 3);
        assert!((stats.ap50_95 - 1.0).abs() < 1e-6);
        assert!((stats.ap50 - 1.0).abs() < 1e-6);
        assert_eq!(stats.color_accuracy, 1.0);
        assert_eq!(stats.per_class[2], None);
    }

    #[test]
    fn false_positives_ranked_first_lower_ap() {
        let gts = vec![gt(1, [0.0, 0.0, 10.0, 10.0], 0, 0)];
        let dets = vec![
            det(1, [50.0, 50.0, 60.0, 60.0], 0, 0.9, 0),
            det(1, [0.0, 0.0, 10.0, 10.0], 0, 0.5, 1),
        ];

        let stats = score(&gts, &dets, 1);
        assert!((stats.ap50 - 0.5).abs() < 1e-6);
        assert_eq!(stats.color_accuracy, 0.0);
    }

    #[test]
    fn missing_detections_give_zero() {
        let gts = vec![gt(1, [0.0, 0.0, 10.0, 10.0], 0, 0)];
        let stats = score(&gts, &[], 1);
        assert_eq!(stats.ap50_95, 0.0);
        assert!(stats.summary().contains("0.000"));
    }

    #[test]
    fn records_survive_the_wire() {
        let record = det(u64::MAX - 3, [1.0, 2.0, 3.0, 5.0], 4, 0.25, 2);
        let flat = encode_records(&[(77, record.clone())]);
        let decoded = decode_records(&flat).unwrap();

        assert_eq!(decoded, vec![(77, record)]);
        assert!(decode_records(&flat[1..]).is_err());
    }
}

mod coco;
mod detector;
mod postprocess;

pub use coco::{CocoEvaluator, DetectionRecord, EvalResult};
pub use detector::Detector;
pub use postprocess::{DETECTION_COLS, iou, nms, postprocess};

use std::{collections::HashMap, num::NonZeroUsize, sync::Arc};

use comms::{Communicator, LocalGroup, Solo};
use futures::future::join_all;
use machine_learning::{
    Result,
    data::{Dataset, DistributedSampler, EvalLoader, ImageInfo, InMemoryDataset, Sample, ValTransform},
    eval::{CocoEvaluator, Detector},
};
use ndarray::{Array2, Array3, ArrayView4, arr2};

const CLASSES: usize = 2;
const COLORS: usize = 3;
const ANCHORS: usize = 4;

fn labels_of(id: u64) -> Array2<f32> {
    let o = id as f32;
    arr2(&[
        [1.0 + o, 1.0, 8.0 + o, 9.0, (id % 2) as f32, (id % 3) as f32],
        [4.0, 10.0, 14.0, 15.0, 1.0, 0.0],
    ])
}

fn dataset(n: u64) -> Arc<dyn Dataset> {
    let samples = (1..=n)
        .map(|id| Sample {
            image: Array3::from_elem((16, 16, 3), id as f32),
            labels: labels_of(id),
            info: ImageInfo {
                id,
                height: 16,
                width: 16,
            },
        })
        .collect();
    Arc::new(InMemoryDataset::new(samples, (16, 16)).unwrap())
}

/// Reads the image id off the pixels and answers with the exact ground truth.
struct Oracle;

impl Detector for Oracle {
    fn detect(&self, images: ArrayView4<f32>, _half: bool) -> Result<Array3<f32>> {
        let n = images.dim().0;
        let mut out = Array3::zeros((n, ANCHORS, 5 + CLASSES + COLORS));

        for i in 0..n {
            let id = images[[i, 0, 0, 0]] as u64;
            for (a, l) in labels_of(id).rows().into_iter().enumerate() {
                let (w, h) = (l[2] - l[0], l[3] - l[1]);
                let mut row = out.slice_mut(ndarray::s![i, a, ..]);
                row[0] = l[0] + w / 2.0;
                row[1] = l[1] + h / 2.0;
                row[2] = w;
                row[3] = h;
                row[4] = 1.0;
                row[5 + l[4] as usize] = 0.95;
                row[5 + CLASSES + l[5] as usize] = 0.9;
            }
        }

        Ok(out)
    }
}

fn evaluator(dataset: Arc<dyn Dataset>, indices: Vec<usize>, testdev: bool) -> CocoEvaluator {
    let loader = EvalLoader::new(dataset, ValTransform::default(), indices, 2, 1).unwrap();
    CocoEvaluator::new(loader, (16, 16), 0.01, 0.65, CLASSES, COLORS, testdev)
}

#[tokio::test]
async fn perfect_detector_scores_one() {
    let evaluator = evaluator(dataset(5), (0..5).collect(), false);
    let result = evaluator.evaluate(&Oracle, &Solo, false, false).await.unwrap();

    assert!((result.ap50_95 - 1.0).abs() < 1e-5);
    assert!((result.ap50 - 1.0).abs() < 1e-5);
    assert_eq!(result.color_accuracy, 1.0);
    assert_eq!(result.detections.len(), 10);
}

#[tokio::test]
async fn ranks_merge_to_the_same_result() {
    let data = dataset(5);
    let members = LocalGroup::create(NonZeroUsize::new(2).unwrap());

    let runs = members.into_iter().map(|member| {
        let data = Arc::clone(&data);
        async move {
            let indices = DistributedSampler::new(data.len(), member.rank(), member.world_size())
                .unwrap()
                .indices();
            let evaluator = evaluator(data, indices, false);
            evaluator.evaluate(&Oracle, &member, true, false).await.unwrap()
        }
    });

    let results = join_all(runs).await;

    // Rank 1 re-evaluates image 0 as padding, it must not be counted twice.
    for result in &results {
        assert_eq!(result.detections.len(), 10);
        assert!((result.ap50_95 - 1.0).abs() < 1e-5);
    }
    assert_eq!(results[0].detections, results[1].detections);
}

#[tokio::test]
async fn testdev_only_collects_detections() {
    let evaluator = evaluator(dataset(3), (0..3).collect(), true);
    let result = evaluator.evaluate(&Oracle, &Solo, false, false).await.unwrap();

    assert_eq!(result.ap50_95, 0.0);

    let json = result.detections_json().unwrap();
    let parsed: Vec<HashMap<String, serde_json::Value>> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.len(), 6);
    assert!(parsed[0].contains_key("bbox"));
}

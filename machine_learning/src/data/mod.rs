mod batch;
mod dataloader;
mod dataset;
mod mosaic;
pub mod resize;
mod sampler;
mod transform;

pub use batch::{Batch, IndexBatch, YoloBatchSampler, collate};
pub use dataloader::{DataLoader, EvalBatch, EvalLoader};
pub use dataset::{
    Dataset, DatasetProvider, DatasetRequest, ImageInfo, InMemoryDataset, InMemoryProvider,
    LABEL_COLS, Sample, Split,
};
pub use mosaic::{MosaicConfig, MosaicDetection, TrainItem};
pub use sampler::{DistributedSampler, InfiniteSampler, SequentialSampler};
pub use transform::{
    AffineParams, ImageOps, NoopImageOps, PAD_VALUE, TrainTransform, ValTransform, letterbox,
};

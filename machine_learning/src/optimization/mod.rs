mod groups;
mod optimizer;
mod sgd;

pub use groups::{ParamGroups, partition_params};
pub use optimizer::{Gradients, Optimizer};
pub use sgd::{ParamGroup, ParamGroupOptions, Sgd, SgdConfig};

//! The experiment description of a YOLOX detector that also predicts object colors.
//!
//! An [`Exp`] owns the hyperparameters of a run and builds everything the training loop
//! asks for: the model, the data loaders, the optimizer, the learning rate schedule and
//! the evaluator.

pub mod config;
pub mod error;
pub mod exp;

pub use config::ExpConfig;
pub use error::{ExpErr, Result};
pub use exp::Exp;

pub mod data;
pub mod error;
pub mod eval;
pub mod model;
pub mod optimization;
pub mod schedule;

pub use error::{MlErr, Result};

use std::{
    error::Error,
    fmt::{self, Display},
};

use comms::CommsErr;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    UnknownParam {
        id: usize,
    },
    ParamInSeveralGroups {
        name: String,
    },
    UnknownScheduler(String),
    UnknownActivation(String),
    InvalidConfig(String),
    EmptyDataset,
    IndexOutOfRange {
        idx: usize,
        len: usize,
    },
    Dataset(String),
    Comms(CommsErr),
    Json(serde_json::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            MlErr::UnknownParam { id } => write!(f, "There's no parameter with id {id}"),
            MlErr::ParamInSeveralGroups { name } => write!(
                f,
                "The parameter '{name}' appears in more than one parameter group"
            ),
            MlErr::UnknownScheduler(name) => write!(f, "Unknown lr scheduler: '{name}'"),
            MlErr::UnknownActivation(name) => write!(f, "Unknown activation: '{name}'"),
            MlErr::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            MlErr::EmptyDataset => write!(f, "The dataset has no samples"),
            MlErr::IndexOutOfRange { idx, len } => {
                write!(f, "Sample index {idx} is out of range for a dataset of {len}")
            }
            MlErr::Dataset(msg) => write!(f, "Dataset error: {msg}"),
            MlErr::Comms(e) => write!(f, "Communication error: {e}"),
            MlErr::Json(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Comms(e) => Some(e),
            MlErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommsErr> for MlErr {
    fn from(value: CommsErr) -> Self {
        Self::Comms(value)
    }
}

impl From<serde_json::Error> for MlErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

use std::{fmt, io};

use comms::CommsErr;
use machine_learning::MlErr;

/// The result type used across the experiment crate.
pub type Result<T> = std::result::Result<T, ExpErr>;

/// Everything that can go wrong while setting up or running an experiment.
#[derive(Debug)]
pub enum ExpErr {
    /// A model, data or optimization component failed.
    Ml(MlErr),
    /// A collective failed.
    Comms(CommsErr),
    /// The configuration breaks one of its invariants.
    InvalidConfig(String),
    /// An override names a key the configuration doesn't have.
    UnknownKey(String),
    /// An override value doesn't fit its key.
    Parse {
        key: String,
        value: String,
        msg: String,
    },
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ExpErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ml(e) => write!(f, "{e}"),
            Self::Comms(e) => write!(f, "communication error: {e}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::UnknownKey(key) => write!(f, "unknown config key '{key}'"),
            Self::Parse { key, value, msg } => {
                write!(f, "cannot set '{key}' to '{value}': {msg}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for ExpErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Ml(e) => Some(e),
            Self::Comms(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MlErr> for ExpErr {
    fn from(e: MlErr) -> Self {
        Self::Ml(e)
    }
}

impl From<CommsErr> for ExpErr {
    fn from(e: CommsErr) -> Self {
        Self::Comms(e)
    }
}

impl From<io::Error> for ExpErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ExpErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

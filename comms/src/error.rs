use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used across the communication module.
pub type Result<T> = std::result::Result<T, CommsErr>;

/// The communication module's error type.
#[derive(Debug)]
pub enum CommsErr {
    RankOutOfRange {
        rank: usize,
        world_size: usize,
    },
    BufferSizeMismatch {
        got: usize,
        expected: usize,
    },
    InvalidEnv {
        var: &'static str,
        value: String,
    },
}

impl Display for CommsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsErr::RankOutOfRange { rank, world_size } => {
                write!(f, "rank {rank} is out of range for a world of size {world_size}")
            }
            CommsErr::BufferSizeMismatch { got, expected } => write!(
                f,
                "broadcast buffer size mismatch, got {got} and expected {expected}"
            ),
            CommsErr::InvalidEnv { var, value } => {
                write!(f, "invalid value for env var {var}: '{value}'")
            }
        }
    }
}

impl Error for CommsErr {}

use std::env;

use log::debug;

use crate::error::{CommsErr, Result};

/// The rank layout a launcher hands to each process through the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
}

impl Default for DistEnv {
    fn default() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }
}

impl DistEnv {
    /// Reads `RANK`, `LOCAL_RANK` and `WORLD_SIZE`, missing variables fall back to a
    /// single process job.
    ///
    /// # Returns
    /// An error if a variable is set but isn't a valid index.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let read = |var: &'static str, default: usize| -> Result<usize> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| CommsErr::InvalidEnv { var, value }),
            }
        };

        let dist = Self {
            rank: read("RANK", 0)?,
            local_rank: read("LOCAL_RANK", 0)?,
            world_size: read("WORLD_SIZE", 1)?,
        };

        if dist.world_size == 0 || dist.rank >= dist.world_size {
            return Err(CommsErr::RankOutOfRange {
                rank: dist.rank,
                world_size: dist.world_size,
            });
        }

        debug!(
            "rank {} (local {}) of {}",
            dist.rank, dist.local_rank, dist.world_size
        );
        Ok(dist)
    }

    #[inline]
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

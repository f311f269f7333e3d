use crate::error::{CommsErr, Result};

/// The view a single training process has of the distributed job it belongs to.
///
/// Implementations provide the collective primitives the experiment needs to keep every
/// worker in lockstep: a barrier, a broadcast from one rank and an all-gather.
#[allow(unused)]
#[trait_variant::make(Communicator: Send)]
pub trait CommunicatorTemplate: Sync {
    /// Returns this process' global index within the job.
    fn rank(&self) -> usize;

    /// Returns this process' index within its machine.
    fn local_rank(&self) -> usize;

    /// Returns the total amount of processes in the job.
    fn world_size(&self) -> usize;

    /// Blocks until every member of the job has reached this point.
    async fn barrier(&self);

    /// Overwrites `buf` on every rank with the contents `src` holds.
    ///
    /// # Arguments
    /// * `buf` - The buffer to send (on `src`) or to receive into (on every other rank).
    /// * `src` - The rank whose buffer is propagated.
    ///
    /// # Returns
    /// An error if `src` is not a valid rank or the buffer lengths disagree.
    async fn broadcast(&self, buf: &mut [i64], src: usize) -> Result<()>;

    /// Collects one buffer per rank, ordered by rank, on every member.
    ///
    /// # Arguments
    /// * `local` - This rank's contribution.
    ///
    /// # Returns
    /// The contributions of the whole job.
    async fn all_gather(&self, local: Vec<f32>) -> Result<Vec<Vec<f32>>>;
}

/// A job made of a single process, every collective is trivially satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl Solo {
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for Solo {
    fn rank(&self) -> usize {
        0
    }

    fn local_rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn barrier(&self) {}

    async fn broadcast(&self, _buf: &mut [i64], src: usize) -> Result<()> {
        if src != 0 {
            return Err(CommsErr::RankOutOfRange {
                rank: src,
                world_size: 1,
            });
        }

        Ok(())
    }

    async fn all_gather(&self, local: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        Ok(vec![local])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn solo_is_a_world_of_one() {
        let solo = Solo::new();
        assert_eq!(solo.rank(), 0);
        assert_eq!(solo.world_size(), 1);

        let mut buf = [3, 4];
        solo.broadcast(&mut buf, 0).await.unwrap();
        assert_eq!(buf, [3, 4]);

        assert!(solo.broadcast(&mut buf, 1).await.is_err());
        assert_eq!(solo.all_gather(vec![1.0]).await.unwrap(), vec![vec![1.0]]);
    }
}

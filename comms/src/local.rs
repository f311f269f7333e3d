use std::{num::NonZeroUsize, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::{
    Communicator,
    error::{CommsErr, Result},
};

struct Shared {
    world_size: usize,
    barrier: Barrier,
    slot: Mutex<Vec<i64>>,
    gathered: Mutex<Vec<Vec<f32>>>,
}

/// A member of an in-process group of workers.
///
/// Every member of the group runs on its own task and shares a barrier and a pair of
/// exchange slots with its peers, the source of a broadcast writes the slot before the
/// barrier and everyone else reads it after.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Creates every member of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of members in the group.
    ///
    /// # Returns
    /// One `LocalGroup` handle per rank, ordered by rank.
    pub fn create(world_size: NonZeroUsize) -> Vec<Self> {
        let world_size = world_size.get();
        let shared = Arc::new(Shared {
            world_size,
            barrier: Barrier::new(world_size),
            slot: Mutex::new(Vec::new()),
            gathered: Mutex::new(vec![Vec::new(); world_size]),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.shared.world_size {
            return Err(CommsErr::RankOutOfRange {
                rank,
                world_size: self.shared.world_size,
            });
        }

        Ok(())
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn local_rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    async fn barrier(&self) {
        self.shared.barrier.wait().await;
    }

    async fn broadcast(&self, buf: &mut [i64], src: usize) -> Result<()> {
        self.check_rank(src)?;

        if self.rank == src {
            let mut slot = self.shared.slot.lock();
            slot.clear();
            slot.extend_from_slice(buf);
        }

        self.shared.barrier.wait().await;

        let received = if self.rank == src {
            Ok(())
        } else {
            let slot = self.shared.slot.lock();
            if slot.len() == buf.len() {
                buf.copy_from_slice(&slot);
                Ok(())
            } else {
                Err(CommsErr::BufferSizeMismatch {
                    got: buf.len(),
                    expected: slot.len(),
                })
            }
        };

        // The slot may only be reused once every peer has read it.
        self.shared.barrier.wait().await;
        received
    }

    async fn all_gather(&self, local: Vec<f32>) -> Result<Vec<Vec<f32>>> {
        self.shared.gathered.lock()[self.rank] = local;
        self.shared.barrier.wait().await;

        let gathered = self.shared.gathered.lock().clone();
        self.shared.barrier.wait().await;
        Ok(gathered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(n: usize) -> Vec<LocalGroup> {
        LocalGroup::create(NonZeroUsize::new(n).unwrap())
    }

    #[tokio::test]
    async fn broadcast_reaches_every_rank() {
        let handles: Vec<_> = group(4)
            .into_iter()
            .map(|member| {
                tokio::spawn(async move {
                    let mut buf = [member.rank() as i64, -1];
                    if member.rank() == 2 {
                        buf = [42, 7];
                    }

                    member.broadcast(&mut buf, 2).await.unwrap();
                    buf
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), [42, 7]);
        }
    }

    #[tokio::test]
    async fn consecutive_broadcasts_do_not_mix() {
        let handles: Vec<_> = group(3)
            .into_iter()
            .map(|member| {
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for round in 0..5 {
                        let mut buf = [if member.rank() == 0 { round } else { -1 }];
                        member.broadcast(&mut buf, 0).await.unwrap();
                        seen.push(buf[0]);
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn all_gather_orders_by_rank() {
        let handles: Vec<_> = group(3)
            .into_iter()
            .map(|member| {
                tokio::spawn(async move {
                    member
                        .all_gather(vec![member.rank() as f32; member.rank() + 1])
                        .await
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            let gathered = handle.await.unwrap();
            assert_eq!(gathered, vec![vec![0.0], vec![1.0, 1.0], vec![2.0, 2.0, 2.0]]);
        }
    }

    #[tokio::test]
    async fn broadcast_from_unknown_rank_fails() {
        let member = group(1).remove(0);
        let mut buf = [0];
        assert!(matches!(
            member.broadcast(&mut buf, 3).await,
            Err(CommsErr::RankOutOfRange { rank: 3, world_size: 1 })
        ));
    }
}

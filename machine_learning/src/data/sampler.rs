use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{MlErr, Result};

/// Endless stream of dataset indices, sharded across ranks.
///
/// Every cycle is a fresh permutation drawn from a generator seeded once, so all ranks
/// see the same stream and each keeps every `world_size`-th index starting at its rank.
#[derive(Debug, Clone)]
pub struct InfiniteSampler {
    size: usize,
    shuffle: bool,
    rng: StdRng,
    rank: usize,
    world_size: usize,
    cycle: Vec<usize>,
    cursor: usize,
    started: bool,
}

impl InfiniteSampler {
    /// Creates a new `InfiniteSampler`.
    ///
    /// # Arguments
    /// * `size` - The length of the dataset.
    /// * `shuffle` - Whether every cycle is permuted.
    /// * `seed` - The seed shared by all ranks.
    /// * `rank` - This process' rank.
    /// * `world_size` - The amount of ranks.
    ///
    /// # Returns
    /// A new sampler or an error if the dataset is empty or the rank is out of range.
    pub fn new(
        size: usize,
        shuffle: bool,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if size == 0 {
            return Err(MlErr::EmptyDataset);
        }
        if rank >= world_size {
            return Err(MlErr::InvalidConfig(format!(
                "rank {rank} is out of range for a world of {world_size}"
            )));
        }

        Ok(Self {
            size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            rank,
            world_size,
            cycle: Vec::new(),
            cursor: 0,
            started: false,
        })
    }

    /// The next index of the shared stream, regardless of rank.
    fn next_shared(&mut self) -> usize {
        if self.cursor == self.cycle.len() {
            self.cycle = (0..self.size).collect();
            if self.shuffle {
                self.cycle.shuffle(&mut self.rng);
            }
            self.cursor = 0;
        }

        let idx = self.cycle[self.cursor];
        self.cursor += 1;
        idx
    }
}

impl Iterator for InfiniteSampler {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let skip = if self.started {
            self.world_size - 1
        } else {
            self.started = true;
            self.rank
        };

        for _ in 0..skip {
            self.next_shared();
        }

        Some(self.next_shared())
    }
}

/// `0..len`, in order.
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }

    pub fn indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }
}

/// A finite, unshuffled shard of `0..len`.
///
/// The index list is padded by wrapping around so every rank gets the same amount.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(MlErr::InvalidConfig(format!(
                "rank {rank} is out of range for a world of {world_size}"
            )));
        }
        Ok(Self {
            len,
            rank,
            world_size,
        })
    }

    /// The amount of indices each rank gets.
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let total = self.num_samples() * self.world_size;
        (0..total)
            .map(|i| i % self.len)
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ranks_split_the_same_stream() {
        let size = 10;
        let world = 3;
        let mut samplers: Vec<_> = (0..world)
            .map(|rank| InfiniteSampler::new(size, true, 42, rank, world).unwrap())
            .collect();

        let mut shared = InfiniteSampler::new(size, true, 42, 0, 1).unwrap();
        let stream: Vec<_> = (&mut shared).take(30).collect();

        for (rank, sampler) in samplers.iter_mut().enumerate() {
            let got: Vec<_> = sampler.take(10).collect();
            let expected: Vec<_> = stream.iter().copied().skip(rank).step_by(world).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn every_cycle_is_a_permutation() {
        let sampler = InfiniteSampler::new(7, true, 1, 0, 1).unwrap();
        let indices: Vec<_> = sampler.take(21).collect();

        for cycle in indices.chunks(7) {
            let unique: HashSet<_> = cycle.iter().collect();
            assert_eq!(unique.len(), 7);
        }
    }

    #[test]
    fn unshuffled_streams_wrap_in_order() {
        let sampler = InfiniteSampler::new(3, false, 0, 1, 2).unwrap();
        let indices: Vec<_> = sampler.take(4).collect();
        assert_eq!(indices, vec![1, 0, 2, 1]);
    }

    #[test]
    fn empty_datasets_and_bad_ranks_are_rejected() {
        assert!(matches!(
            InfiniteSampler::new(0, true, 0, 0, 1),
            Err(MlErr::EmptyDataset)
        ));
        assert!(InfiniteSampler::new(4, true, 0, 2, 2).is_err());
        assert!(DistributedSampler::new(4, 0, 0).is_err());
    }

    #[test]
    fn distributed_shards_pad_by_wrapping() {
        let shards: Vec<_> = (0..3)
            .map(|rank| DistributedSampler::new(7, rank, 3).unwrap().indices())
            .collect();

        assert_eq!(shards[0], vec![0, 3, 6]);
        assert_eq!(shards[1], vec![1, 4, 0]);
        assert_eq!(shards[2], vec![2, 5, 1]);
    }

    #[test]
    fn sequential_is_in_order() {
        assert_eq!(SequentialSampler::new(3).indices(), vec![0, 1, 2]);
    }
}

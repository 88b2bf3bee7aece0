//! Per-worker batch streams.
//!
//! Sharding follows the distributed-sampler convention: the (optionally
//! shuffled) index list is padded by wrapping to a multiple of the world size
//! and worker `rank` takes every `world_size`-th index starting at `rank`.
//! Every worker therefore sees the same number of batches per epoch.

use super::{Batch, MelDataset};
use crate::perf::{self, Metric};
use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Ordering policy of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMode {
    /// Shuffled per epoch, incomplete final batch dropped.
    Train,
    /// Fixed order, final batch kept.
    Validation,
}

/// Restartable batch stream over one worker's shard.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<MelDataset>,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    mode: LoaderMode,
    seed: u64,
}

impl DataLoader {
    /// `seed` must be identical on every worker so shards stay disjoint.
    pub fn new(
        dataset: Arc<MelDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        mode: LoaderMode,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            rank,
            world_size: world_size.max(1),
            mode,
            seed,
        }
    }

    /// Batches per epoch for this worker.
    pub fn len(&self) -> usize {
        let shard = shard_len(self.dataset.len(), self.world_size);
        match self.mode {
            LoaderMode::Train => shard / self.batch_size,
            LoaderMode::Validation => shard.div_ceil(self.batch_size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dataset indices this worker visits in `epoch`, in order.
    pub fn shard_indices(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.mode == LoaderMode::Train {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        shard(&order, self.rank, self.world_size)
    }

    /// Iterate the batches of one epoch.
    pub fn epoch(&self, epoch: usize) -> EpochIter<'_> {
        let indices = self.shard_indices(epoch);
        EpochIter {
            loader: self,
            indices,
            cursor: 0,
            remaining: self.len(),
        }
    }
}

/// Number of indices each worker receives.
fn shard_len(total: usize, world_size: usize) -> usize {
    total.div_ceil(world_size)
}

/// Pad `order` by wrapping and take the `rank`-th stride.
fn shard(order: &[usize], rank: usize, world_size: usize) -> Vec<usize> {
    if order.is_empty() {
        return Vec::new();
    }
    let total = shard_len(order.len(), world_size) * world_size;
    (rank..total)
        .step_by(world_size)
        .map(|i| order[i % order.len()])
        .collect()
}

/// Iterator over one epoch of batches.
pub struct EpochIter<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    cursor: usize,
    remaining: usize,
}

impl Iterator for EpochIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
        let chunk = &self.indices[self.cursor..end];
        self.cursor = end;

        let _span = perf::span(Metric::DataLoad);
        let items: Result<Vec<_>> = chunk.iter().map(|&i| self.loader.dataset.get(i)).collect();
        Some(items.map(|items| Batch::collate(items, self.loader.dataset.n_mels())))
    }
}

#[cfg(test)]
mod tests {
    use super::{shard, shard_len};

    #[test]
    fn shards_are_equal_and_cover_everything() {
        let order: Vec<usize> = (0..7).collect();
        let a = shard(&order, 0, 2);
        let b = shard(&order, 1, 2);
        assert_eq!(a, vec![0, 2, 4, 6]);
        // Wraps around to pad the last shard.
        assert_eq!(b, vec![1, 3, 5, 0]);
        assert_eq!(shard_len(7, 2), 4);
    }

    #[test]
    fn single_worker_takes_all() {
        let order = vec![3, 1, 2];
        assert_eq!(shard(&order, 0, 1), order);
        assert!(shard(&[], 0, 4).is_empty());
    }
}

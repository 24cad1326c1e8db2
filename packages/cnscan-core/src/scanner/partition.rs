//! Splitting the instance ID space across workers.
//!
//! IDs are shuffled before splitting. Dead IDs fail at DNS almost instantly
//! while live ones cost several round-trips, and both cluster in contiguous
//! ranges, so unshuffled slices would leave some workers idle while others
//! lag.

use rand::Rng;
use rand::seq::SliceRandom;
use std::ops::Range;

/// IDs assigned to one worker, probed in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkBatch(Vec<u64>);

impl WorkBatch {
    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u64>> for WorkBatch {
    fn from(ids: Vec<u64>) -> Self {
        Self(ids)
    }
}

impl IntoIterator for WorkBatch {
    type Item = u64;
    type IntoIter = std::vec::IntoIter<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Shuffle `range` and cut it into exactly `workers` batches whose sizes
/// differ by at most one. Zero workers is treated as one.
pub fn partition_range<R: Rng + ?Sized>(
    range: Range<u64>,
    workers: usize,
    rng: &mut R,
) -> Vec<WorkBatch> {
    let workers = workers.max(1);
    let mut ids: Vec<u64> = range.collect();
    ids.shuffle(rng);

    let base = ids.len() / workers;
    let extra = ids.len() % workers;

    let mut batches = Vec::with_capacity(workers);
    let mut rest = ids.as_slice();
    for index in 0..workers {
        let size = base + usize::from(index < extra);
        let (head, tail) = rest.split_at(size);
        batches.push(WorkBatch(head.to_vec()));
        rest = tail;
    }

    batches
}

/// Partition `[0, total)`.
pub fn partition<R: Rng + ?Sized>(total: u64, workers: usize, rng: &mut R) -> Vec<WorkBatch> {
    partition_range(0..total, workers, rng)
}

/// Partition `[0, total)` with a thread-local RNG.
pub fn partition_random(total: u64, workers: usize) -> Vec<WorkBatch> {
    partition(total, workers, &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    fn assert_exact_cover(batches: &[WorkBatch], expected: Range<u64>) {
        let mut seen = HashSet::new();
        for batch in batches {
            for id in batch.ids() {
                assert!(seen.insert(*id), "id {} assigned twice", id);
            }
        }
        assert_eq!(seen, expected.collect::<HashSet<_>>());
    }

    #[test]
    fn test_even_split() {
        let batches = partition(5000, 10, &mut StdRng::seed_from_u64(7));
        assert_eq!(batches.len(), 10);
        assert!(batches.iter().all(|b| b.len() == 500));
        assert_exact_cover(&batches, 0..5000);
    }

    #[test]
    fn test_uneven_split_differs_by_one() {
        let batches = partition(5003, 10, &mut StdRng::seed_from_u64(7));
        let sizes: Vec<usize> = batches.iter().map(WorkBatch::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 5003);
        assert!(sizes.iter().all(|s| *s == 500 || *s == 501));
        assert_eq!(sizes.iter().filter(|s| **s == 501).count(), 3);
        assert_exact_cover(&batches, 0..5003);
    }

    #[test]
    fn test_ids_are_shuffled() {
        let batches = partition(1000, 1, &mut StdRng::seed_from_u64(42));
        let ordered: Vec<u64> = (0..1000).collect();
        assert_ne!(batches[0].ids(), ordered.as_slice());
    }

    #[test]
    fn test_same_seed_same_partition() {
        let a = partition(200, 4, &mut StdRng::seed_from_u64(3));
        let b = partition(200, 4, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_more_workers_than_ids() {
        let batches = partition(3, 5, &mut StdRng::seed_from_u64(1));
        assert_eq!(batches.len(), 5);
        assert_eq!(batches.iter().filter(|b| b.is_empty()).count(), 2);
        assert_exact_cover(&batches, 0..3);
    }

    #[test]
    fn test_zero_workers_and_offset_range() {
        let batches = partition_range(100..150, 0, &mut StdRng::seed_from_u64(9));
        assert_eq!(batches.len(), 1);
        assert_exact_cover(&batches, 100..150);

        assert!(partition_random(0, 3).iter().all(WorkBatch::is_empty));
    }
}

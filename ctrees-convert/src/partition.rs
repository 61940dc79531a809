//! Work assignment.
//!
//! Forests go to workers by greedy longest-processing-time: largest forest
//! first (input bytes, ties by index position), each onto the currently
//! least-loaded worker (ties by lowest worker index). Inside a partition the
//! forests are then put back in index order. Halo catalogs are assigned as
//! whole files, round-robin.

use crate::index::ForestIndex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Forests owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub worker: usize,
    /// Positions into [`ForestIndex::forests`], ascending.
    pub forests: Vec<usize>,
    /// Sum of the forests' input bytes.
    pub input_bytes: u64,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.forests.is_empty()
    }
}

/// Split the index into `workers` disjoint partitions.
///
/// Deterministic for a given index and worker count. More workers than
/// forests leaves the surplus partitions empty.
pub fn partition_forests(index: &ForestIndex, workers: usize) -> Vec<Partition> {
    let workers = workers.max(1);
    let forests = index.forests();

    let mut order: Vec<usize> = (0..forests.len()).collect();
    order.sort_by_key(|&i| (Reverse(forests[i].input_nbytes), i));

    let mut partitions: Vec<Partition> = (0..workers)
        .map(|worker| Partition {
            worker,
            forests: Vec::new(),
            input_bytes: 0,
        })
        .collect();
    let mut loads: BinaryHeap<Reverse<(u64, usize)>> = (0..workers).map(|w| Reverse((0, w))).collect();

    for position in order {
        let Some(Reverse((load, worker))) = loads.pop() else {
            break;
        };
        let bytes = forests[position].input_nbytes;
        partitions[worker].forests.push(position);
        partitions[worker].input_bytes += bytes;
        loads.push(Reverse((load + bytes, worker)));
    }

    for partition in &mut partitions {
        partition.forests.sort_unstable();
    }
    partitions
}

/// Round-robin whole-file assignment: file `i` goes to worker `i % workers`.
pub fn assign_files(nfiles: usize, workers: usize) -> Vec<Vec<usize>> {
    let workers = workers.max(1);
    (0..workers)
        .map(|w| (w..nfiles).step_by(workers).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ForestEntry, ForestKey};

    fn index_of(sizes: &[u64]) -> ForestIndex {
        let forests = sizes
            .iter()
            .enumerate()
            .map(|(i, &bytes)| ForestEntry {
                key: ForestKey {
                    scope: 0,
                    forest_id: i as i64,
                },
                trees: Vec::new(),
                input_nbytes: bytes,
            })
            .collect();
        ForestIndex::from_forests(forests).unwrap()
    }

    #[test]
    fn disjoint_and_complete() {
        let index = index_of(&[5, 9, 1, 7, 3, 3, 8]);
        let parts = partition_forests(&index, 3);
        let mut all: Vec<usize> = parts.iter().flat_map(|p| p.forests.clone()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        for p in &parts {
            assert!(p.forests.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn greedy_balance() {
        let index = index_of(&[10, 10, 5, 5, 5, 5]);
        let parts = partition_forests(&index, 2);
        assert_eq!(parts[0].input_bytes, 20);
        assert_eq!(parts[1].input_bytes, 20);
        // Largest first onto the least-loaded, ties to the lowest worker.
        assert_eq!(parts[0].forests, vec![0, 2, 4]);
        assert_eq!(parts[1].forests, vec![1, 3, 5]);
    }

    #[test]
    fn load_within_largest_forest_of_ideal() {
        let sizes = [97, 13, 55, 2, 88, 41, 41, 7, 63, 30, 12, 5];
        let index = index_of(&sizes);
        let workers = 4;
        let parts = partition_forests(&index, workers);
        let total: u64 = sizes.iter().sum();
        let largest = *sizes.iter().max().unwrap();
        let max_load = parts.iter().map(|p| p.input_bytes).max().unwrap();
        assert!(max_load <= total / workers as u64 + largest);
    }

    #[test]
    fn comparable_forests_balance_within_factor_two() {
        // 40 forests of 50..=100 bytes over 4 workers.
        let sizes: Vec<u64> = (0..40).map(|i| 50 + (i * 37) % 51).collect();
        let parts = partition_forests(&index_of(&sizes), 4);
        let loads: Vec<u64> = parts.iter().map(|p| p.input_bytes).collect();
        let max_load = *loads.iter().max().unwrap();
        let min_load = *loads.iter().min().unwrap();
        assert!(min_load > 0);
        assert!(max_load <= 2 * min_load, "loads {:?}", loads);
        assert_eq!(loads.iter().sum::<u64>(), sizes.iter().sum::<u64>());
    }

    #[test]
    fn deterministic() {
        let index = index_of(&[4, 4, 4, 4, 2, 2, 9]);
        assert_eq!(partition_forests(&index, 3), partition_forests(&index, 3));
    }

    #[test]
    fn more_workers_than_forests() {
        let index = index_of(&[100]);
        let parts = partition_forests(&index, 4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].forests, vec![0]);
        assert_eq!(parts.iter().filter(|p| p.is_empty()).count(), 3);
    }

    #[test]
    fn round_robin_files() {
        assert_eq!(assign_files(5, 2), vec![vec![0, 2, 4], vec![1, 3]]);
        assert_eq!(assign_files(1, 3), vec![vec![0], vec![], vec![]]);
    }
}

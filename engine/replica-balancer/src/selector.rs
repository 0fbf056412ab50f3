//! Weighted replica selection.
//!
//! Weights are position-indexed: the first discovered replica gets `weights[0]`, the
//! second `weights[1]`, and so on. Only the first `min(replicas, weights)` entries
//! take part in a draw, so with fewer replicas the split renormalizes implicitly.
//! Replicas beyond the table never receive traffic.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_WEIGHTS: [u32; 3] = [50, 30, 20];

pub struct WeightedSelector {
    weights: Vec<u32>,
    rng: Mutex<StdRng>,
}

impl WeightedSelector {
    pub fn new(weights: Vec<u32>) -> Self {
        Self { weights, rng: Mutex::new(StdRng::from_entropy()) }
    }

    /// Deterministic selector for tests and replays
    pub fn with_seed(weights: Vec<u32>, seed: u64) -> Self {
        Self { weights, rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    /// Index of the replica that should take the next item, or `None` when there is
    /// nothing to choose from.
    pub fn select(&self, replicas: usize) -> Option<usize> {
        match replicas {
            0 => return None,
            1 => return Some(0),
            _ => {}
        }

        let eligible = replicas.min(self.weights.len());
        if replicas > eligible {
            tracing::debug!(
                "WeightedSelector ignoring {} replicas beyond the {}-entry weight table",
                replicas - eligible,
                self.weights.len()
            );
        }

        let total: u64 = self.weights[..eligible].iter().map(|&w| u64::from(w)).sum();
        if total == 0 {
            return None;
        }

        let draw = self.rng.lock().gen_range(0..total);
        let mut cumulative = 0u64;
        for (index, &weight) in self.weights[..eligible].iter().enumerate() {
            cumulative += u64::from(weight);
            if draw < cumulative {
                return Some(index);
            }
        }
        None
    }

    /// Pick a replica from a discovered list
    pub fn select_from<'a, T>(&self, replicas: &'a [T]) -> Option<&'a T> {
        self.select(replicas.len()).and_then(|index| replicas.get(index))
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHTS.to_vec())
    }
}

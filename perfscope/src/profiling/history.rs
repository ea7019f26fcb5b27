//! Fixed-capacity sample history
//!
//! Each profiler keeps its most recent samples in a ring. When the ring is
//! full the oldest sample is evicted first.

use std::collections::VecDeque;

use serde::Serialize;

/// One committed measurement: an outermost interval and the calls it covered
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub duration_ms: f64,
    pub hits: u32,
}

#[derive(Debug, Clone)]
pub struct History {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl History {
    /// Ring holding at most `capacity` samples (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, samples: VecDeque::with_capacity(capacity.min(4096)) }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Sample> + ExactSizeIterator {
        self.samples.iter()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

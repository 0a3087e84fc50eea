//! Experience Replay
//!
//! Transition memory for the off-policy TD learner, plus the sliding
//! averages used for diagnostics.

use rand::Rng;
use std::collections::VecDeque;

/// A single transition between two network inputs
#[derive(Debug, Clone, PartialEq)]
pub struct Experience {
    /// Network input before the action
    pub state0: Vec<f64>,
    /// Action taken
    pub action0: usize,
    /// Reward received for it
    pub reward0: f64,
    /// Network input after the action
    pub state1: Vec<f64>,
}

/// Fixed-capacity replay memory.
///
/// Once full, new experiences overwrite a uniformly random slot rather
/// than the oldest one.
#[derive(Debug)]
pub struct ExperienceReplay {
    buffer: Vec<Experience>,
    capacity: usize,
}

impl ExperienceReplay {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Add an experience, replacing a random one when full
    pub fn push<R: Rng + ?Sized>(&mut self, experience: Experience, rng: &mut R) {
        if self.buffer.len() < self.capacity {
            self.buffer.push(experience);
        } else if self.capacity > 0 {
            let slot = rng.gen_range(0..self.capacity);
            self.buffer[slot] = experience;
        }
    }

    /// Sample one experience uniformly
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Experience> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffer.get(rng.gen_range(0..self.buffer.len()))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get fill ratio (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.buffer.len() as f64 / self.capacity as f64
    }
}

/// Sliding mean over the last `size` values
#[derive(Debug, Clone)]
pub struct AverageWindow {
    values: VecDeque<f64>,
    size: usize,
    min_size: usize,
    sum: f64,
}

impl AverageWindow {
    pub fn new(size: usize, min_size: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(size),
            size,
            min_size,
            sum: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Mean of the window, or `None` until `min_size` values were seen
    pub fn average(&self) -> Option<f64> {
        if self.values.is_empty() || self.values.len() < self.min_size {
            return None;
        }
        Some(self.sum / self.values.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

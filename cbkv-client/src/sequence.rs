//! # Correlation Id Source
//!
//! Purpose: Hand out the 32-bit opaque values that pair responses with
//! requests on a shared connection.
//!
//! ## Design Principles
//! 1. **Atomic Increment**: A single `fetch_update` per call, so two
//!    concurrent callers can never observe the same value.
//! 2. **Injected, Not Global**: Factories hold an `Arc<SequenceGenerator>`;
//!    `SequenceGenerator::shared()` is only the process-wide default.
//! 3. **Wraparound**: After `u32::MAX` the counter restarts at its floor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Monotonic correlation id generator.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU32,
    floor: u32,
}

impl SequenceGenerator {
    /// Creates a generator starting at 1; 0 is left unused so a zeroed
    /// header is never mistaken for a live request.
    pub const fn new() -> Self {
        Self::with_floor(1)
    }

    /// Creates a generator that starts at, and wraps back to, `floor`.
    pub const fn with_floor(floor: u32) -> Self {
        SequenceGenerator {
            next: AtomicU32::new(floor),
            floor,
        }
    }

    /// Creates a generator whose first value is `start`, wrapping to `floor`.
    pub fn starting_at(start: u32, floor: u32) -> Self {
        SequenceGenerator {
            next: AtomicU32::new(start.max(floor)),
            floor,
        }
    }

    /// Process-wide default instance.
    pub fn shared() -> Arc<SequenceGenerator> {
        static SHARED: OnceLock<Arc<SequenceGenerator>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(SequenceGenerator::new())).clone()
    }

    /// Returns the next correlation id.
    pub fn next(&self) -> u32 {
        let floor = self.floor;
        // The closure always returns Some, so fetch_update cannot fail.
        match self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(if current == u32::MAX {
                    floor
                } else {
                    current + 1
                })
            }) {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_single_threaded_values_increase() {
        let seq = SequenceGenerator::new();
        let values: Vec<u32> = (0..100).map(|_| seq.next()).collect();
        assert_eq!(values[0], 1);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_concurrent_values_are_distinct() {
        let seq = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                thread::spawn(move || (0..1000).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate id {value}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_wraps_to_floor() {
        let seq = SequenceGenerator::starting_at(u32::MAX - 1, 5);
        assert_eq!(seq.next(), u32::MAX - 1);
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 5);
        assert_eq!(seq.next(), 6);
    }

    #[test]
    fn test_shared_instance_is_reused() {
        let a = SequenceGenerator::shared();
        let b = SequenceGenerator::shared();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

//! Encoder pulse accumulation and speed calculation.

use core::sync::atomic::{AtomicU32, Ordering};

/// Edge counter shared between the encoder interrupt and the control loop.
///
/// The interrupt only ever increments; the loop only ever reads through
/// [`PulseCounter::take`], which swaps the count for zero in one atomic step
/// so no edge is lost or counted twice.
pub struct PulseCounter {
    count: AtomicU32,
}

impl Default for PulseCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Called once per rising edge.
    #[inline]
    pub fn record_edge(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and clear.
    #[inline]
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

/// Revolutions per minute from `pulses` counted over `interval_ms`.
///
/// A zero interval (or a zero pulses-per-revolution setting) reads as 0 rpm.
pub fn rpm(pulses: u32, pulses_per_revolution: u16, interval_ms: u32) -> f32 {
    if interval_ms == 0 || pulses_per_revolution == 0 {
        return 0.0;
    }
    let revolutions = pulses as f32 / pulses_per_revolution as f32;
    revolutions / (interval_ms as f32 / 1000.0) * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_pulses_in_one_second_is_thirty_rpm() {
        assert_eq!(rpm(10, 20, 1000), 30.0);
    }

    #[test]
    fn half_second_window_scales_up() {
        assert_eq!(rpm(10, 20, 500), 60.0);
    }

    #[test]
    fn zero_interval_is_guarded() {
        assert_eq!(rpm(10, 20, 0), 0.0);
        assert_eq!(rpm(10, 0, 1000), 0.0);
        assert_eq!(rpm(0, 20, 4), 0.0);
    }

    #[test]
    fn take_clears_the_count() {
        let counter = PulseCounter::new();
        for _ in 0..5 {
            counter.record_edge();
        }
        assert_eq!(counter.take(), 5);
        assert_eq!(counter.take(), 0);
    }

    #[test]
    fn no_edges_lost_under_concurrent_producer() {
        const EDGES: u32 = 200_000;
        let counter = PulseCounter::new();
        let mut seen = 0;

        std::thread::scope(|s| {
            let producer = s.spawn(|| {
                for _ in 0..EDGES {
                    counter.record_edge();
                }
            });
            while !producer.is_finished() {
                seen += counter.take();
            }
        });

        seen += counter.take();
        assert_eq!(seen, EDGES);
    }
}

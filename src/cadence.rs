//! Cadence derivation
//!
//! Recordings sample irregularly, so replay waits for the original gap between
//! consecutive instants rather than a fixed period.

use std::time::Duration;

use tracing::warn;

use crate::types::Timestamp;

/// Compute the gaps between consecutive ascending timestamps.
///
/// Returns `timestamps.len() - 1` delays (none for zero or one timestamp).
/// A repeated timestamp yields a zero delay. A decreasing pair can only come
/// from unsorted input; it is clamped to zero and logged.
pub fn derive_delays(timestamps: &[Timestamp]) -> Vec<Duration> {
    timestamps
        .windows(2)
        .map(|pair| {
            let delta = pair[1].saturating_sub(pair[0]);
            if delta < 0 {
                warn!(from = pair[0], to = pair[1], "timestamps out of order, using zero delay");
                Duration::ZERO
            } else {
                Duration::from_secs(delta as u64)
            }
        })
        .collect()
}

/// Delay sequence aligned with a stream's group order
///
/// `delay_after(i)` is the wait between group `i` and group `i + 1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cadence {
    delays: Vec<Duration>,
}

impl Cadence {
    pub fn from_timestamps(timestamps: &[Timestamp]) -> Self {
        Self {
            delays: derive_delays(timestamps),
        }
    }

    /// Scale every delay by `1 / speed`.
    ///
    /// Non-positive or non-finite speeds leave the cadence unchanged. A scaled
    /// delay too large for `Duration` saturates at `Duration::MAX`.
    pub fn with_speed(mut self, speed: f64) -> Self {
        if speed.is_finite() && speed > 0.0 {
            for delay in &mut self.delays {
                *delay = Duration::try_from_secs_f64(delay.as_secs_f64() / speed)
                    .unwrap_or(Duration::MAX);
            }
        }
        self
    }

    pub fn delay_after(&self, index: usize) -> Option<Duration> {
        self.delays.get(index).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Sum of all delays
    pub fn total(&self) -> Duration {
        self.delays.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delays_for_short_input() {
        assert!(derive_delays(&[]).is_empty());
        assert!(derive_delays(&[42]).is_empty());
    }

    #[test]
    fn test_irregular_gaps_preserved() {
        let delays = derive_delays(&[100, 102, 103, 110]);
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(1),
                Duration::from_secs(7)
            ]
        );
    }

    #[test]
    fn test_delays_sum_to_span() {
        let timestamps = [1_691_042_400, 1_691_042_401, 1_691_042_405, 1_691_042_460, 1_691_043_000];
        let cadence = Cadence::from_timestamps(&timestamps);

        assert_eq!(cadence.len(), timestamps.len() - 1);
        assert_eq!(
            cadence.total(),
            Duration::from_secs((timestamps[4] - timestamps[0]) as u64)
        );
    }

    #[test]
    fn test_repeated_timestamp_is_zero_delay() {
        let delays = derive_delays(&[5, 5, 6]);
        assert_eq!(delays, vec![Duration::ZERO, Duration::from_secs(1)]);
    }

    #[test]
    fn test_out_of_order_clamped() {
        let delays = derive_delays(&[10, 4]);
        assert_eq!(delays, vec![Duration::ZERO]);
    }

    #[test]
    fn test_speed_scales_delays() {
        let cadence = Cadence::from_timestamps(&[0, 4, 4, 10]).with_speed(2.0);
        assert_eq!(
            cadence.delays(),
            &[
                Duration::from_secs(2),
                Duration::ZERO,
                Duration::from_secs(3)
            ]
        );

        let unchanged = Cadence::from_timestamps(&[0, 4]).with_speed(0.0);
        assert_eq!(unchanged.delay_after(0), Some(Duration::from_secs(4)));
        assert_eq!(unchanged.delay_after(1), None);
    }

    #[test]
    fn test_tiny_speed_saturates_instead_of_overflowing() {
        let cadence = Cadence::from_timestamps(&[0, 2, 2]).with_speed(1e-20);
        assert_eq!(cadence.delays(), &[Duration::MAX, Duration::ZERO]);
    }
}

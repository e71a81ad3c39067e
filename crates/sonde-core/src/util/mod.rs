//! Utility types and functions used throughout the Sonde framework.
//!
//! This module provides various helper types including:
//! - [`Size`] - Memory size representation
//! - Constants for cache and page geometry ([`CL_SIZE`], [`PAGE_SIZE`], etc.)
//! - Progress reporting utilities ([`NamedProgress`])

mod constants;
mod named_progress;
mod size;

pub use self::constants::*;
pub use self::named_progress::NamedProgress;
pub use self::size::Size;

use itertools::Itertools;

/// Returns the median of a set of latency samples.
///
/// Used by the timing classifier, which works on medians rather than means
/// so that single interrupt-length outliers do not shift the estimate.
pub fn median(samples: &[u64]) -> u64 {
    debug_assert!(!samples.is_empty());
    samples
        .iter()
        .copied()
        .sorted()
        .nth(samples.len() / 2)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::median;

    #[test]
    fn median_odd() {
        assert_eq!(median(&[5, 1, 9]), 5);
    }

    #[test]
    fn median_ignores_outlier() {
        assert_eq!(median(&[100, 102, 101, 99, 90_000]), 101);
    }
}

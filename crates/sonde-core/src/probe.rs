//! Shared probe-loop building blocks.
//!
//! Both probe styles are built from the same two operations: touch a run of
//! lines (prime) and time a single access (probe). The timed value is the
//! raw latency including the clock's own read cost; interpretation against
//! a threshold is the caller's business.

use serde::Serialize;
use thiserror::Error;

use crate::clock::SerializingClock;
use crate::session::SessionError;

/// Number of passes a prime walk makes over an eviction set.
///
/// One pass fills a true-LRU set; the second pass re-establishes the lines
/// under the pseudo replacement policies real parts ship.
pub(crate) const PRIME_PASSES: usize = 2;

/// Touches every line in order.
///
/// # Safety
///
/// All pointers must be valid for reads.
#[inline(always)]
pub(crate) unsafe fn touch(lines: &[*const u8]) {
    for &line in lines {
        unsafe {
            std::ptr::read_volatile(line);
        }
    }
}

/// Times a single access to `addr`.
///
/// # Safety
///
/// `addr` must be valid for reads.
#[inline(always)]
pub(crate) unsafe fn timed_read<C: SerializingClock>(clock: &C, addr: *const u8) -> u64 {
    let start = clock.now();
    unsafe {
        std::ptr::read_volatile(addr);
    }
    clock.now().wrapping_sub(start)
}

/// Narrows a cycle latency into a result-buffer cell.
#[inline(always)]
pub(crate) fn clamp_cycles(latency: u64) -> u32 {
    latency.min(u32::MAX as u64) as u32
}

/// Per-target hit/miss counts from a counting probe run.
///
/// A hit is a latency at or below the classification threshold (the line
/// was still resident), a miss is anything above it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    /// Samples at or below the threshold
    pub hits: u64,
    /// Samples above the threshold
    pub misses: u64,
}

impl Tally {
    /// Classifies one latency into this tally.
    pub fn count(&mut self, latency: u64, threshold: u64) {
        if latency <= threshold {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}

/// Errors that can occur when starting a probe call.
///
/// Once a probe call has started it always runs to completion; these are
/// all reported before the first row is written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// The caller-supplied output buffer does not match samples x monitored.
    #[error("output buffer holds {got} entries, need exactly {need} (samples x monitored targets)")]
    OutputSize {
        /// Required entry count
        need: usize,
        /// Supplied entry count
        got: usize,
    },
    /// The session is released.
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_classifies_against_threshold() {
        let mut tally = Tally::default();
        tally.count(100, 150);
        tally.count(150, 150);
        tally.count(151, 150);
        assert_eq!(tally, Tally { hits: 2, misses: 1 });
    }

    #[test]
    fn clamp_saturates() {
        assert_eq!(clamp_cycles(12), 12);
        assert_eq!(clamp_cycles(u64::MAX), u32::MAX);
    }
}

//! Serializing cycle counters.
//!
//! Every latency in this crate is measured with a [`SerializingClock`]: a
//! monotonic hardware cycle counter whose reads cannot be reordered with the
//! surrounding memory accesses. The trait also carries the one busy-wait
//! primitive the framework uses; probe slot delays must never go through a
//! scheduler-mediated sleep, since a context switch both adds unbounded
//! jitter and may itself evict the monitored sets.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{__rdtscp, _mm_lfence};

use thiserror::Error;

#[cfg(target_arch = "x86_64")]
use crate::util::TIMER_ROUNDS;

/// Errors that can occur when constructing a cycle counter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    /// No serializing cycle counter is available on this platform.
    #[error("no serializing cycle counter available on this platform")]
    UnsupportedPlatform,
}

/// A serializing, monotonic cycle counter.
///
/// Implementations must guarantee that a `now()` read acts as an ordering
/// point for surrounding loads, so that a `now() / access / now()` triple
/// times exactly the access in between.
pub trait SerializingClock {
    /// Constructs the clock, calibrating its own read overhead.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::UnsupportedPlatform`] if the hardware counter
    /// is unavailable.
    fn new() -> Result<Self, ClockError>
    where
        Self: Sized;

    /// Returns the current cycle count.
    fn now(&self) -> u64;

    /// Returns the calibrated cost of a single `now()` read, in cycles.
    ///
    /// Probe results are raw latencies; callers that want net access times
    /// subtract this themselves.
    fn overhead(&self) -> u64;

    /// Spins until the counter has advanced by at least `ticks` cycles.
    ///
    /// `ticks == 0` returns immediately.
    fn wait(&self, ticks: u64) {
        if ticks == 0 {
            return;
        }
        let start = self.now();
        while self.now().wrapping_sub(start) < ticks {
            std::hint::spin_loop();
        }
    }
}

/// Cycle counter based on the x86_64 `rdtscp` instruction.
///
/// `rdtscp` waits for all preceding loads to complete; the trailing `lfence`
/// keeps later loads from starting before the read. Construction measures
/// the back-to-back read cost over [`TIMER_ROUNDS`] rounds and records the
/// minimum as the overhead.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    overhead: u64,
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn rdtscp_serialized() -> u64 {
    unsafe {
        let mut aux = 0u32;
        let tsc = __rdtscp(&mut aux);
        _mm_lfence();
        tsc
    }
}

impl SerializingClock for TscClock {
    #[cfg(target_arch = "x86_64")]
    fn new() -> Result<Self, ClockError> {
        let mut overhead = u64::MAX;
        for _ in 0..TIMER_ROUNDS {
            let a = rdtscp_serialized();
            let b = rdtscp_serialized();
            overhead = overhead.min(b.wrapping_sub(a));
        }
        Ok(TscClock { overhead })
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn new() -> Result<Self, ClockError> {
        Err(ClockError::UnsupportedPlatform)
    }

    fn now(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            rdtscp_serialized()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            unreachable!("TscClock cannot be constructed on this platform")
        }
    }

    fn overhead(&self) -> u64 {
        self.overhead
    }
}

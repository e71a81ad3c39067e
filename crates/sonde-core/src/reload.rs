//! Flush+Reload measurement sessions.
//!
//! Unlike Prime+Probe, Flush+Reload needs no geometry and no buffer of its
//! own: it watches memory the measuring context already shares with the
//! victim (a mapped library page, typically). Each round flushes the
//! monitored line, gives the victim a window, and times the reload; a fast
//! reload means somebody else brought the line back meanwhile.

use log::debug;
use thiserror::Error;

use crate::clock::{ClockError, SerializingClock, TscClock};
use crate::flush::{ClflushLine, FlushError, LineFlush};
use crate::monitor::{MonitorError, MonitorRegistry};
use crate::probe::{ProbeError, Tally, clamp_cycles, timed_read};
use crate::session::{SessionError, SessionState};

/// Upper bound on monitored addresses per Flush+Reload session.
pub const MAX_MONITORED_ADDRESSES: usize = 4096;

/// Errors that can occur when preparing a Flush+Reload session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReloadError {
    /// No serializing cycle counter is available.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// No cache line flush capability is available.
    #[error(transparent)]
    Flush(#[from] FlushError),
}

/// A Flush+Reload session over caller-supplied shared addresses.
///
/// The session does not verify that a monitored address is actually shared
/// with a victim context; it measures, the caller interprets.
pub struct FlushReload<C = TscClock, F = ClflushLine>
where
    C: SerializingClock,
    F: LineFlush,
{
    registry: MonitorRegistry<*const u8>,
    clock: C,
    flush: F,
    settle_cycles: u64,
    state: SessionState,
}

impl FlushReload {
    /// Prepares a session with the platform clock and flush capabilities.
    ///
    /// # Errors
    ///
    /// Fails on platforms without a serializing counter or line flush.
    pub fn prepare() -> Result<Self, ReloadError> {
        Ok(Self::with_parts(TscClock::new()?, ClflushLine::new()?))
    }
}

impl<C: SerializingClock, F: LineFlush> FlushReload<C, F> {
    /// Prepares a session from explicit capability implementations.
    pub fn with_parts(clock: C, flush: F) -> Self {
        FlushReload {
            registry: MonitorRegistry::with_capacity(MAX_MONITORED_ADDRESSES),
            clock,
            flush,
            settle_cycles: 0,
            state: SessionState::Prepared,
        }
    }

    /// Sets the settle delay of [`probe_address`](Self::probe_address),
    /// in cycles.
    pub fn settle_cycles(mut self, cycles: u64) -> Self {
        self.settle_cycles = cycles;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Monitored addresses in registration order.
    pub fn monitored(&self) -> &[*const u8] {
        self.registry.targets()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Released => Err(SessionError::Released),
            _ => Ok(()),
        }
    }

    /// Adds an address to the monitored targets.
    ///
    /// # Safety
    ///
    /// `addr` must stay valid for reads until it is unmonitored or the
    /// session is released.
    ///
    /// # Errors
    ///
    /// Rejects duplicates and a full registry; the registry is unchanged on
    /// rejection.
    pub unsafe fn monitor(&mut self, addr: *const u8) -> Result<(), MonitorError> {
        self.ensure_live()?;
        self.registry.insert(addr)?;
        self.state = SessionState::Monitoring;
        debug!("monitoring address {:p}", addr);
        Ok(())
    }

    /// Removes an address from the monitored targets.
    ///
    /// # Errors
    ///
    /// Rejects addresses that are not monitored.
    pub fn unmonitor(&mut self, addr: *const u8) -> Result<(), MonitorError> {
        self.ensure_live()?;
        self.registry.remove(addr)?;
        if self.registry.is_empty() {
            self.state = SessionState::Prepared;
        }
        Ok(())
    }

    /// Clears the monitor registry.
    ///
    /// # Errors
    ///
    /// Rejects released sessions.
    pub fn unmonitor_all(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.registry.clear();
        self.state = SessionState::Prepared;
        Ok(())
    }

    /// The standalone Flush+Reload primitive: flush `addr`, wait the settle
    /// delay, reload it and return the raw latency.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads.
    pub unsafe fn probe_address(&self, addr: *const u8) -> u64 {
        unsafe {
            self.flush.flush(addr);
        }
        self.flush.fence();
        self.clock.wait(self.settle_cycles);
        unsafe { timed_read(&self.clock, addr) }
    }

    /// Times a reload of every monitored address and re-flushes each for
    /// the next round. Returns one row in registration order.
    ///
    /// # Errors
    ///
    /// Rejects released sessions.
    pub fn probe_once(&mut self) -> Result<Vec<u32>, ProbeError> {
        self.ensure_live()?;
        let mut row = vec![0u32; self.registry.len()];
        self.state = SessionState::Probing;
        self.sample_into(&mut row, 0);
        self.settle_state();
        Ok(row)
    }

    /// Runs `samples` reload rounds into a caller-owned buffer, row-major,
    /// with a `slot_cycles` busy-wait between rounds (the victim's window).
    ///
    /// # Errors
    ///
    /// [`ProbeError::OutputSize`] if `out` is not exactly
    /// `samples * monitored` entries; nothing is written in that case.
    pub fn repeated_probe(
        &mut self,
        samples: usize,
        out: &mut [u32],
        slot_cycles: u64,
    ) -> Result<(), ProbeError> {
        self.ensure_live()?;
        let monitored = self.registry.len();
        let need = samples * monitored;
        if out.len() != need {
            return Err(ProbeError::OutputSize {
                need,
                got: out.len(),
            });
        }
        self.state = SessionState::Probing;
        for row in out.chunks_exact_mut(monitored.max(1)) {
            self.sample_into(row, slot_cycles);
        }
        self.settle_state();
        Ok(())
    }

    /// Runs `samples` reload rounds, classifying latencies against
    /// `threshold` into per-address hit/miss tallies.
    ///
    /// # Errors
    ///
    /// Rejects released sessions.
    pub fn repeated_probe_count(
        &mut self,
        samples: usize,
        threshold: u64,
    ) -> Result<Vec<Tally>, ProbeError> {
        self.ensure_live()?;
        let monitored = self.registry.len();
        let mut tallies = vec![Tally::default(); monitored];
        let mut row = vec![0u32; monitored];
        self.state = SessionState::Probing;
        for _ in 0..samples {
            self.sample_into(&mut row, 0);
            for (tally, &cell) in tallies.iter_mut().zip(row.iter()) {
                tally.count(cell as u64, threshold);
            }
        }
        self.settle_state();
        Ok(tallies)
    }

    /// Makes the session terminal.
    ///
    /// # Errors
    ///
    /// [`SessionError::Released`] if the session was already released.
    pub fn release(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.registry.clear();
        self.state = SessionState::Released;
        Ok(())
    }

    fn settle_state(&mut self) {
        self.state = if self.registry.is_empty() {
            SessionState::Prepared
        } else {
            SessionState::Monitoring
        };
    }

    fn sample_into(&self, row: &mut [u32], slot_cycles: u64) {
        self.clock.wait(slot_cycles);
        for (cell, &addr) in row.iter_mut().zip(self.registry.targets()) {
            // Addresses were vouched for at monitor time.
            let latency = unsafe { timed_read(&self.clock, addr) };
            *cell = clamp_cycles(latency);
            unsafe {
                self.flush.flush(addr);
            }
        }
        self.flush.fence();
    }
}

//! Prime+Probe measurement sessions.
//!
//! A [`Session`] owns one probe buffer, the geometry discovered over it,
//! the eviction sets built from it, and the registry of monitored cache
//! sets. It is single-threaded by design: the prime/wait/probe sequence is
//! a latency-critical section, and nothing in here suspends or locks.

use indicatif::MultiProgress;
use log::{debug, info, warn};
use thiserror::Error;

use crate::allocator::ProbeBufferAllocator;
use crate::clock::{ClockError, SerializingClock, TscClock};
use crate::eviction::EvictionSets;
use crate::flush::{ClflushLine, FlushError, LineFlush};
use crate::geometry::{
    Geometry, GeometryError, GeometryRequest, MappingFunction, Prober, supports_quadratic,
};
use crate::memory::{BytePointer, Memory, PhysView, ResolveError, VirtToPhysResolver};
use crate::monitor::{MonitorError, MonitorRegistry};
use crate::probe::{PRIME_PASSES, ProbeError, Tally, clamp_cycles, timed_read, touch};
use crate::util::{PAGE_SIZE, SETS_PER_SLICE_DEFAULT, Size};

/// Default probe buffer size while geometry is still unknown.
const DISCOVERY_BUFFER: Size = Size::MB(32);

/// Lifecycle state of a measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Geometry and eviction sets are built, nothing is monitored.
    Prepared,
    /// At least one target is monitored.
    Monitoring,
    /// A probe call is running.
    Probing,
    /// Terminal: the buffer is freed, every operation is rejected.
    Released,
}

/// Errors raised by lifecycle violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The session was already released.
    #[error("session already released")]
    Released,
}

/// Errors that can occur during session preparation.
#[derive(Debug, Error)]
pub enum PrepareError<AE: std::error::Error> {
    /// No allocator was supplied to the builder.
    #[error("no probe buffer allocator specified")]
    NoAllocator,
    /// The probe buffer could not be allocated.
    #[error("probe buffer allocation failed: {0}")]
    Allocation(#[source] AE),
    /// Geometry discovery did not converge.
    #[error(transparent)]
    Discovery(#[from] GeometryError),
    /// The requested mapping cannot be served with the available
    /// page policy and resolver.
    #[error("unsupported mapping configuration: {0}")]
    UnsupportedMapping(&'static str),
    /// No serializing cycle counter is available.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// No cache line flush capability is available.
    #[error(transparent)]
    Flush(#[from] FlushError),
    /// Physical address resolution failed.
    #[error("virtual to physical resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

/// A Prime+Probe session over the last-level cache.
///
/// Created by [`Session::builder`]. All probe results are raw cycle
/// latencies in registration order of the monitored sets; a noisy sample is
/// a valid sample, classification is the caller's concern.
pub struct Session<C: SerializingClock = TscClock> {
    geometry: Geometry,
    memory: Option<Memory>,
    sets: EvictionSets,
    registry: MonitorRegistry<usize>,
    clock: C,
    threshold: Option<u64>,
    state: SessionState,
}

impl Session {
    /// Creates a builder for a new session.
    pub fn builder<AE: std::error::Error>() -> SessionBuilder<AE> {
        SessionBuilder::default()
    }
}

impl<C: SerializingClock> Session<C> {
    /// Total number of discovered cache sets.
    pub fn set_count(&self) -> usize {
        self.geometry.total_sets()
    }

    /// The geometry this session was prepared with.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The hit/miss latency threshold calibrated during discovery, if
    /// discovery ran (a fully preset geometry skips calibration).
    pub fn suggested_threshold(&self) -> Option<u64> {
        self.threshold
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Monitored set indices in registration order.
    pub fn monitored(&self) -> &[usize] {
        self.registry.targets()
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Released => Err(SessionError::Released),
            _ => Ok(()),
        }
    }

    /// Adds a cache set to the monitored targets.
    ///
    /// # Errors
    ///
    /// Rejects indices outside the geometry, sets without a usable eviction
    /// set, and duplicates; the registry is unchanged on rejection.
    pub fn monitor(&mut self, set: usize) -> Result<(), MonitorError> {
        self.ensure_live()?;
        let total = self.geometry.total_sets();
        if set >= total {
            return Err(MonitorError::OutOfRange { index: set, total });
        }
        if !self.sets.is_usable(set) {
            return Err(MonitorError::Unusable { index: set });
        }
        self.registry.insert(set)?;
        self.state = SessionState::Monitoring;
        Ok(())
    }

    /// Removes a cache set from the monitored targets.
    ///
    /// # Errors
    ///
    /// Rejects targets that are not monitored.
    pub fn unmonitor(&mut self, set: usize) -> Result<(), MonitorError> {
        self.ensure_live()?;
        self.registry.remove(set)?;
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

    /// Runs a single prime/probe round and returns its result row.
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

    /// Runs `samples` prime/wait/probe rounds into a caller-owned buffer.
    ///
    /// The buffer is filled row-major, one row per sample, one column per
    /// monitored set in registration order. `slot_cycles` is the busy-wait
    /// between prime and probe; zero probes immediately. Once this call
    /// starts writing it always produces every requested row.
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

    /// Runs `samples` rounds, classifying each latency against `threshold`
    /// inline and accumulating per-target hit/miss tallies.
    ///
    /// The memory-saving variant for long runs: no raw row is retained.
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

    /// Frees the probe buffer and makes the session terminal.
    ///
    /// # Errors
    ///
    /// [`SessionError::Released`] if the session was already released.
    pub fn release(&mut self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.registry.clear();
        if let Some(memory) = self.memory.take() {
            memory.dealloc();
        }
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

    /// One sample: prime every monitored set, wait the slot, time one
    /// representative line per set.
    fn sample_into(&self, row: &mut [u32], slot_cycles: u64) {
        for &set in self.registry.targets() {
            let Some(lines) = self.sets.lines(set) else {
                continue;
            };
            for _ in 0..PRIME_PASSES {
                // Lines are valid for the session lifetime; ensure_live
                // rules out a released buffer.
                unsafe { touch(lines) };
            }
        }
        self.clock.wait(slot_cycles);
        for (cell, &set) in row.iter_mut().zip(self.registry.targets()) {
            let Some(lines) = self.sets.lines(set) else {
                continue;
            };
            *cell = clamp_cycles(unsafe { timed_read(&self.clock, lines[0]) });
        }
    }
}

impl<C: SerializingClock> Drop for Session<C> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Builder assembling a [`Session`] from an allocator, optional capability
/// overrides, and a [`GeometryRequest`].
pub struct SessionBuilder<AE, C = TscClock, F = ClflushLine>
where
    AE: std::error::Error,
    C: SerializingClock,
    F: LineFlush,
{
    allocator: Option<Box<dyn ProbeBufferAllocator<Error = AE>>>,
    resolver: Option<Box<dyn VirtToPhysResolver>>,
    request: GeometryRequest,
    clock: Option<C>,
    flush: Option<F>,
    progress: Option<MultiProgress>,
}

impl<AE: std::error::Error> Default for SessionBuilder<AE> {
    fn default() -> Self {
        SessionBuilder {
            allocator: None,
            resolver: None,
            request: GeometryRequest::default(),
            clock: None,
            flush: None,
            progress: None,
        }
    }
}

impl<AE, C, F> SessionBuilder<AE, C, F>
where
    AE: std::error::Error,
    C: SerializingClock,
    F: LineFlush,
{
    /// Sets the probe buffer allocator.
    pub fn allocator<A: ProbeBufferAllocator<Error = AE> + 'static>(
        mut self,
        allocator: A,
    ) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Injects the virtual-to-physical resolver required by quadratic
    /// mappings and small-page buffers.
    pub fn resolver<R: VirtToPhysResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Replaces the whole geometry request.
    pub fn request(mut self, request: GeometryRequest) -> Self {
        self.request = request;
        self
    }

    /// Sets the address-to-set mapping function.
    pub fn mapping(mut self, mapping: MappingFunction) -> Self {
        self.request.mapping = mapping;
        self
    }

    /// Overrides the cycle counter (tests inject deterministic clocks).
    pub fn clock<C2: SerializingClock>(self, clock: C2) -> SessionBuilder<AE, C2, F> {
        SessionBuilder {
            allocator: self.allocator,
            resolver: self.resolver,
            request: self.request,
            clock: Some(clock),
            flush: self.flush,
            progress: self.progress,
        }
    }

    /// Overrides the line-flush capability.
    pub fn flush<F2: LineFlush>(self, flush: F2) -> SessionBuilder<AE, C, F2> {
        SessionBuilder {
            allocator: self.allocator,
            resolver: self.resolver,
            request: self.request,
            clock: self.clock,
            flush: Some(flush),
            progress: self.progress,
        }
    }

    /// Attaches a progress display for the discovery phase.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Allocates the buffer, discovers geometry, builds eviction sets, and
    /// returns the prepared session.
    ///
    /// # Errors
    ///
    /// See [`PrepareError`]; nothing is retained on failure.
    pub fn prepare(self) -> Result<Session<C>, PrepareError<AE>> {
        let mut allocator = self.allocator.ok_or(PrepareError::NoAllocator)?;
        let clock = match self.clock {
            Some(clock) => clock,
            None => C::new()?,
        };
        let request = self.request;
        let sets_per_slice = request.sets_per_slice.unwrap_or(SETS_PER_SLICE_DEFAULT);
        let frame = allocator.frame_size().bytes();

        let explicit_size = request.buffer_size.is_some();
        let initial = request
            .buffer_size
            .unwrap_or(DISCOVERY_BUFFER)
            .round_up(frame);
        let mut memory = allocator.alloc(initial).map_err(PrepareError::Allocation)?;
        info!(
            "allocated {} byte probe buffer ({} byte frames)",
            memory.len(),
            frame
        );

        let measured: Result<(usize, usize, Option<u64>), PrepareError<AE>> =
            match (request.associativity, request.slices) {
                (Some(ways), Some(slices)) => Ok((ways, slices, None)),
                (preset_ways, preset_slices) => match self.flush.map(Ok).unwrap_or_else(F::new) {
                    Ok(flush) => {
                        let prober = Prober {
                            memory: &memory,
                            clock: &clock,
                            flush: &flush,
                            sets_per_slice,
                            progress: self.progress.as_ref(),
                        };
                        prober
                            .discover(preset_ways, preset_slices)
                            .map(|found| (found.associativity, found.slices, Some(found.threshold)))
                            .map_err(PrepareError::from)
                    }
                    Err(e) => Err(PrepareError::from(e)),
                },
            };
        let (associativity, slices, threshold) = match measured {
            Ok(measured) => measured,
            Err(e) => {
                memory.dealloc();
                return Err(e);
            }
        };

        let mut geometry = Geometry {
            associativity,
            slices,
            sets_per_slice,
            mapping: request.mapping,
            buffer_size: memory.len(),
        };
        info!(
            "cache geometry: {} slices x {} sets, {}-way, {} total sets",
            geometry.slices,
            geometry.sets_per_slice,
            geometry.associativity,
            geometry.total_sets()
        );

        // A default-sized buffer grows until every set can be populated; an
        // explicitly requested size is final and undersized sets are only
        // flagged.
        let required = Size::B(geometry.required_buffer()).round_up(frame);
        if !explicit_size && memory.len() < required.bytes() {
            debug!("growing probe buffer to {}", required);
            match allocator.alloc(required) {
                Ok(grown) => {
                    std::mem::replace(&mut memory, grown).dealloc();
                    geometry.buffer_size = memory.len();
                }
                Err(e) => {
                    memory.dealloc();
                    return Err(PrepareError::Allocation(e));
                }
            }
        }

        let mut resolver = self.resolver;
        let view = match Self::build_view(&geometry, &memory, frame, resolver.as_deref_mut()) {
            Ok(view) => view,
            Err(e) => {
                memory.dealloc();
                return Err(e);
            }
        };

        let sets = EvictionSets::build(&geometry, &memory, &view);
        if sets.usable_count() == 0 {
            warn!("no cache set received a usable eviction set; nothing will be monitorable");
        }

        let total = geometry.total_sets();
        Ok(Session {
            geometry,
            memory: Some(memory),
            sets,
            registry: MonitorRegistry::with_capacity(total),
            clock,
            threshold,
            state: SessionState::Prepared,
        })
    }

    /// Decides how physical addresses are obtained for set placement.
    fn build_view(
        geometry: &Geometry,
        memory: &Memory,
        frame: usize,
        resolver: Option<&mut (dyn VirtToPhysResolver + 'static)>,
    ) -> Result<PhysView, PrepareError<AE>> {
        match geometry.mapping {
            MappingFunction::Quadratic => {
                if !supports_quadratic(geometry.slices) {
                    return Err(PrepareError::UnsupportedMapping(
                        "slice count outside the quadratic hash family",
                    ));
                }
                // The hash reads address bits above any frame size, so
                // frame-relative knowledge is never enough here.
                match resolver {
                    Some(resolver) => Ok(PhysView::resolve(memory, PAGE_SIZE, resolver)?),
                    None => Err(PrepareError::UnsupportedMapping(
                        "quadratic mapping requires a virtual-to-physical resolver",
                    )),
                }
            }
            MappingFunction::Linear => {
                if geometry.span_bits() <= frame.trailing_zeros() {
                    Ok(PhysView::Aligned { frame_size: frame })
                } else {
                    match resolver {
                        Some(resolver) => Ok(PhysView::resolve(memory, PAGE_SIZE, resolver)?),
                        None => Err(PrepareError::UnsupportedMapping(
                            "set span exceeds the physically contiguous frame and no resolver is available",
                        )),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockError;
    use std::cell::Cell;

    struct StepClock {
        ticks: Cell<u64>,
    }

    impl SerializingClock for StepClock {
        fn new() -> Result<Self, ClockError> {
            Ok(StepClock {
                ticks: Cell::new(0),
            })
        }
        fn now(&self) -> u64 {
            let t = self.ticks.get();
            self.ticks.set(t + 10);
            t
        }
        fn overhead(&self) -> u64 {
            0
        }
    }

    struct TestAllocator;

    impl ProbeBufferAllocator for TestAllocator {
        type Error = std::io::Error;
        fn frame_size(&self) -> Size {
            Size::B(4096)
        }
        fn alloc(&mut self, size: Size) -> Result<Memory, Self::Error> {
            Memory::mmap(size.bytes())
        }
    }

    fn preset_session() -> Session<StepClock> {
        let request = GeometryRequest {
            associativity: Some(2),
            slices: Some(2),
            sets_per_slice: Some(16),
            buffer_size: Some(Size::KB(64)),
            ..GeometryRequest::default()
        };
        Session::builder()
            .allocator(TestAllocator)
            .clock(StepClock::new().unwrap())
            .request(request)
            .prepare()
            .expect("prepare failed")
    }

    #[test]
    fn set_count_matches_geometry_invariant() {
        let session = preset_session();
        assert_eq!(session.set_count(), 2 * 16);
        assert_eq!(
            session.set_count(),
            session.geometry().slices * session.geometry().sets_per_slice
        );
    }

    #[test]
    fn monitor_rejects_out_of_range_and_duplicates() {
        let mut session = preset_session();
        let total = session.set_count();
        assert_eq!(
            session.monitor(total),
            Err(MonitorError::OutOfRange {
                index: total,
                total
            })
        );
        session.monitor(5).unwrap();
        assert_eq!(session.monitor(5), Err(MonitorError::Duplicate));
        assert_eq!(session.monitored(), &[5]);
    }

    #[test]
    fn repeated_probe_fills_exactly_samples_times_monitored() {
        let mut session = preset_session();
        session.monitor(1).unwrap();
        session.monitor(9).unwrap();
        let mut out = vec![0u32; 10 * 2];
        session.repeated_probe(10, &mut out, 0).unwrap();
        // The mock clock steps on every read, so every cell was written.
        assert!(out.iter().all(|&cell| cell > 0));
    }

    #[test]
    fn repeated_probe_rejects_mismatched_buffer_without_writing() {
        let mut session = preset_session();
        session.monitor(1).unwrap();
        let mut out = vec![0u32; 7];
        assert_eq!(
            session.repeated_probe(4, &mut out, 0),
            Err(ProbeError::OutputSize { need: 4, got: 7 })
        );
        assert!(out.iter().all(|&cell| cell == 0));
    }

    #[test]
    fn repeated_probe_count_tallies_every_sample() {
        let mut session = preset_session();
        session.monitor(0).unwrap();
        session.monitor(2).unwrap();
        let tallies = session.repeated_probe_count(25, u64::MAX).unwrap();
        assert_eq!(tallies.len(), 2);
        for tally in tallies {
            assert_eq!(tally.hits + tally.misses, 25);
        }
    }

    #[test]
    fn state_machine_walks_prepare_monitor_probe_release() {
        let mut session = preset_session();
        assert_eq!(session.state(), SessionState::Prepared);
        session.monitor(3).unwrap();
        assert_eq!(session.state(), SessionState::Monitoring);
        session.probe_once().unwrap();
        assert_eq!(session.state(), SessionState::Monitoring);
        session.unmonitor_all().unwrap();
        assert_eq!(session.state(), SessionState::Prepared);
        session.release().unwrap();
        assert_eq!(session.state(), SessionState::Released);
    }

    #[test]
    fn release_twice_is_rejected() {
        let mut session = preset_session();
        session.release().unwrap();
        assert_eq!(session.release(), Err(SessionError::Released));
        assert_eq!(
            session.probe_once(),
            Err(ProbeError::Session(SessionError::Released))
        );
        assert_eq!(
            session.monitor(0),
            Err(MonitorError::Session(SessionError::Released))
        );
    }

    #[test]
    fn quadratic_without_resolver_is_unsupported() {
        let request = GeometryRequest {
            mapping: MappingFunction::Quadratic,
            associativity: Some(2),
            slices: Some(2),
            sets_per_slice: Some(16),
            buffer_size: Some(Size::KB(64)),
            ..GeometryRequest::default()
        };
        let result = Session::builder()
            .allocator(TestAllocator)
            .clock(StepClock::new().unwrap())
            .request(request)
            .prepare();
        assert!(matches!(result, Err(PrepareError::UnsupportedMapping(_))));
    }

    #[test]
    fn missing_allocator_is_reported() {
        let result = Session::builder::<std::io::Error>()
            .clock(StepClock::new().unwrap())
            .prepare();
        assert!(matches!(result, Err(PrepareError::NoAllocator)));
    }

    #[test]
    fn monitored_lines_stay_inside_the_buffer() {
        let mut session = preset_session();
        session.monitor(7).unwrap();
        let memory = session.memory.as_ref().unwrap();
        let base = memory.ptr() as usize;
        let end = base + memory.len();
        let lines = session.sets.lines(7).unwrap();
        for &line in lines {
            assert!((line as usize) >= base && (line as usize) < end);
        }
    }
}

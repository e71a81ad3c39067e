use std::cell::Cell;

use sonde::clock::{ClockError, SerializingClock};
use sonde::flush::{FlushError, LineFlush};
use sonde::memory::{PhysAddr, ResolveError, VirtToPhysResolver};
use sonde::util::Size;
use sonde::{
    FlushReload, GeometryRequest, MonitorError, ProbeError, Session, SessionError, SessionState,
};
use sonde_mmap::MmapAllocator;

/// Deterministic clock advancing by a fixed step per read.
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
        self.ticks.set(t + 16);
        t
    }
    fn overhead(&self) -> u64 {
        0
    }
}

struct NoFlush;

impl LineFlush for NoFlush {
    fn new() -> Result<Self, FlushError> {
        Ok(NoFlush)
    }
    unsafe fn flush(&self, _addr: *const u8) {}
    fn fence(&self) {}
}

/// Pretends virtual addresses are physical; keeps set placement exercisable
/// without pagemap privileges.
struct IdentityResolver;

impl VirtToPhysResolver for IdentityResolver {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, ResolveError> {
        Ok(PhysAddr::new(virt as usize))
    }
}

fn mock_session(request: GeometryRequest) -> Session<StepClock> {
    Session::builder()
        .allocator(MmapAllocator::default())
        .clock(StepClock::new().unwrap())
        .flush(NoFlush)
        .resolver(IdentityResolver)
        .request(request)
        .prepare()
        .expect("prepare failed")
}

fn small_request() -> GeometryRequest {
    GeometryRequest {
        associativity: Some(2),
        slices: Some(2),
        sets_per_slice: Some(16),
        buffer_size: Some(Size::KB(64)),
        ..GeometryRequest::default()
    }
}

#[test]
fn set_count_matches_discovered_geometry() {
    let session = mock_session(small_request());
    assert_eq!(
        session.set_count(),
        session.geometry().slices * session.geometry().sets_per_slice
    );
}

#[test]
fn monitor_rejects_out_of_universe_targets() {
    let mut session = mock_session(small_request());
    let total = session.set_count();
    assert_eq!(
        session.monitor(total + 5),
        Err(MonitorError::OutOfRange {
            index: total + 5,
            total
        })
    );
    assert!(session.monitored().is_empty());
}

#[test]
fn repeated_probe_writes_exactly_samples_times_monitored() {
    let mut session = mock_session(small_request());
    session.monitor(3).unwrap();
    session.monitor(11).unwrap();
    session.monitor(19).unwrap();

    for slot in [0u64, 100] {
        let mut out = vec![0u32; 40 * 3];
        session.repeated_probe(40, &mut out, slot).unwrap();
        assert!(out.iter().all(|&cell| cell > 0));
    }

    let mut wrong = vec![0u32; 40 * 3 + 1];
    assert_eq!(
        session.repeated_probe(40, &mut wrong, 0),
        Err(ProbeError::OutputSize { need: 120, got: 121 })
    );
    assert!(wrong.iter().all(|&cell| cell == 0));
}

#[test]
fn reference_capture_scenario_shape() -> anyhow::Result<()> {
    // 8 slices x 2048 sets, monitored at 17, 81, 145, ... (step 64).
    const SAMPLES: usize = 1000;
    let request = GeometryRequest {
        associativity: Some(4),
        slices: Some(8),
        sets_per_slice: Some(2048),
        buffer_size: Some(Size::MB(8)),
        ..GeometryRequest::default()
    };
    let mut session = mock_session(request);
    let total = session.set_count();
    assert_eq!(total, 8 * 2048);

    for set in (17..total).step_by(64) {
        session.monitor(set)?;
    }
    let monitored = session.monitored().len();
    assert_eq!(monitored, total / 64);

    let mut res = vec![0u32; SAMPLES * monitored];
    session.repeated_probe(SAMPLES, &mut res, 0)?;
    assert_eq!(res.chunks(monitored).count(), SAMPLES);
    assert!(res.iter().all(|&cell| cell > 0));

    session.release()?;
    Ok(())
}

#[test]
fn repeated_probe_count_tallies_sum_to_samples() {
    let mut session = mock_session(small_request());
    session.monitor(1).unwrap();
    session.monitor(2).unwrap();
    let tallies = session.repeated_probe_count(64, 1_000_000).unwrap();
    assert_eq!(tallies.len(), 2);
    for tally in tallies {
        assert_eq!(tally.hits + tally.misses, 64);
    }
}

#[test]
fn release_is_terminal_exactly_once() {
    let mut session = mock_session(small_request());
    session.monitor(0).unwrap();
    assert_eq!(session.state(), SessionState::Monitoring);

    session.release().unwrap();
    assert_eq!(session.state(), SessionState::Released);
    assert_eq!(session.release(), Err(SessionError::Released));
    assert_eq!(
        session.monitor(1),
        Err(MonitorError::Session(SessionError::Released))
    );
    assert_eq!(
        session.probe_once(),
        Err(ProbeError::Session(SessionError::Released))
    );
}

#[test]
fn flush_reload_session_over_mock_capabilities() {
    let mut fr = FlushReload::with_parts(StepClock::new().unwrap(), NoFlush);
    let lines = [[0u8; 64]; 3];
    unsafe {
        for line in &lines {
            fr.monitor(line.as_ptr()).unwrap();
        }
        assert_eq!(
            fr.monitor(lines[0].as_ptr()),
            Err(MonitorError::Duplicate)
        );
    }
    assert_eq!(fr.monitored().len(), 3);

    let mut out = vec![0u32; 5 * 3];
    fr.repeated_probe(5, &mut out, 0).unwrap();
    assert!(out.iter().all(|&cell| cell > 0));

    fr.release().unwrap();
    assert_eq!(fr.release(), Err(SessionError::Released));
}

// Hardware-dependent checks: real cycle counter and flush instruction,
// latency ordering rather than fixed constants. Run with
// `cargo test -- --ignored` on an idle x86_64 machine.
#[cfg(target_arch = "x86_64")]
mod hardware {
    use sonde::clock::{SerializingClock, TscClock};
    use sonde::flush::{ClflushLine, LineFlush};
    use sonde::util::median;
    use sonde::{FlushReload, GeometryRequest, prepare};

    const ROUNDS: usize = 1000;

    #[test]
    #[ignore] // needs quiet hardware
    fn flush_reload_untouched_is_slower_than_touched() -> anyhow::Result<()> {
        let _ = env_logger::try_init();
        let clock = TscClock::new()?;
        let fr = FlushReload::with_parts(TscClock::new()?, ClflushLine::new()?);
        let line = Box::new([1u8; 64]);
        let addr = line.as_ptr();

        let mut untouched = Vec::with_capacity(ROUNDS);
        let mut touched = Vec::with_capacity(ROUNDS);
        for _ in 0..ROUNDS {
            // Nobody reloads the line between flush and reload.
            untouched.push(unsafe { fr.probe_address(addr) });
            // A "victim" reloads it right before the timed access.
            unsafe { std::ptr::read_volatile(addr) };
            let start = clock.now();
            unsafe { std::ptr::read_volatile(addr) };
            touched.push(clock.now().wrapping_sub(start));
        }
        assert!(median(&untouched) > median(&touched));
        Ok(())
    }

    #[test]
    #[ignore] // needs quiet hardware and usually hugepages/root
    fn primed_sets_probe_below_threshold() -> anyhow::Result<()> {
        let _ = env_logger::try_init();
        let mut session = prepare(GeometryRequest::default())?;
        let threshold = session
            .suggested_threshold()
            .expect("discovery calibrates a threshold");
        session.monitor(17)?;

        let mut out = vec![0u32; ROUNDS];
        session.repeated_probe(ROUNDS, &mut out, 0)?;
        let samples: Vec<u64> = out.iter().map(|&cell| cell as u64).collect();
        // Back-to-back prime and probe on an idle machine: the median
        // sample sees its set still resident.
        assert!(median(&samples) <= threshold);
        session.release()?;
        Ok(())
    }
}

//! Prime+Probe capture over a strided selection of cache sets.
//!
//! Monitors one cache set out of every `step` (spread across slices),
//! collects a row of probe latencies per sample, and prints the matrix.
//! Low values mean the set stayed resident (no contention), high values
//! mean another context touched a congruent address during the slot.

use clap::Parser;
use log::{info, warn};
use sonde::clock::{SerializingClock, TscClock};
use sonde::{GeometryRequest, MonitorError, prepare};
use sonde_bin::init_logging_with_progress;

#[derive(Parser)]
#[command(about = "Last-level-cache Prime+Probe capture")]
struct Args {
    /// Number of probe rounds to collect
    #[arg(long, default_value_t = 1000)]
    samples: usize,
    /// First monitored cache set
    #[arg(long, default_value_t = 17)]
    start: usize,
    /// Stride between monitored cache sets
    #[arg(long, default_value_t = 64)]
    step: usize,
    /// Busy-wait between prime and probe, in cycles (0 = probe immediately)
    #[arg(long, default_value_t = 0)]
    slot: u64,
    /// Settling delay before the capture starts, in cycles
    #[arg(long, default_value_t = 3_000_000_000)]
    settle: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging_with_progress()?;

    // Let the system quiet down before the first timed access.
    let clock = TscClock::new()?;
    clock.wait(args.settle);

    let mut session = prepare(GeometryRequest::default())?;
    let nsets = session.set_count();
    info!("prepared session over {} cache sets", nsets);

    for set in (args.start..nsets).step_by(args.step) {
        match session.monitor(set) {
            Ok(()) => {}
            Err(MonitorError::Unusable { index }) => warn!("skipping unusable cache set {}", index),
            Err(e) => return Err(e.into()),
        }
    }
    let monitored = session.monitored().len();
    anyhow::ensure!(monitored > 0, "no cache sets could be monitored");
    info!("monitoring {} cache sets", monitored);

    let mut res = vec![0u32; args.samples * monitored];
    session.repeated_probe(args.samples, &mut res, args.slot)?;

    println!("// --- L3 Prime+Probe timing data --- //");
    println!("// One row per probe round, one column per monitored cache set.");
    if let Some(threshold) = session.suggested_threshold() {
        println!("// Values above ~{} cycles indicate contention.", threshold);
    }
    for (sample, row) in res.chunks(monitored).enumerate() {
        print!("Sample {:<4}: ", sample);
        for latency in row {
            print!("{:4} ", latency);
        }
        println!();
    }

    session.release()?;
    Ok(())
}

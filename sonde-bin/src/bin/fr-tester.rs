//! Flush+Reload smoke test against an in-process victim line.
//!
//! Monitors one memory line, touches it the way a victim would, and prints
//! HIT or MISS per probe round against the given threshold. Runs until
//! interrupted.

use clap::Parser;
use sonde::FlushReload;
use sonde::clock::{SerializingClock, TscClock};
use sonde_bin::init_logging_with_progress;

#[derive(Parser)]
#[command(about = "Flush+Reload probe tester")]
struct Args {
    /// Latency threshold separating HIT from MISS, in cycles
    threshold: u64,
    /// Busy-wait between probe rounds, in cycles
    #[arg(long, default_value_t = 5_000_000)]
    delay: u64,
    /// Skip the victim access every other round instead of touching it
    #[arg(long)]
    alternate: bool,
}

static VICTIM_LINE: [u8; 64] = [0x2a; 64];

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging_with_progress()?;
    println!("Using threshold: {}", args.threshold);

    let clock = TscClock::new()?;
    let mut fr = FlushReload::prepare()?;
    let victim = VICTIM_LINE.as_ptr();
    // The line lives for the whole program.
    unsafe { fr.monitor(victim)? };
    println!("Monitoring victim line at address: {:p}", victim);

    println!();
    println!("Starting probe loop. Press Ctrl+C to stop.");
    println!("-----------------------------------------");

    let mut round = 0u64;
    loop {
        // Give the attacker something to detect.
        if !args.alternate || round % 2 == 0 {
            unsafe { std::ptr::read_volatile(victim) };
        }

        let row = fr.probe_once()?;
        if row[0] as u64 <= args.threshold {
            println!("HIT!  Probe time: {:4} (cache hit)", row[0]);
        } else {
            println!("MISS! Probe time: {:4} (cache miss)", row[0]);
        }

        clock.wait(args.delay);
        round += 1;
    }
}

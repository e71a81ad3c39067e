//! Geometry scan across mapping and page-policy combinations.
//!
//! Prepares a session under each supported configuration, reporting how
//! long discovery took and how many cache sets it found. Configurations
//! that cannot be served on this machine (no hugetlb pool, no pagemap
//! access) report their failure and the scan moves on.

use clap::Parser;
use sonde::clock::{SerializingClock, TscClock};
use sonde::{GeometryRequest, MappingFunction, PagePolicy, prepare};
use sonde_bin::init_logging_with_progress;

#[derive(Parser)]
#[command(about = "Last-level-cache geometry scan")]
struct Args {
    /// Number of scan passes over all configurations
    #[arg(long, default_value_t = 1)]
    rounds: usize,
    /// Print the discovered geometry as JSON
    #[arg(long)]
    json: bool,
    /// Settling delay before the scan starts, in cycles
    #[arg(long, default_value_t = 3_000_000_000)]
    settle: u64,
}

const CONFIGS: &[(&str, MappingFunction, PagePolicy)] = &[
    ("Default", MappingFunction::Linear, PagePolicy::PreferHuge),
    ("Quadratic", MappingFunction::Quadratic, PagePolicy::PreferHuge),
    ("Linear", MappingFunction::Linear, PagePolicy::RequireHuge),
    ("Small pages", MappingFunction::Linear, PagePolicy::SmallOnly),
    (
        "Small pages, Quad.",
        MappingFunction::Quadratic,
        PagePolicy::SmallOnly,
    ),
];

fn humanize(cycles: u64) -> (u64, char) {
    let mut value = cycles;
    let mut suffix = ' ';
    for next in ['K', 'M', 'G', 'T'] {
        if value <= 2000 {
            break;
        }
        value /= 1000;
        suffix = next;
    }
    (value, suffix)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging_with_progress()?;

    let clock = TscClock::new()?;
    clock.wait(args.settle);

    for _ in 0..args.rounds {
        for &(name, mapping, pages) in CONFIGS {
            let request = GeometryRequest {
                mapping,
                pages,
                ..GeometryRequest::default()
            };
            let started = clock.now();
            let result = prepare(request);
            let elapsed = clock.now().wrapping_sub(started);
            let (value, suffix) = humanize(elapsed);

            println!("// --- L3 cache scan: {} --- //", name);
            match result {
                Ok(mut session) => {
                    println!("// Time taken: {:5}{} cycles", value, suffix);
                    println!("// Total cache sets found: {:5}", session.set_count());
                    if args.json {
                        println!("{}", serde_json::to_string(session.geometry())?);
                    }
                    session.release()?;
                }
                Err(e) => {
                    println!("// Preparation failed: {}", e);
                }
            }
        }
    }
    Ok(())
}

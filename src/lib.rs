//! # Sonde
//!
//! Sonde is a modular framework for cache-timing side-channel measurements.
//! It detects, at cache-line or cache-set granularity, whether memory was
//! recently accessed by another execution context, using Prime+Probe over
//! the last-level cache and Flush+Reload over shared memory.
//!
//! ## Quickstart
//!
//! ```no_run
//! use sonde::{GeometryRequest, prepare};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = prepare(GeometryRequest::default())?;
//! let nsets = session.set_count();
//! for set in (17..nsets).step_by(64) {
//!     session.monitor(set)?;
//! }
//! let monitored = session.monitored().len();
//! let mut res = vec![0u32; 1000 * monitored];
//! session.repeated_probe(1000, &mut res, 0)?;
//! session.release()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! - `sonde-core`: the measurement engine (re-exported here).
//! - `sonde-hugepage` (feature `hugepage`): hugetlb probe buffers.
//! - `sonde-mmap` (feature `mmap`): small-page fallback buffers.
//! - `sonde-bin`: demo attack and scan binaries.

pub use sonde_core::*;

#[cfg(feature = "hugepage")]
pub use sonde_hugepage as hugepage;
#[cfg(feature = "mmap")]
pub use sonde_mmap as mmap;

#[cfg(all(feature = "hugepage", feature = "mmap"))]
use log::{debug, warn};

/// Prepares a Prime+Probe session, picking the buffer allocator from the
/// request's page policy.
///
/// A pagemap resolver is attached when `/proc/self/pagemap` is readable,
/// which small-page buffers and quadratic mappings need.
///
/// # Errors
///
/// [`PrepareError::UnsupportedMapping`] when huge pages are required but
/// unavailable, plus every failure mode of
/// [`SessionBuilder::prepare`](sonde_core::SessionBuilder::prepare).
#[cfg(all(feature = "hugepage", feature = "mmap"))]
pub fn prepare(request: GeometryRequest) -> Result<Session, PrepareError<std::io::Error>> {
    use sonde_core::memory::LinuxPageMap;

    let builder = || {
        let builder = Session::builder().request(request);
        match LinuxPageMap::new() {
            Ok(resolver) => builder.resolver(resolver),
            Err(e) => {
                debug!("pagemap resolver unavailable: {}", e);
                builder
            }
        }
    };

    match request.pages {
        PagePolicy::SmallOnly => builder()
            .allocator(sonde_mmap::MmapAllocator::default())
            .prepare(),
        PagePolicy::RequireHuge => builder()
            .allocator(sonde_hugepage::HugepageAllocator::default())
            .prepare()
            .map_err(|e| match e {
                PrepareError::Allocation(_) => PrepareError::UnsupportedMapping(
                    "huge pages unavailable and fallback to small pages not permitted",
                ),
                e => e,
            }),
        PagePolicy::PreferHuge => {
            match builder()
                .allocator(sonde_hugepage::HugepageAllocator::default())
                .prepare()
            {
                Ok(session) => Ok(session),
                Err(PrepareError::Allocation(e)) => {
                    warn!("hugepage allocation failed ({}), falling back to small pages", e);
                    builder()
                        .allocator(sonde_mmap::MmapAllocator::default())
                        .prepare()
                }
                Err(e) => Err(e),
            }
        }
    }
}

//! # Sonde Core
//!
//! `sonde-core` is the foundational library for the Sonde cache-timing
//! side-channel measurement framework. It measures, at cache-line or
//! cache-set granularity, whether a piece of memory was recently touched by
//! another execution context, by timing accesses through the shared
//! last-level cache.
//!
//! ## Architecture Overview
//!
//! The engine is built around a small set of capability traits so that the
//! hardware-specific pieces stay replaceable:
//!
//! - [`clock::SerializingClock`] - Serializing, monotonic cycle counter used
//!   for every latency measurement and for deterministic busy-wait delays.
//!
//! - [`flush::LineFlush`] - Per-line cache flush used by Flush+Reload and by
//!   the discovery-phase latency calibration.
//!
//! - [`allocator::ProbeBufferAllocator`] - Strategies for obtaining the
//!   large probe buffer (hugepages, plain mmap) together with the physical
//!   contiguity they guarantee.
//!
//! - [`memory::VirtToPhysResolver`] - Injected OS capability translating
//!   virtual to physical addresses where the mapping function needs more
//!   address bits than the buffer frames provide.
//!
//! ## Main Components
//!
//! - [`Session`] - A Prime+Probe session: geometry discovery, eviction set
//!   construction, monitor registry, and the prime/wait/probe timing loop.
//!
//! - [`FlushReload`] - A Flush+Reload session over caller-supplied shared
//!   addresses.
//!
//! - [`geometry`] module - Cache geometry discovery from noisy timing
//!   measurements, plus the linear and quadratic address-to-set mappings.
//!
//! - [`eviction`] module - Arena-backed per-set eviction sets.
//!
//! ## Platform Support
//!
//! Timing and flushing are implemented for x86_64; on other architectures
//! preparation fails with an unsupported-platform error. Small-page buffers
//! and quadratic mappings need `/proc/self/pagemap` access (root).

#![warn(missing_docs)]

pub mod allocator;
pub mod clock;
pub mod eviction;
pub mod flush;
pub mod geometry;
pub mod memory;
pub mod monitor;
mod probe;
mod reload;
mod session;
pub mod util;

pub use crate::geometry::{Geometry, GeometryRequest, MappingFunction, PagePolicy};
pub use crate::monitor::MonitorError;
pub use crate::probe::{ProbeError, Tally};
pub use crate::reload::{FlushReload, MAX_MONITORED_ADDRESSES, ReloadError};
pub use crate::session::{PrepareError, Session, SessionBuilder, SessionError, SessionState};

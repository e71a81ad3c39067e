//! Last-level-cache geometry discovery.
//!
//! A session needs to know how the processor splits its shared cache into
//! slices and sets before it can build eviction sets. Some of that geometry
//! is stable enough to take as configuration (sets per slice), the rest is
//! measured: a noise-adaptive latency threshold separates cached from
//! evicted accesses, a growing group of set-congruent lines locates the
//! point where self-eviction begins, and a greedy reduction of that group
//! yields the associativity. The slice count follows from the ratio.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, warn};
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;

use crate::clock::SerializingClock;
use crate::flush::LineFlush;
use crate::memory::{BytePointer, Memory};
use crate::probe::{PRIME_PASSES, timed_read, touch};
use crate::util::{CL_SHIFT, CL_SIZE, NamedProgress, Size, median};

/// How a physical address selects a cache set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MappingFunction {
    /// Set and slice index taken directly from physical address bits.
    Linear,
    /// Slice index from an XOR-parity hash of high physical address bits,
    /// set index from the low bits. Used by processors that hash addresses
    /// across slices.
    Quadratic,
}

/// Which page granularity backs the probe buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PagePolicy {
    /// Huge pages when available, small pages otherwise.
    PreferHuge,
    /// Huge pages or fail.
    RequireHuge,
    /// Small pages only; requires a virtual-to-physical resolver.
    SmallOnly,
}

/// Geometry hints and policy for [`prepare`](crate::SessionBuilder::prepare).
///
/// Every preset field skips the corresponding discovery step; a fully
/// preset request performs no timing at all.
#[derive(Clone, Copy, Debug)]
pub struct GeometryRequest {
    /// Requested address-to-set mapping function
    pub mapping: MappingFunction,
    /// Requested page granularity policy
    pub pages: PagePolicy,
    /// Preset associativity (skips conflict-group reduction)
    pub associativity: Option<usize>,
    /// Preset slice count (skips capacity measurement)
    pub slices: Option<usize>,
    /// Preset sets per slice
    pub sets_per_slice: Option<usize>,
    /// Preset probe buffer size
    pub buffer_size: Option<Size>,
}

impl Default for GeometryRequest {
    fn default() -> Self {
        GeometryRequest {
            mapping: MappingFunction::Linear,
            pages: PagePolicy::PreferHuge,
            associativity: None,
            slices: None,
            sets_per_slice: None,
            buffer_size: None,
        }
    }
}

/// Discovered cache geometry.
///
/// Computed once at preparation and immutable afterwards.
#[derive(Clone, Debug, Serialize)]
pub struct Geometry {
    /// Lines per cache set
    pub associativity: usize,
    /// Number of cache slices
    pub slices: usize,
    /// Sets per slice
    pub sets_per_slice: usize,
    /// Address-to-set mapping function in effect
    pub mapping: MappingFunction,
    /// Probe buffer size backing this geometry, in bytes
    pub buffer_size: usize,
}

/// XOR-parity masks selecting the physical address bits that feed each
/// slice-hash output bit (Maurice et al., reverse engineered Intel LLC
/// complex addressing).
const SLICE_HASH_MASKS: [u64; 3] = [0x1b5f575440, 0x2eb5faa880, 0x3cccc93100];

/// Slice index of a physical address under the XOR-parity hash.
///
/// Only defined for power-of-two slice counts up to 8.
pub fn slice_hash(phys: u64, slices: usize) -> usize {
    debug_assert!(supports_quadratic(slices));
    let bits = slices.trailing_zeros() as usize;
    let mut slice = 0usize;
    for (bit, mask) in SLICE_HASH_MASKS.iter().enumerate().take(bits) {
        slice |= (((phys & mask).count_ones() & 1) as usize) << bit;
    }
    slice
}

/// Whether the quadratic slice hash is defined for this slice count.
pub fn supports_quadratic(slices: usize) -> bool {
    slices.is_power_of_two() && slices <= 1 << SLICE_HASH_MASKS.len()
}

impl Geometry {
    /// Total number of distinguishable cache sets.
    pub fn total_sets(&self) -> usize {
        self.slices * self.sets_per_slice
    }

    /// Buffer size needed to give every cache set at least
    /// associativity + 1 lines, with one spare line of slack.
    pub fn required_buffer(&self) -> usize {
        self.total_sets() * CL_SIZE * (self.associativity + 2)
    }

    /// Cache set targeted by a physical address.
    pub fn set_for_phys(&self, phys: usize) -> usize {
        let line = phys >> CL_SHIFT;
        match self.mapping {
            MappingFunction::Linear => line % self.total_sets(),
            MappingFunction::Quadratic => {
                let set = line % self.sets_per_slice;
                slice_hash(phys as u64, self.slices) * self.sets_per_slice + set
            }
        }
    }

    /// Physical address bits that must be known to evaluate the mapping.
    pub fn span_bits(&self) -> u32 {
        match self.mapping {
            MappingFunction::Linear => {
                (self.total_sets() * CL_SIZE).next_power_of_two().trailing_zeros()
            }
            // The hash masks reach into the topmost physical bits.
            MappingFunction::Quadratic => usize::BITS,
        }
    }
}

/// Errors that can occur during geometry discovery.
#[derive(Debug, Error)]
pub enum GeometryError {
    /// Cached and evicted latencies never separated.
    #[error("latency calibration did not separate cached from evicted accesses in {0} rounds")]
    Threshold(usize),
    /// Conflict measurements stayed inconsistent across the retry bound.
    #[error("cache geometry discovery did not converge after {0} attempts")]
    NoConvergence(usize),
    /// The probe buffer ran out of congruent candidate lines.
    #[error("probe buffer exhausted after {0} congruent lines without self-eviction")]
    BufferExhausted(usize),
}

const CALIBRATION_ROUNDS: usize = 256;
const THRESHOLD_MIN_GAP: u64 = 30;
const EVICT_VOTES: usize = 9;
const DISCOVERY_RETRIES: usize = 10;

/// Timing prober that measures geometry over an allocated buffer.
pub(crate) struct Prober<'a, C: SerializingClock, F: LineFlush> {
    pub memory: &'a Memory,
    pub clock: &'a C,
    pub flush: &'a F,
    pub sets_per_slice: usize,
    pub progress: Option<&'a MultiProgress>,
}

/// Raw measurement results, before they are folded into a [`Geometry`].
pub(crate) struct Discovered {
    pub associativity: usize,
    pub slices: usize,
    pub threshold: u64,
}

impl<C: SerializingClock, F: LineFlush> Prober<'_, C, F> {
    /// Runs discovery, skipping whatever the presets pin down.
    pub fn discover(
        &self,
        preset_assoc: Option<usize>,
        preset_slices: Option<usize>,
    ) -> Result<Discovered, GeometryError> {
        let threshold = self.calibrate_threshold()?;
        if let (Some(associativity), Some(slices)) = (preset_assoc, preset_slices) {
            return Ok(Discovered {
                associativity,
                slices,
                threshold,
            });
        }

        let stride = self.sets_per_slice << CL_SHIFT;
        let limit = self.memory.len() / stride;
        for attempt in 1..=DISCOVERY_RETRIES {
            match self.measure_once(threshold, stride, limit, preset_assoc, preset_slices) {
                Ok(found) => {
                    debug!(
                        "geometry converged on attempt {}: {} ways, {} slices",
                        attempt, found.associativity, found.slices
                    );
                    return Ok(found);
                }
                Err(e) => warn!("geometry measurement attempt {} failed: {}", attempt, e),
            }
        }
        Err(GeometryError::NoConvergence(DISCOVERY_RETRIES))
    }

    /// Separates cached from evicted access latencies.
    ///
    /// Medians of repeated timed reads, once with the line resident and once
    /// freshly flushed; the threshold is the midpoint. Retried while the two
    /// medians are not clearly apart.
    fn calibrate_threshold(&self) -> Result<u64, GeometryError> {
        let probe = self.memory.addr(0) as *const u8;
        for _ in 0..DISCOVERY_RETRIES {
            let mut cached = vec![0u64; CALIBRATION_ROUNDS];
            unsafe { std::ptr::read_volatile(probe) };
            for slot in cached.iter_mut() {
                *slot = unsafe { timed_read(self.clock, probe) };
            }
            let mut flushed = vec![0u64; CALIBRATION_ROUNDS];
            for slot in flushed.iter_mut() {
                unsafe { self.flush.flush(probe) };
                self.flush.fence();
                *slot = unsafe { timed_read(self.clock, probe) };
            }
            let hit = median(&cached);
            let miss = median(&flushed);
            if miss > hit + THRESHOLD_MIN_GAP {
                let threshold = hit + (miss - hit) / 2;
                debug!(
                    "latency classifier: hit {} / miss {} -> threshold {}",
                    hit, miss, threshold
                );
                return Ok(threshold);
            }
            warn!(
                "latency calibration inconclusive (hit median {}, miss median {})",
                hit, miss
            );
        }
        Err(GeometryError::Threshold(DISCOVERY_RETRIES))
    }

    fn measure_once(
        &self,
        threshold: u64,
        stride: usize,
        limit: usize,
        preset_assoc: Option<usize>,
        preset_slices: Option<usize>,
    ) -> Result<Discovered, GeometryError> {
        let witness = self.memory.addr(0) as *const u8;

        let bar = self.progress.map(|p| {
            let bar = p.add(ProgressBar::new(limit as u64));
            bar.set_style(ProgressStyle::named_bar("Geometry discovery"));
            bar
        });

        // Grow a group of set-congruent lines until the witness stops
        // surviving alongside it. That group size is the co-residency
        // capacity of one set index: slices x associativity lines.
        let mut group: Vec<*const u8> = Vec::new();
        let mut capacity = None;
        for k in 1..limit {
            group.push(self.memory.addr(k * stride) as *const u8);
            if let Some(bar) = &bar {
                bar.set_position(k as u64);
            }
            if self.evicts(witness, &group, threshold) {
                capacity = Some(k);
                break;
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        let capacity = capacity.ok_or(GeometryError::BufferExhausted(limit))?;

        // The minimal evicting subset is exactly the witness's own set in
        // its own slice: one line per way.
        let associativity = match preset_assoc {
            Some(ways) => ways,
            None => self.reduce(witness, group, threshold).len(),
        };
        if associativity == 0 || capacity < associativity {
            return Err(GeometryError::NoConvergence(1));
        }
        let slices = match preset_slices {
            Some(slices) => slices,
            None => (capacity as f64 / associativity as f64).round().max(1.0) as usize,
        };
        Ok(Discovered {
            associativity,
            slices,
            threshold,
        })
    }

    /// Greedily drops lines whose removal keeps the group evicting the
    /// witness, leaving a minimal eviction set.
    fn reduce(&self, witness: *const u8, mut pool: Vec<*const u8>, threshold: u64) -> Vec<*const u8> {
        let mut needed: Vec<*const u8> = Vec::new();
        while let Some(candidate) = pool.pop() {
            let rest: Vec<*const u8> = needed.iter().chain(pool.iter()).copied().collect();
            if !self.evicts(witness, &rest, threshold) {
                needed.push(candidate);
            }
        }
        needed
    }

    /// Majority vote over repeated trials: does touching `lines` evict the
    /// witness? Access order is reshuffled per trial so the stride
    /// prefetcher cannot keep the witness alive artificially.
    fn evicts(&self, witness: *const u8, lines: &[*const u8], threshold: u64) -> bool {
        if lines.is_empty() {
            return false;
        }
        let mut order = lines.to_vec();
        let mut rng = rand::rng();
        let mut votes = 0;
        for _ in 0..EVICT_VOTES {
            unsafe { std::ptr::read_volatile(witness) };
            self.flush.fence();
            order.shuffle(&mut rng);
            for _ in 0..PRIME_PASSES {
                unsafe { touch(&order) };
            }
            self.flush.fence();
            if unsafe { timed_read(self.clock, witness) } > threshold {
                votes += 1;
            }
        }
        2 * votes > EVICT_VOTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(mapping: MappingFunction) -> Geometry {
        Geometry {
            associativity: 12,
            slices: 4,
            sets_per_slice: 2048,
            mapping,
            buffer_size: 0,
        }
    }

    #[test]
    fn total_sets_is_slices_times_sets_per_slice() {
        let g = geometry(MappingFunction::Linear);
        assert_eq!(g.total_sets(), 4 * 2048);
    }

    #[test]
    fn linear_mapping_extracts_set_bits() {
        let g = geometry(MappingFunction::Linear);
        assert_eq!(g.set_for_phys(0), 0);
        assert_eq!(g.set_for_phys(CL_SIZE), 1);
        // Offsets within one line land in the same set.
        assert_eq!(g.set_for_phys(CL_SIZE + 63), 1);
        // The set index wraps at the total set span.
        assert_eq!(g.set_for_phys(g.total_sets() * CL_SIZE), 0);
    }

    #[test]
    fn quadratic_mapping_keeps_set_index_and_hashes_slice() {
        let g = geometry(MappingFunction::Quadratic);
        let phys = 7 * CL_SIZE;
        let set = g.set_for_phys(phys);
        assert_eq!(set % g.sets_per_slice, 7);
        assert_eq!(set / g.sets_per_slice, slice_hash(phys as u64, 4));
    }

    #[test]
    fn slice_hash_is_xor_parity() {
        assert_eq!(slice_hash(0, 8), 0);
        // A single masked address bit flips the corresponding hash bit.
        let bit = SLICE_HASH_MASKS[0].trailing_zeros();
        assert_eq!(slice_hash(1u64 << bit, 2), 1);
        // Two masked bits cancel.
        let second = 1u64 << (63 - SLICE_HASH_MASKS[0].leading_zeros());
        assert_eq!(slice_hash((1u64 << bit) | second, 2), 0);
        for slices in [2usize, 4, 8] {
            assert!(slice_hash(0x1234_5678_9abc, slices) < slices);
        }
    }

    #[test]
    fn quadratic_support_is_power_of_two_up_to_eight() {
        assert!(supports_quadratic(1));
        assert!(supports_quadratic(2));
        assert!(supports_quadratic(8));
        assert!(!supports_quadratic(6));
        assert!(!supports_quadratic(16));
    }

    #[test]
    fn required_buffer_covers_every_set() {
        let g = geometry(MappingFunction::Linear);
        assert!(g.required_buffer() >= g.total_sets() * CL_SIZE * (g.associativity + 1));
    }
}

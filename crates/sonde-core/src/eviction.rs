//! Eviction set construction.
//!
//! Partitions the probe buffer into per-cache-set line groups. The groups
//! live in one arena (a flat address vector plus an index range per set) so
//! that the whole structure releases with the buffer and no per-set
//! allocations survive it.

use std::ops::Range;

use itertools::Itertools;
use log::{debug, warn};

use crate::geometry::Geometry;
use crate::memory::{BytePointer, Memory, PhysView};
use crate::util::CL_SIZE;

/// Per-cache-set eviction sets over one probe buffer.
///
/// A set is usable when it holds at least associativity + 1 lines: priming
/// that many congruent lines displaces any prior resident of the set no
/// matter which replacement policy the hardware runs. Undersized sets are
/// excluded from the monitorable universe rather than failing the session.
#[derive(Debug)]
pub struct EvictionSets {
    lines: Vec<*const u8>,
    spans: Vec<Option<Range<usize>>>,
}

impl EvictionSets {
    /// Builds eviction sets by mapping every line of the buffer to its
    /// target cache set.
    pub fn build(geometry: &Geometry, memory: &Memory, view: &PhysView) -> EvictionSets {
        let total = geometry.total_sets();
        // One spare line beyond the eviction minimum keeps a replacement
        // candidate available without growing the prime walk.
        let keep = geometry.associativity + 2;
        let mut groups: Vec<Vec<*const u8>> = vec![Vec::new(); total];
        for offset in (0..memory.len()).step_by(CL_SIZE) {
            let set = geometry.set_for_phys(view.phys(offset));
            let group = &mut groups[set];
            if group.len() < keep {
                group.push(memory.addr(offset) as *const u8);
            }
        }

        let minimum = geometry.associativity + 1;
        let mut lines = Vec::new();
        let mut spans = Vec::with_capacity(total);
        for (set, group) in groups.into_iter().enumerate() {
            if group.len() < minimum {
                spans.push(None);
                debug!(
                    "cache set {} unusable: {} of {} lines",
                    set,
                    group.len(),
                    minimum
                );
                continue;
            }
            let start = lines.len();
            lines.extend(group);
            spans.push(Some(start..lines.len()));
        }

        let unusable = spans.iter().filter(|span| span.is_none()).count();
        if unusable > 0 {
            warn!(
                "{} of {} cache sets have no usable eviction set",
                unusable, total
            );
        }
        EvictionSets { lines, spans }
    }

    /// Lines of one set's eviction set, or `None` if the set is unusable.
    pub fn lines(&self, set: usize) -> Option<&[*const u8]> {
        self.spans
            .get(set)?
            .as_ref()
            .map(|span| &self.lines[span.clone()])
    }

    /// Whether the set can be monitored.
    pub fn is_usable(&self, set: usize) -> bool {
        matches!(self.spans.get(set), Some(Some(_)))
    }

    /// Number of sets with a usable eviction set.
    pub fn usable_count(&self) -> usize {
        self.spans.iter().flatten().count()
    }

    /// Total number of cache sets covered (usable or not).
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether no sets are covered.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Distribution of eviction set sizes, for diagnostics.
    pub fn size_histogram(&self) -> Vec<(usize, usize)> {
        self.spans
            .iter()
            .flatten()
            .map(|span| span.len())
            .counts()
            .into_iter()
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MappingFunction;
    use crate::memory::PhysAddr;

    fn small_geometry() -> Geometry {
        Geometry {
            associativity: 2,
            slices: 2,
            sets_per_slice: 4,
            mapping: MappingFunction::Linear,
            buffer_size: 0,
        }
    }

    #[test]
    fn every_usable_set_has_at_least_ways_plus_one_lines() {
        let geometry = small_geometry();
        // 8 sets x 64 B span; 4 KB frames repeat the span 8 times, so each
        // set collects far more than associativity + 1 candidates.
        let memory = Memory::mmap(16 * 1024).expect("mmap failed");
        let view = PhysView::Aligned { frame_size: 4096 };
        let sets = EvictionSets::build(&geometry, &memory, &view);
        assert_eq!(sets.len(), 8);
        assert_eq!(sets.usable_count(), 8);
        for set in 0..8 {
            let lines = sets.lines(set).expect("usable");
            assert!(lines.len() >= geometry.associativity + 1);
        }
        memory.dealloc();
    }

    #[test]
    fn undersized_sets_are_flagged_not_fatal() {
        let geometry = small_geometry();
        // One 512-byte span gives each set exactly one line.
        let memory = Memory::mmap(4096).expect("mmap failed");
        let view = PhysView::Resolved {
            frame_size: 4096,
            bases: vec![PhysAddr::new(0)],
        };
        let short = Memory::new(memory.ptr(), 512);
        let sets = EvictionSets::build(&geometry, &short, &view);
        assert_eq!(sets.usable_count(), 0);
        for set in 0..8 {
            assert!(!sets.is_usable(set));
            assert!(sets.lines(set).is_none());
        }
        memory.dealloc();
    }

    #[test]
    fn lines_of_a_set_are_congruent_under_the_mapping() {
        let geometry = small_geometry();
        let memory = Memory::mmap(8192).expect("mmap failed");
        let view = PhysView::Resolved {
            frame_size: 4096,
            bases: vec![PhysAddr::new(0x40000), PhysAddr::new(0x90000)],
        };
        let sets = EvictionSets::build(&geometry, &memory, &view);
        for set in 0..sets.len() {
            let Some(lines) = sets.lines(set) else {
                continue;
            };
            for &line in lines {
                let offset = line as usize - memory.ptr() as usize;
                assert_eq!(geometry.set_for_phys(view.phys(offset)), set);
            }
        }
        memory.dealloc();
    }
}

//! Hugepage-backed probe buffer allocator.
//!
//! This crate provides an allocator that maps the probe buffer from the
//! hugetlb pool, giving the engine physically contiguous, aligned frames of
//! the system hugepage size (typically 2 MB). With frames that large, the
//! linear address-to-set mapping needs no external virtual-to-physical
//! translation at all. The hugepage size is detected from `/proc/meminfo`.
//!
//! Implements the [`sonde_core::allocator::ProbeBufferAllocator`] trait.
//!
//! # Platform Requirements
//!
//! - Linux with hugetlb pages reserved (`vm.nr_hugepages` or boot
//!   parameters)

#![warn(missing_docs)]

mod hugepage;

pub use hugepage::HugepageAllocator;

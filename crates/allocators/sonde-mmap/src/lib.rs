//! Small-page mmap probe buffer allocator.
//!
//! The fallback when hugetlb pages are not reserved: a plain anonymous
//! mapping of 4 KB pages. Physical contiguity is then only guaranteed per
//! page, so sessions built on this allocator need a
//! [`sonde_core::memory::VirtToPhysResolver`] for any mapping whose set
//! span exceeds a page.
//!
//! Implements the [`sonde_core::allocator::ProbeBufferAllocator`] trait.

#![warn(missing_docs)]

mod mmap;

pub use mmap::MmapAllocator;

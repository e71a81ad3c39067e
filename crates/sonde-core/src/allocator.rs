//! Probe buffer allocation strategies.
//!
//! This module defines the [`ProbeBufferAllocator`] trait implemented by the
//! page-policy-specific allocator crates. The engine itself never chooses a
//! page size; it asks the allocator for a buffer and for the physical
//! contiguity granule that buffer guarantees.

use crate::memory::Memory;
use crate::util::Size;

/// Trait for allocation strategies that provide probe buffers.
///
/// Implementors define how the large buffer backing a session's eviction
/// sets is obtained. The key difference between strategies is the physical
/// contiguity granule: huge pages give the engine enough known physical
/// address bits to place cache sets without any external translation, while
/// small pages leave only the page offset known and require a pagemap
/// resolver on top.
///
/// # Associated Types
///
/// * `Error` - The error type returned by allocation operations. Must implement [`std::error::Error`].
pub trait ProbeBufferAllocator {
    /// The error type returned by allocation operations.
    type Error: std::error::Error;

    /// Returns the physical contiguity granule of buffers from this
    /// allocator.
    ///
    /// Every chunk of this size, aligned to this size, is guaranteed
    /// physically contiguous and aligned (e.g. 2 MB for hugepages, 4 KB for
    /// plain mmap).
    fn frame_size(&self) -> Size;

    /// Allocates a probe buffer of at least `size` bytes.
    ///
    /// The returned region must be resident (populated) on return.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing pages cannot be obtained.
    fn alloc(&mut self, size: Size) -> Result<Memory, Self::Error>;
}

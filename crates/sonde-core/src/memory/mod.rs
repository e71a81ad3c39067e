//! Memory management for probe buffers.
//!
//! The `memory` module provides the following abstractions:
//! - [`Memory`]: a managed memory region backing one session's eviction sets.
//! - [`BytePointer`]: a trait for accessing memory as a byte pointer.
//! - [`PhysView`]: what is known about the physical layout of a buffer.
//! - [`VirtToPhysResolver`]: a trait for resolving physical addresses,
//!   injected where small-page buffers need per-page translation.
//! - [`LinuxPageMap`]: resolver implementation over `/proc/self/pagemap`.

mod virt_to_phys;

pub use self::virt_to_phys::{LinuxPageMap, PhysAddr, ResolveError, VirtToPhysResolver};

use std::ptr::null_mut;

use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_SHARED};
use log::debug;

/// Trait for accessing memory as a byte pointer.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the memory region exists.
    /// Dereferencing requires unsafe code.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// A managed memory region.
///
/// Backs one session's probe buffer. Mapped with `MAP_POPULATE` so every
/// page is resident before the first timed access; a page fault inside a
/// probe loop would invalidate the whole sample.
#[derive(Debug)]
pub struct Memory {
    /// Region pointer
    ptr: *mut u8,
    /// Region length in bytes
    len: usize,
}

unsafe impl Send for Memory {}

impl Memory {
    /// Wraps an already mapped region.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Allocates a region of small pages using mmap.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(ptr, 0x5a, size) };
        debug!("mapped {} byte probe buffer at {:p}", size, ptr);
        Ok(Memory::new(ptr as *mut u8, size))
    }

    /// Deallocates the region.
    ///
    /// Unmaps the memory using munmap. Consumes self.
    pub fn dealloc(self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "offset {} out of bounds for {} byte region",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }
    fn ptr(&self) -> *mut u8 {
        self.ptr
    }
    fn len(&self) -> usize {
        self.len
    }
}

/// What is known about the physical layout of a probe buffer.
///
/// The eviction-set builder maps buffer offsets to cache sets through the
/// physical address. How much of that address is actually known depends on
/// the allocator and on whether a pagemap resolver was supplied.
#[derive(Debug)]
pub enum PhysView {
    /// Each `frame_size`-aligned chunk of the buffer is physically
    /// contiguous and aligned; only frame-relative address bits are known.
    ///
    /// Within one frame the unknown high bits are constant, so the known
    /// low bits identify the cache set correctly as long as the whole set
    /// range fits inside a frame.
    Aligned {
        /// Physical contiguity granule in bytes
        frame_size: usize,
    },
    /// Full physical base address resolved for every frame.
    Resolved {
        /// Physical contiguity granule in bytes
        frame_size: usize,
        /// Physical base address per frame, in buffer order
        bases: Vec<PhysAddr>,
    },
}

impl PhysView {
    /// Resolves the physical base of every frame of `memory`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pagemap query fails for any frame.
    pub fn resolve(
        memory: &Memory,
        frame_size: usize,
        resolver: &mut dyn VirtToPhysResolver,
    ) -> Result<PhysView, ResolveError> {
        let mut bases = Vec::with_capacity(memory.len().div_ceil(frame_size));
        for offset in (0..memory.len()).step_by(frame_size) {
            bases.push(resolver.get_phys(memory.addr(offset) as u64)?);
        }
        Ok(PhysView::Resolved { frame_size, bases })
    }

    /// Returns the physical address bits known for the given buffer offset.
    ///
    /// For [`PhysView::Aligned`] this is the frame-relative part only.
    pub fn phys(&self, offset: usize) -> usize {
        match self {
            PhysView::Aligned { frame_size } => offset % frame_size,
            PhysView::Resolved { frame_size, bases } => {
                bases[offset / frame_size].as_usize() + offset % frame_size
            }
        }
    }

    /// Number of physical address bits this view can produce reliably.
    pub fn known_bits(&self) -> u32 {
        match self {
            PhysView::Aligned { frame_size } => frame_size.trailing_zeros(),
            PhysView::Resolved { .. } => usize::BITS,
        }
    }
}

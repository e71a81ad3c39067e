//! Cache line flush capability.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_mfence};

use thiserror::Error;

/// Errors that can occur when constructing a line-flush capability.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlushError {
    /// No cache line flush instruction is available on this platform.
    #[error("no cache line flush instruction available on this platform")]
    UnsupportedPlatform,
}

/// Evicts individual cache lines from every cache level.
pub trait LineFlush {
    /// Constructs the flush capability.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError::UnsupportedPlatform`] if the architecture has
    /// no userspace line flush instruction.
    fn new() -> Result<Self, FlushError>
    where
        Self: Sized;

    /// Flushes the line containing `addr` from all cache levels.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads.
    unsafe fn flush(&self, addr: *const u8);

    /// Orders all preceding flushes and memory accesses before any later ones.
    fn fence(&self);
}

/// Line flush based on the x86_64 `clflush` instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClflushLine;

impl LineFlush for ClflushLine {
    #[cfg(target_arch = "x86_64")]
    fn new() -> Result<Self, FlushError> {
        Ok(ClflushLine)
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn new() -> Result<Self, FlushError> {
        Err(FlushError::UnsupportedPlatform)
    }

    unsafe fn flush(&self, addr: *const u8) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            _mm_clflush(addr);
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = addr;
            unreachable!("ClflushLine cannot be constructed on this platform")
        }
    }

    fn fence(&self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            _mm_mfence();
        }
        #[cfg(not(target_arch = "x86_64"))]
        unreachable!("ClflushLine cannot be constructed on this platform")
    }
}

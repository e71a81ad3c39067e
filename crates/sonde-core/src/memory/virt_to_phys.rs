use std::fmt::{Debug, Formatter};

use log::warn;
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

use crate::util::{PAGE_MASK, PAGE_SHIFT};

/// Physical memory address.
///
/// The eviction-set builder evaluates the address-to-set mapping over
/// values of this type; the newtype keeps them from mixing with virtual
/// addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Wraps a raw physical address.
    pub const fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the raw address value.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysAddr(0x{:x})", self.0)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

/// Errors that can happen during physical address resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The pagemap interface reported an error.
    #[error(transparent)]
    Pagemap(#[from] PageMapError),
    /// The kernel returned an unexpected number of entries for one page.
    #[error("pagemap returned {entries} entries for the page at 0x{virt:x}")]
    Ambiguous {
        /// Queried virtual address
        virt: u64,
        /// Number of entries returned
        entries: usize,
    },
}

/// Trait for resolving virtual addresses to physical addresses.
///
/// Small-page buffers need per-page translation before eviction sets can be
/// built from them. The mechanism is platform-privileged, so it is injected
/// rather than assumed; tests supply synthetic resolvers.
pub trait VirtToPhysResolver {
    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if address translation fails.
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, ResolveError>;
}

/// Virtual to physical address translator using Linux pagemap.
///
/// Queries `/proc/{pid}/pagemap` for page frame numbers. The kernel hides
/// frame numbers from unprivileged processes, so this resolver is only
/// useful when running as root.
pub struct LinuxPageMap {
    pagemap: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Opens the pagemap of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, ResolveError> {
        Self::for_process(std::process::id())
    }

    /// Opens the pagemap of the process with the given pid.
    ///
    /// # Errors
    ///
    /// Returns an error if opening the process pagemap fails.
    pub fn for_process(pid: u32) -> Result<LinuxPageMap, ResolveError> {
        Ok(LinuxPageMap {
            pagemap: pagemap2::PageMap::new(pid as u64)?,
        })
    }
}

impl VirtToPhysResolver for LinuxPageMap {
    fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, ResolveError> {
        let page = virt & !(PAGE_MASK as u64);
        let vma = VirtualMemoryArea::from((page, page + PAGE_MASK as u64));
        let entries = self.pagemap.pagemap_vma(&vma)?;
        if entries.len() != 1 {
            return Err(ResolveError::Ambiguous {
                virt,
                entries: entries.len(),
            });
        }
        let pfn = entries[0].pfn()?;
        if pfn == 0 {
            warn!(
                "pagemap hides the frame number for 0x{:x}; resolution needs root",
                virt
            );
        }
        Ok(PhysAddr(
            ((pfn << PAGE_SHIFT) as usize) | (virt as usize & PAGE_MASK),
        ))
    }
}

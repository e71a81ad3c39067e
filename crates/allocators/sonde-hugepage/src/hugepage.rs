use std::ptr::null_mut;

use lazy_static::lazy_static;
use libc::{MAP_ANONYMOUS, MAP_HUGETLB, MAP_POPULATE, MAP_SHARED};
use log::debug;
use sonde_core::allocator::ProbeBufferAllocator;
use sonde_core::memory::Memory;
use sonde_core::util::Size;

// The hugepage size is whatever /proc/meminfo advertises, e.g.
//   Hugepagesize:    2048 kB
// (see Documentation/vm/hugetlbpage.txt).

const MEMINFO_PATH: &str = "/proc/meminfo";

lazy_static! {
    static ref HUGEPAGE_SIZE: Option<usize> = {
        let meminfo = std::fs::read_to_string(MEMINFO_PATH).unwrap_or_default();
        parse_hugepage_size(&meminfo)
    };
}

fn parse_hugepage_size(meminfo: &str) -> Option<usize> {
    let line = meminfo.lines().find(|l| l.starts_with("Hugepagesize:"))?;
    let mut fields = line["Hugepagesize:".len()..].split_whitespace();
    let value: usize = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") => Some(value * 1024),
        None => Some(value),
        Some(_) => None,
    }
}

/// Hugepage-backed probe buffer allocator.
///
/// Maps anonymous hugetlb memory with `MAP_HUGETLB`; every hugepage-sized,
/// hugepage-aligned chunk of the buffer is physically contiguous. The
/// hugepage size is detected once from `/proc/meminfo`.
///
/// # Implementation
///
/// Implements [`sonde_core::allocator::ProbeBufferAllocator`] with the
/// system hugepage size as frame size.
///
/// # Platform Requirements
///
/// - Hugetlb pages must be reserved (`vm.nr_hugepages`), otherwise the
///   mapping fails with `ENOMEM`
#[derive(Debug, Default, Copy, Clone)]
pub struct HugepageAllocator {}

impl ProbeBufferAllocator for HugepageAllocator {
    type Error = std::io::Error;

    fn frame_size(&self) -> Size {
        // Nominal 2 MB when /proc/meminfo advertises nothing; alloc fails
        // with Unsupported in that case before the value matters.
        Size::B(HUGEPAGE_SIZE.unwrap_or(2 << 20))
    }

    fn alloc(&mut self, size: Size) -> Result<Memory, Self::Error> {
        let frame = HUGEPAGE_SIZE.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no hugepage size advertised in /proc/meminfo",
            )
        })?;
        let bytes = size.round_up(frame).bytes();
        let p = unsafe {
            libc::mmap(
                null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_HUGETLB | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(p, 0x5a, bytes) };
        debug!("mapped {} bytes of hugetlb memory at {:p}", bytes, p);
        Ok(Memory::new(p as *mut u8, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonde_core::memory::BytePointer;

    #[test]
    fn test_parse_hugepage_size() {
        assert_eq!(parse_hugepage_size("Hugepagesize:    2048 kB"), Some(2 << 20));
        assert_eq!(parse_hugepage_size("Hugepagesize:1024"), Some(1024));
        // A glued unit does not parse.
        assert_eq!(parse_hugepage_size("Hugepagesize: 2kB"), None);
        assert_eq!(parse_hugepage_size("MemTotal: 16 GB"), None);
    }

    #[test]
    #[ignore] // needs reserved hugetlb pages
    fn test_allocator() {
        let mut alloc = HugepageAllocator::default();
        let frame = alloc.frame_size().bytes();
        let mem = alloc.alloc(Size::B(frame)).expect("allocation failed");
        assert!(mem.len() >= frame);
        unsafe {
            *mem.ptr() = 20;
            assert_eq!(*mem.ptr(), 20);
        }
        mem.dealloc();
    }
}

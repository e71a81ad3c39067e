use log::debug;
use sonde_core::allocator::ProbeBufferAllocator;
use sonde_core::memory::{BytePointer, Memory};
use sonde_core::util::{PAGE_SIZE, Size};

/// Small-page probe buffer allocator.
///
/// Wraps an anonymous populated mmap. Frames are single 4 KB pages.
#[derive(Debug, Default, Copy, Clone)]
pub struct MmapAllocator {}

impl ProbeBufferAllocator for MmapAllocator {
    type Error = std::io::Error;

    fn frame_size(&self) -> Size {
        Size::B(PAGE_SIZE)
    }

    fn alloc(&mut self, size: Size) -> Result<Memory, Self::Error> {
        let bytes = size.round_up(PAGE_SIZE).bytes();
        let memory = Memory::mmap(bytes)?;
        debug!("mapped {} bytes of small pages", memory.len());
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_to_pages() {
        let mut alloc = MmapAllocator::default();
        let mem = alloc.alloc(Size::B(100)).expect("allocation failed");
        assert_eq!(mem.len(), PAGE_SIZE);
        mem.dealloc();
    }
}

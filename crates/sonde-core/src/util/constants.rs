/// Cache line shift value (6 bits) for 64-byte lines
pub const CL_SHIFT: usize = 6;
/// Cache line size (64 bytes) for x86_64
pub const CL_SIZE: usize = 1 << CL_SHIFT;

/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of rounds for cycle-counter overhead calibration
pub const TIMER_ROUNDS: usize = 100_000;

/// Sets per last-level-cache slice when no override is given
pub const SETS_PER_SLICE_DEFAULT: usize = 2048;

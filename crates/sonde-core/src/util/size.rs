/// Memory size in one of the common binary units.
///
/// Buffer sizes move through the framework as `Size` values so that call
/// sites read naturally and unit mistakes cannot happen. All multipliers
/// are base-2 (1 KB = 1024 bytes).
///
/// # Examples
///
/// ```
/// use sonde_core::util::Size;
///
/// assert_eq!(Size::KB(8).bytes(), 8192);
/// assert_eq!(Size::MB(32).bytes(), 32 << 20);
/// ```
#[derive(Clone, Copy, Debug)]
pub enum Size {
    /// Size in bytes
    B(usize),
    /// Size in kilobytes (1 KB = 1024 bytes)
    KB(usize),
    /// Size in megabytes (1 MB = 1024 KB)
    MB(usize),
    /// Size in gigabytes (1 GB = 1024 MB)
    GB(usize),
}

impl Size {
    /// Converts this size to bytes.
    pub const fn bytes(&self) -> usize {
        match self {
            Size::B(n) => *n,
            Size::KB(n) => *n << 10,
            Size::MB(n) => *n << 20,
            Size::GB(n) => *n << 30,
        }
    }

    /// Rounds this size up to the next multiple of `granule` bytes.
    pub const fn round_up(&self, granule: usize) -> Size {
        Size::B(self.bytes().div_ceil(granule) * granule)
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (value, unit) = match self {
            Size::B(n) => (n, "B"),
            Size::KB(n) => (n, "KB"),
            Size::MB(n) => (n, "MB"),
            Size::GB(n) => (n, "GB"),
        };
        write!(f, "{} {}", value, unit)
    }
}

#[cfg(test)]
mod tests {
    use crate::util::Size;

    #[test]
    fn size_conversions() {
        assert_eq!(Size::B(12).bytes(), 12);
        assert_eq!(Size::KB(3).bytes(), 3072);
        assert_eq!(Size::MB(12).bytes(), 12 << 20);
        assert_eq!(Size::GB(2).bytes(), 2 << 30);
    }

    #[test]
    fn size_round_up() {
        assert_eq!(Size::B(1).round_up(4096).bytes(), 4096);
        assert_eq!(Size::B(4096).round_up(4096).bytes(), 4096);
        assert_eq!(Size::KB(5).round_up(4096).bytes(), 8192);
    }
}

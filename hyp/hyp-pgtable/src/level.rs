use hyp_info::memory::{LAST_LEVEL, MAX_VA_BITS, MIN_VA_BITS, PAGE_SHIFT};

/// Bits of virtual address resolved per translation level.
const BITS_PER_LEVEL: u32 = 9;

/// A translation level of the 4 KiB-granule regime, `0..=3`.
///
/// Level 3 holds pages, levels 1 and 2 may hold blocks, level 0 only points
/// to tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(u8);

impl Level {
    pub const LAST: Self = Self(LAST_LEVEL);

    #[inline]
    #[must_use]
    pub const fn new(level: u8) -> Option<Self> {
        if level <= LAST_LEVEL {
            Some(Self(level))
        } else {
            None
        }
    }

    /// Level of the root table for a VA space of `va_bits` bits.
    ///
    /// Each level resolves 9 bits above the 12-bit page offset, so 48 bits
    /// start at level 0 and 25..=30 bits start at level 2.
    #[must_use]
    pub const fn start_for_va_bits(va_bits: u8) -> Option<Self> {
        if va_bits < MIN_VA_BITS || va_bits > MAX_VA_BITS {
            return None;
        }
        let levels = (va_bits as u32 - 4) / BITS_PER_LEVEL;
        Some(Self((LAST_LEVEL as u32 + 1 - levels) as u8))
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_last(self) -> bool {
        self.0 == LAST_LEVEL
    }

    /// Whether a block descriptor is architecturally allowed here.
    #[inline]
    #[must_use]
    pub const fn supports_block(self) -> bool {
        self.0 == 1 || self.0 == 2
    }

    /// Whether any leaf (block or page) may live at this level.
    #[inline]
    #[must_use]
    pub const fn allows_leaf(self) -> bool {
        self.supports_block() || self.is_last()
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        if self.is_last() { None } else { Some(Self(self.0 + 1)) }
    }

    /// Position of the lowest VA bit this level resolves.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        PAGE_SHIFT + BITS_PER_LEVEL * (LAST_LEVEL - self.0) as u32
    }

    /// Bytes covered by one entry of a table at this level.
    #[inline]
    #[must_use]
    pub const fn granule(self) -> u64 {
        1 << self.shift()
    }

    /// Index of the entry covering `va` in a table at this level.
    #[inline]
    #[must_use]
    pub const fn index(self, va: u64) -> usize {
        ((va >> self.shift()) & ((1 << BITS_PER_LEVEL) - 1)) as usize
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

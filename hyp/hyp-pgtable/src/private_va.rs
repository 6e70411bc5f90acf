use crate::error::PgtableError;
use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{VirtRange, VirtualAddress};

/// Bump allocator over the guardian's private VA window.
///
/// Hands out page-aligned VA ranges for mappings that do not live in the
/// linear map, such as per-CPU stacks. Ranges are never returned.
#[derive(Debug)]
pub struct PrivateVaRange {
    next: VirtualAddress,
    end: VirtualAddress,
}

impl PrivateVaRange {
    #[must_use]
    pub const fn new(window: VirtRange) -> Self {
        Self {
            next: window.start(),
            end: window.end(),
        }
    }

    /// Reserve `size` bytes, rounded up to whole pages.
    ///
    /// # Errors
    /// [`PgtableError::OutOfMemory`] when the window is exhausted.
    pub fn alloc(&mut self, size: u64) -> Result<VirtRange, PgtableError> {
        let size = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(PgtableError::InvalidArgument("private VA size"))?;
        let range = VirtRange::new(self.next, size).ok_or(PgtableError::OutOfMemory)?;
        if range.end() > self.end {
            return Err(PgtableError::OutOfMemory);
        }
        self.next = range.end();
        Ok(range)
    }

    /// Remaining bytes in the window.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.end.checked_offset_from(self.next).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_consecutive_ranges_until_exhausted() {
        let window = VirtRange::new(VirtualAddress::new(0xC0_0000_0000), 4 * PAGE_SIZE).unwrap();
        let mut va = PrivateVaRange::new(window);

        let a = va.alloc(2 * PAGE_SIZE).unwrap();
        let b = va.alloc(1).unwrap();
        assert_eq!(a.start(), window.start());
        assert_eq!(b.start(), a.end());
        assert_eq!(b.size(), PAGE_SIZE);
        assert_eq!(va.remaining(), PAGE_SIZE);
        assert_eq!(va.alloc(2 * PAGE_SIZE), Err(PgtableError::OutOfMemory));
        assert!(va.alloc(PAGE_SIZE).is_ok());
    }
}

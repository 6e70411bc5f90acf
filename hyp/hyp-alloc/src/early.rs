//! Bump allocator used while the guardian builds its own page table.
//!
//! No vmemmap exists yet, so nothing is reference counted and nothing is
//! ever freed. [`EarlyAllocator::pages_used`] is later handed to the pool
//! allocator as its reserved page count.

use crate::error::AllocError;
use hyp_info::memory::PAGE_SIZE;
use hyp_memory_addresses::{PhysRange, PhysicalAddress, PhysicalPage, Size4K};
use hyp_pgtable::FrameAlloc;

/// Hands out monotonically increasing page ranges from one backing range.
#[derive(Debug, Default)]
pub struct EarlyAllocator {
    base: PhysicalAddress,
    cur: PhysicalAddress,
    end: PhysicalAddress,
    initialized: bool,
}

impl EarlyAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: PhysicalAddress::zero(),
            cur: PhysicalAddress::zero(),
            end: PhysicalAddress::zero(),
            initialized: false,
        }
    }

    /// Configure the backing range.
    ///
    /// # Errors
    /// - [`AllocError::AlreadyInitialized`] unless [`reset`](Self::reset) ran since the last call.
    /// - [`AllocError::InvalidArgument`] if the range is not page aligned.
    pub fn init(&mut self, range: PhysRange) -> Result<(), AllocError> {
        if self.initialized {
            return Err(AllocError::AlreadyInitialized);
        }
        if !range.is_aligned::<Size4K>() {
            return Err(AllocError::InvalidArgument("early allocator range"));
        }
        self.base = range.start();
        self.cur = range.start();
        self.end = range.end();
        self.initialized = true;
        Ok(())
    }

    /// Forget the backing range so that [`init`](Self::init) may run again.
    pub const fn reset(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The next `n_pages` pages.
    ///
    /// # Errors
    /// - [`AllocError::OutOfMemory`] if fewer pages remain or the allocator
    ///   was never initialized.
    /// - [`AllocError::InvalidArgument`] for a zero-page request.
    pub fn alloc_contiguous(&mut self, n_pages: u64) -> Result<PhysRange, AllocError> {
        if !self.initialized {
            return Err(AllocError::OutOfMemory);
        }
        if n_pages == 0 {
            return Err(AllocError::InvalidArgument("zero pages"));
        }
        let range = PhysRange::from_pages(self.cur, n_pages).ok_or(AllocError::OutOfMemory)?;
        if range.end() > self.end {
            return Err(AllocError::OutOfMemory);
        }
        self.cur = range.end();
        Ok(range)
    }

    /// One page.
    ///
    /// # Errors
    /// [`AllocError::OutOfMemory`] when exhausted.
    pub fn alloc_page(&mut self) -> Result<PhysicalPage<Size4K>, AllocError> {
        Ok(self.alloc_contiguous(1)?.start().page())
    }

    /// Pages handed out since [`init`](Self::init).
    #[must_use]
    pub fn pages_used(&self) -> u64 {
        self.cur.checked_offset_from(self.base).unwrap_or(0) / PAGE_SIZE
    }

    #[must_use]
    pub fn pages_remaining(&self) -> u64 {
        self.end.checked_offset_from(self.cur).unwrap_or(0) / PAGE_SIZE
    }
}

impl FrameAlloc for EarlyAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_page().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: u64) -> PhysRange {
        PhysRange::from_pages(PhysicalAddress::new(0x4000_0000), pages).unwrap()
    }

    #[test]
    fn hands_out_increasing_ranges() {
        let mut early = EarlyAllocator::new();
        early.init(pool(8)).unwrap();
        let a = early.alloc_contiguous(3).unwrap();
        let b = early.alloc_page().unwrap();
        assert_eq!(a.start(), PhysicalAddress::new(0x4000_0000));
        assert_eq!(b.base(), a.end());
        assert_eq!(early.pages_used(), 4);
        assert_eq!(early.pages_remaining(), 4);
    }

    #[test]
    fn refuses_oversized_requests_without_consuming() {
        let mut early = EarlyAllocator::new();
        early.init(pool(4)).unwrap();
        assert_eq!(early.alloc_contiguous(5), Err(AllocError::OutOfMemory));
        assert_eq!(early.pages_used(), 0);
        assert!(early.alloc_contiguous(4).is_ok());
        assert_eq!(early.alloc_4k(), None);
    }

    #[test]
    fn double_init_requires_reset() {
        let mut early = EarlyAllocator::new();
        assert_eq!(early.alloc_page(), Err(AllocError::OutOfMemory));
        early.init(pool(4)).unwrap();
        assert_eq!(early.init(pool(4)), Err(AllocError::AlreadyInitialized));
        early.reset();
        assert!(!early.is_initialized());
        assert_eq!(early.init(pool(2)), Ok(()));
    }

    #[test]
    fn rejects_unaligned_backing() {
        let mut early = EarlyAllocator::new();
        let range = PhysRange::new(PhysicalAddress::new(0x4000_0800), 0x2000).unwrap();
        assert!(matches!(early.init(range), Err(AllocError::InvalidArgument(_))));
    }
}

#[cfg(test)]
mod fuzz {
    use super::*;
    use quickcheck::QuickCheck;

    #[test]
    fn allocations_are_disjoint_and_increasing() {
        fn prop(requests: Vec<u8>) -> bool {
            let backing = PhysRange::from_pages(PhysicalAddress::new(0x8000_0000), 256).unwrap();
            let mut early = EarlyAllocator::new();
            if early.init(backing).is_err() {
                return false;
            }
            let mut last_end = backing.start();
            let mut used = 0;
            for n in requests {
                let n = u64::from(n % 32);
                match early.alloc_contiguous(n) {
                    Ok(range) => {
                        if range.start() != last_end || range.page_count() != n || n == 0 {
                            return false;
                        }
                        last_end = range.end();
                        used += n;
                    }
                    Err(AllocError::OutOfMemory) => {
                        if used + n <= 256 {
                            return false;
                        }
                    }
                    Err(AllocError::InvalidArgument(_)) => {
                        if n != 0 {
                            return false;
                        }
                    }
                    Err(_) => return false,
                }
            }
            early.pages_used() == used && last_end <= backing.end()
        }
        QuickCheck::new()
            .tests(200)
            .quickcheck(prop as fn(Vec<u8>) -> bool);
    }
}
